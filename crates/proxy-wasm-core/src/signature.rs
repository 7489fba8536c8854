//! Verification of embedded module signatures.
//!
//! A signed module ends with a custom section named `signature_wasmsign`
//! whose payload is a little-endian `u32` algorithm id (2 = ed25519) followed
//! by a 64-byte signature over
//! `SHA-512("WasmSignature" || u32 0 || module without that section)`.

use ed25519_dalek::{Signature, VerifyingKey};
use proxy_wasm_common::BytecodeError;
use sha2::{Digest, Sha512};

use crate::bytecode::{self, encode_custom_section};

/// Name of the custom section carrying the signature.
pub const SIGNATURE_SECTION: &str = "signature_wasmsign";

const ALG_ED25519: u32 = 2;
const PAYLOAD_LEN: usize = 4 + 64;
const DOMAIN: &[u8] = b"WasmSignature";

/// Digest the signature is computed over.
pub fn signed_digest(unsigned_module: &[u8]) -> [u8; 64] {
    let mut hasher = Sha512::new();
    hasher.update(DOMAIN);
    hasher.update(0_u32.to_le_bytes());
    hasher.update(unsigned_module);
    let mut digest = [0; 64];
    digest.copy_from_slice(&hasher.finalize());
    digest
}

/// Check that `bytecode` carries a valid signature by `public_key`.
pub fn verify_signature(bytecode: &[u8], public_key: &[u8; 32]) -> Result<(), BytecodeError> {
    let sections = bytecode::sections(bytecode)?;
    let last = sections
        .last()
        .filter(|section| section.name == Some(SIGNATURE_SECTION))
        .ok_or_else(|| signature_error("module is not signed"))?;

    if last.payload.len() != PAYLOAD_LEN {
        return Err(signature_error(format!(
            "signature section has {} bytes, expected {PAYLOAD_LEN}",
            last.payload.len()
        )));
    }
    let (alg, raw_signature) = last.payload.split_at(4);
    let alg = u32::from_le_bytes([alg[0], alg[1], alg[2], alg[3]]);
    if alg != ALG_ED25519 {
        return Err(signature_error(format!("unsupported algorithm id {alg}")));
    }

    let key = VerifyingKey::from_bytes(public_key)
        .map_err(|e| signature_error(format!("invalid public key: {e}")))?;
    let signature = Signature::from_slice(raw_signature)
        .map_err(|e| signature_error(format!("malformed signature: {e}")))?;

    let digest = signed_digest(&bytecode[..last.range.start]);
    key.verify_strict(&digest, &signature)
        .map_err(|_| signature_error("signature does not match"))
}

/// Build the signature section for a module given a raw ed25519 signature
/// over [`signed_digest`].
pub fn encode_signature_section(signature: &[u8; 64]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(PAYLOAD_LEN);
    payload.extend_from_slice(&ALG_ED25519.to_le_bytes());
    payload.extend_from_slice(signature);
    encode_custom_section(SIGNATURE_SECTION, &payload)
}

fn signature_error(reason: impl Into<String>) -> BytecodeError {
    BytecodeError::Signature {
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::{Signer, SigningKey};

    use super::*;

    const MODULE: &[u8] = &[0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00];

    fn sign(module: &[u8], key: &SigningKey) -> Vec<u8> {
        let signature = key.sign(&signed_digest(module));
        let mut signed = module.to_vec();
        signed.extend(encode_signature_section(&signature.to_bytes()));
        signed
    }

    #[test]
    fn test_valid_signature() {
        let key = SigningKey::from_bytes(&[7; 32]);
        let signed = sign(MODULE, &key);

        assert!(verify_signature(&signed, &key.verifying_key().to_bytes()).is_ok());
    }

    #[test]
    fn test_wrong_key() {
        let key = SigningKey::from_bytes(&[7; 32]);
        let other = SigningKey::from_bytes(&[9; 32]);
        let signed = sign(MODULE, &key);

        assert!(verify_signature(&signed, &other.verifying_key().to_bytes()).is_err());
    }

    #[test]
    fn test_tampered_module() {
        let key = SigningKey::from_bytes(&[7; 32]);
        let mut signed = sign(MODULE, &key);
        signed.splice(8..8, encode_custom_section("extra", b"x"));

        assert!(verify_signature(&signed, &key.verifying_key().to_bytes()).is_err());
    }

    #[test]
    fn test_unsigned_module() {
        let key = SigningKey::from_bytes(&[7; 32]);
        let err = verify_signature(MODULE, &key.verifying_key().to_bytes()).unwrap_err();
        assert!(matches!(err, BytecodeError::Signature { .. }));
    }
}
