//! Enumerations exchanged with guest modules across the Proxy-Wasm ABI.
//!
//! Every value here crosses the host/guest boundary as a plain integer, so
//! each enum is `#[repr(u32)]` and converts from a raw `u64` with
//! [`TryFrom`]. Out-of-range values are rejected; callers decide whether that
//! means `BadArgument` or a clamped status.

use std::fmt;

use tracing::level_filters::LevelFilter;

macro_rules! abi_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $value:expr ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        $vis enum $name {
            $( $(#[$vmeta])* $variant = $value ),+
        }

        impl $name {
            /// Largest raw value accepted by this enum.
            pub const MAX: u32 = {
                let mut max = 0;
                $( if $value > max { max = $value; } )+
                max
            };

            /// Raw ABI value.
            pub const fn as_u32(self) -> u32 {
                self as u32
            }
        }

        impl TryFrom<u64> for $name {
            type Error = u64;

            fn try_from(value: u64) -> Result<Self, u64> {
                match value {
                    $( v if v == $value => Ok(Self::$variant), )+
                    other => Err(other),
                }
            }
        }
    };
}

/// ABI version advertised by a module through a `proxy_abi_version_*` export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbiVersion {
    /// `proxy_abi_version_0_1_0`
    V0_1_0,
    /// `proxy_abi_version_0_2_0`
    V0_2_0,
    /// `proxy_abi_version_0_2_1`
    V0_2_1,
    /// No recognized marker export.
    Unknown,
}

impl AbiVersion {
    /// Map a marker export name to its version.
    pub fn from_export_name(name: &str) -> Option<Self> {
        match name {
            "proxy_abi_version_0_1_0" => Some(Self::V0_1_0),
            "proxy_abi_version_0_2_0" => Some(Self::V0_2_0),
            "proxy_abi_version_0_2_1" => Some(Self::V0_2_1),
            _ => None,
        }
    }

    /// Whether this is one of the 0.2.x revisions.
    pub fn is_v0_2(self) -> bool {
        matches!(self, Self::V0_2_0 | Self::V0_2_1)
    }
}

impl fmt::Display for AbiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V0_1_0 => write!(f, "0.1.0"),
            Self::V0_2_0 => write!(f, "0.2.0"),
            Self::V0_2_1 => write!(f, "0.2.1"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

abi_enum! {
    /// Guest log severity.
    pub enum LogLevel {
        Trace = 0,
        Debug = 1,
        Info = 2,
        Warn = 3,
        Error = 4,
        Critical = 5,
    }
}

impl LogLevel {
    /// Most verbose guest level that the given host filter still lets through.
    pub fn from_level_filter(filter: LevelFilter) -> Self {
        if filter >= LevelFilter::TRACE {
            Self::Trace
        } else if filter >= LevelFilter::DEBUG {
            Self::Debug
        } else if filter >= LevelFilter::INFO {
            Self::Info
        } else if filter >= LevelFilter::WARN {
            Self::Warn
        } else if filter >= LevelFilter::ERROR {
            Self::Error
        } else {
            Self::Critical
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        };
        f.write_str(name)
    }
}

abi_enum! {
    /// Result of network filter callbacks.
    pub enum FilterStatus {
        Continue = 0,
        StopIteration = 1,
    }
}

abi_enum! {
    /// Result of header callbacks.
    pub enum FilterHeadersStatus {
        Continue = 0,
        StopIteration = 1,
        ContinueAndEndStream = 2,
        StopAllIterationAndBuffer = 3,
        StopAllIterationAndWatermark = 4,
    }
}

abi_enum! {
    /// Result of metadata callbacks.
    pub enum FilterMetadataStatus {
        Continue = 0,
    }
}

abi_enum! {
    /// Result of trailer callbacks.
    pub enum FilterTrailersStatus {
        Continue = 0,
        StopIteration = 1,
    }
}

abi_enum! {
    /// Result of body callbacks.
    pub enum FilterDataStatus {
        Continue = 0,
        StopIterationAndBuffer = 1,
        StopIterationAndWatermark = 2,
        StopIterationNoBuffer = 3,
    }
}

abi_enum! {
    /// Header and metadata maps a guest can address.
    pub enum HeaderMapType {
        RequestHeaders = 0,
        RequestTrailers = 1,
        ResponseHeaders = 2,
        ResponseTrailers = 3,
        GrpcReceiveInitialMetadata = 4,
        GrpcReceiveTrailingMetadata = 5,
        HttpCallResponseHeaders = 6,
        HttpCallResponseTrailers = 7,
    }
}

abi_enum! {
    /// Byte buffers a guest can address.
    pub enum BufferType {
        HttpRequestBody = 0,
        HttpResponseBody = 1,
        NetworkDownstreamData = 2,
        NetworkUpstreamData = 3,
        HttpCallResponseBody = 4,
        GrpcReceiveBuffer = 5,
        VmConfiguration = 6,
        PluginConfiguration = 7,
        CallData = 8,
    }
}

abi_enum! {
    /// Halves of a stream the guest can continue or close.
    pub enum StreamType {
        Request = 0,
        Response = 1,
        Downstream = 2,
        Upstream = 3,
    }
}

abi_enum! {
    /// Kinds of host metrics.
    pub enum MetricType {
        Counter = 0,
        Gauge = 1,
        Histogram = 2,
    }
}

abi_enum! {
    /// Which peer closed a network connection.
    pub enum CloseType {
        Unknown = 0,
        Local = 1,
        Remote = 2,
    }
}

/// gRPC status code as reported to `proxy_on_grpc_close`.
pub type GrpcStatus = u32;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_from_in_range() {
        assert_eq!(LogLevel::try_from(4), Ok(LogLevel::Error));
        assert_eq!(HeaderMapType::try_from(7), Ok(HeaderMapType::HttpCallResponseTrailers));
        assert_eq!(BufferType::try_from(8), Ok(BufferType::CallData));
        assert_eq!(StreamType::try_from(3), Ok(StreamType::Upstream));
    }

    #[test]
    fn test_try_from_out_of_range() {
        assert_eq!(HeaderMapType::try_from(8), Err(8));
        assert_eq!(BufferType::try_from(9), Err(9));
        assert_eq!(FilterHeadersStatus::try_from(999), Err(999));
    }

    #[test]
    fn test_max_values() {
        assert_eq!(FilterHeadersStatus::MAX, 4);
        assert_eq!(FilterDataStatus::MAX, 3);
        assert_eq!(FilterTrailersStatus::MAX, 1);
        assert_eq!(FilterMetadataStatus::MAX, 0);
        assert_eq!(HeaderMapType::MAX, 7);
        assert_eq!(BufferType::MAX, 8);
    }

    #[test]
    fn test_abi_version_from_export() {
        assert_eq!(
            AbiVersion::from_export_name("proxy_abi_version_0_2_1"),
            Some(AbiVersion::V0_2_1)
        );
        assert_eq!(AbiVersion::from_export_name("proxy_abi_version_9_9_9"), None);
        assert!(AbiVersion::V0_2_0.is_v0_2());
        assert!(!AbiVersion::V0_1_0.is_v0_2());
        assert_eq!(AbiVersion::V0_1_0.to_string(), "0.1.0");
    }

    #[test]
    fn test_log_level_from_filter() {
        assert_eq!(LogLevel::from_level_filter(LevelFilter::TRACE), LogLevel::Trace);
        assert_eq!(LogLevel::from_level_filter(LevelFilter::INFO), LogLevel::Info);
        assert_eq!(LogLevel::from_level_filter(LevelFilter::ERROR), LogLevel::Error);
        assert_eq!(LogLevel::from_level_filter(LevelFilter::OFF), LogLevel::Critical);
    }
}
