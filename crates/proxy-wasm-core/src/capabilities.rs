//! Capability allow-list for host functions and guest callbacks.
//!
//! A capability is the bare name of an import or export, such as
//! `proxy_log`, `fd_write`, or `proxy_on_request_headers`. A VM either
//! grants everything or exactly the listed names. Denied imports are still
//! linked, but to a stub that traps; denied exports are never called.

use std::collections::HashSet;

/// The set of capabilities granted to a VM.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Capabilities {
    /// Every capability is granted.
    #[default]
    All,
    /// Only the listed capabilities are granted.
    Only(HashSet<String>),
}

impl Capabilities {
    /// Grant every capability.
    pub fn all() -> Self {
        Self::All
    }

    /// Grant nothing.
    pub fn none() -> Self {
        Self::Only(HashSet::new())
    }

    /// Create a builder for an explicit allow-list.
    pub fn builder() -> CapabilitiesBuilder {
        CapabilitiesBuilder::default()
    }

    /// Build from an optional configuration list; `None` grants everything.
    pub fn from_list<I, S>(list: Option<I>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        match list {
            Some(names) => Self::Only(names.into_iter().map(Into::into).collect()),
            None => Self::All,
        }
    }

    /// Check whether `name` is granted.
    pub fn is_allowed(&self, name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(names) => names.contains(name),
        }
    }
}

/// Builder for [`Capabilities::Only`].
#[derive(Debug, Default)]
pub struct CapabilitiesBuilder {
    names: HashSet<String>,
}

impl CapabilitiesBuilder {
    /// Grant one capability.
    #[must_use]
    pub fn allow(mut self, name: impl Into<String>) -> Self {
        self.names.insert(name.into());
        self
    }

    /// Grant several capabilities.
    #[must_use]
    pub fn allow_all<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.names.extend(names.into_iter().map(Into::into));
        self
    }

    /// Build the allow-list.
    pub fn build(self) -> Capabilities {
        Capabilities::Only(self.names)
    }
}
