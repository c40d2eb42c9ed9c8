//! SPIFFE ID type and parsing.
//!
//! Every identity in the fleet is a URI of the form
//! `spiffe://<trust-domain>/<workload-name>`. The trust domain is fixed at
//! CA initialization and namespaces all identities.
//!
//! # Example
//!
//! ```
//! use veil_identity::SpiffeId;
//!
//! let id = SpiffeId::new("example.org", "photo-service").unwrap();
//! assert_eq!(id.to_uri(), "spiffe://example.org/photo-service");
//!
//! let parsed = SpiffeId::parse("spiffe://example.org/photo-service").unwrap();
//! assert_eq!(parsed.trust_domain(), "example.org");
//! assert_eq!(parsed.workload_name(), "photo-service");
//! ```

use crate::{Error, Result};
use std::fmt;

/// A SPIFFE identity for a workload within a trust domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpiffeId {
    trust_domain: String,
    workload_name: String,
}

impl SpiffeId {
    /// Creates an identity from a trust domain and workload name, validating
    /// both components.
    pub fn new(
        trust_domain: impl Into<String>,
        workload_name: impl Into<String>,
    ) -> Result<Self> {
        let trust_domain = trust_domain.into();
        let workload_name = workload_name.into();

        validate_trust_domain(&trust_domain)?;
        validate_workload_name(&workload_name)?;

        Ok(Self {
            trust_domain,
            workload_name,
        })
    }

    /// Parses a SPIFFE URI of the form `spiffe://<trust-domain>/<workload-name>`.
    pub fn parse(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix("spiffe://")
            .ok_or_else(|| Error::InvalidSpiffeId("must start with spiffe://".to_string()))?;

        let (trust_domain, workload_name) = rest
            .split_once('/')
            .ok_or_else(|| Error::InvalidSpiffeId("missing workload path".to_string()))?;

        Self::new(trust_domain, workload_name)
    }

    /// Returns the URI representation of this identity.
    pub fn to_uri(&self) -> String {
        format!("spiffe://{}/{}", self.trust_domain, self.workload_name)
    }

    /// Returns the trust domain.
    pub fn trust_domain(&self) -> &str {
        &self.trust_domain
    }

    /// Returns the workload name.
    pub fn workload_name(&self) -> &str {
        &self.workload_name
    }

    /// Checks if this identity belongs to the given trust domain.
    pub fn is_in_trust_domain(&self, trust_domain: &str) -> bool {
        self.trust_domain == trust_domain
    }
}

/// Validates a trust domain label: non-empty, alphanumeric plus hyphen and dot.
fn validate_trust_domain(trust_domain: &str) -> Result<()> {
    if trust_domain.is_empty() {
        return Err(Error::InvalidSpiffeId("empty trust domain".to_string()));
    }
    if !trust_domain
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return Err(Error::InvalidSpiffeId(format!(
            "invalid trust domain characters: {trust_domain}"
        )));
    }
    Ok(())
}

/// Validates a workload name segment.
///
/// Only `[a-zA-Z0-9.-_]` is allowed. This naturally rejects path traversal,
/// percent-encoding, slashes, control characters and injection characters.
fn validate_workload_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidSpiffeId("empty workload name".to_string()));
    }
    if name.len() > 253 {
        return Err(Error::InvalidSpiffeId(format!(
            "workload name exceeds maximum length (253 bytes): {} bytes",
            name.len()
        )));
    }
    if name == "." || name == ".." {
        return Err(Error::InvalidSpiffeId(format!(
            "workload name cannot be a relative path modifier: {name}"
        )));
    }
    if name.starts_with('.') {
        return Err(Error::InvalidSpiffeId(format!(
            "workload name cannot start with dot: {name}"
        )));
    }
    for c in name.chars() {
        if !c.is_ascii_alphanumeric() && c != '.' && c != '-' && c != '_' {
            return Err(Error::InvalidSpiffeId(format!(
                "workload name contains invalid character '{}' (only a-zA-Z0-9.-_ allowed): {name}",
                if c.is_control() {
                    format!("\\x{:02x}", c as u32)
                } else {
                    c.to_string()
                }
            )));
        }
    }
    Ok(())
}

impl fmt::Display for SpiffeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_uri())
    }
}

impl std::str::FromStr for SpiffeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
