//! SPIFFE URI value object.

use std::cmp::Ordering;
use std::fmt;

use crate::domain::TrustDomain;
use crate::errors::{IdPlaneError, Result};

const SCHEME_PREFIX: &str = "spiffe://";

/// A normalized SPIFFE identity: `spiffe://<trust-domain><path>`.
///
/// The path is `/` for the trust-domain root, or a `/`-separated sequence
/// of non-empty segments with no `.`/`..` traversal and no `//`. Equality
/// is value-wise on trust domain and path; ordering is lexicographic on
/// the canonical rendering.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpiffeId {
    trust_domain: TrustDomain,
    path: String,
}

impl SpiffeId {
    /// Parse a SPIFFE URI.
    ///
    /// Fails when the input is empty, does not use the `spiffe` scheme,
    /// misses the host, carries userinfo, a port, a query, or a fragment,
    /// or when the path contains traversal segments or double slashes.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(IdPlaneError::invalid_identity(input, "URI is empty"));
        }
        let rest = trimmed
            .strip_prefix(SCHEME_PREFIX)
            .ok_or_else(|| IdPlaneError::invalid_identity(input, "scheme must be 'spiffe'"))?;

        if trimmed.contains('?') {
            return Err(IdPlaneError::invalid_identity(input, "query component not allowed"));
        }
        if trimmed.contains('#') {
            return Err(IdPlaneError::invalid_identity(input, "fragment component not allowed"));
        }

        let (authority, raw_path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };

        if authority.is_empty() {
            return Err(IdPlaneError::invalid_identity(input, "missing host"));
        }
        if authority.contains('@') {
            return Err(IdPlaneError::invalid_identity(input, "userinfo not allowed"));
        }
        if authority.contains(':') {
            return Err(IdPlaneError::invalid_identity(input, "port not allowed"));
        }

        let trust_domain = TrustDomain::parse(authority).map_err(|e| {
            IdPlaneError::invalid_identity(input, format!("bad trust domain: {}", e))
        })?;

        let path = Self::normalize_path(input, raw_path)?;
        Ok(SpiffeId { trust_domain, path })
    }

    /// Normalize a path: leading `/` guaranteed, single trailing `/`
    /// stripped (except root), traversal and empty segments rejected.
    fn normalize_path(input: &str, raw: &str) -> Result<String> {
        if raw == "/" {
            return Ok("/".to_string());
        }
        // A single trailing slash is normalization, a double one is an
        // empty segment and is rejected below.
        let trimmed = raw.strip_suffix('/').unwrap_or(raw);
        if trimmed.is_empty() {
            return Ok("/".to_string());
        }

        for segment in trimmed[1..].split('/') {
            match segment {
                "" => {
                    return Err(IdPlaneError::invalid_identity(input, "empty path segment"));
                }
                "." | ".." => {
                    return Err(IdPlaneError::invalid_identity(
                        input,
                        "path traversal segment not allowed",
                    ));
                }
                _ => {}
            }
        }
        Ok(trimmed.to_string())
    }

    /// The identity's trust domain.
    pub fn trust_domain(&self) -> &TrustDomain {
        &self.trust_domain
    }

    /// The normalized path (`/` for the trust-domain root).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether this identity names the trust-domain root.
    pub fn is_root(&self) -> bool {
        self.path == "/"
    }

    /// A human-facing short name: the last non-empty path segment, or the
    /// trust-domain name for root identities.
    pub fn display_name(&self) -> String {
        self.path
            .rsplit('/')
            .find(|segment| !segment.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| self.trust_domain.name().to_string())
    }
}

impl fmt::Display for SpiffeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", SCHEME_PREFIX, self.trust_domain, self.path)
    }
}

impl std::str::FromStr for SpiffeId {
    type Err = IdPlaneError;

    fn from_str(s: &str) -> Result<Self> {
        SpiffeId::parse(s)
    }
}

impl PartialOrd for SpiffeId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SpiffeId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_string().cmp(&other.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_workload_identity() {
        let id = SpiffeId::parse("spiffe://example.org/ns/prod/server").unwrap();
        assert_eq!(id.trust_domain().name(), "example.org");
        assert_eq!(id.path(), "/ns/prod/server");
        assert_eq!(id.to_string(), "spiffe://example.org/ns/prod/server");
        assert!(!id.is_root());
    }

    #[test]
    fn parses_root_identity() {
        let id = SpiffeId::parse("spiffe://example.org").unwrap();
        assert_eq!(id.path(), "/");
        assert!(id.is_root());
        assert_eq!(id.to_string(), "spiffe://example.org/");
        // Canonical rendering reparses to the same value.
        assert_eq!(SpiffeId::parse(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn strips_whitespace_and_trailing_slash() {
        let id = SpiffeId::parse("  spiffe://example.org/server/  ").unwrap();
        assert_eq!(id.path(), "/server");
    }

    #[test]
    fn lowercases_trust_domain_only() {
        let id = SpiffeId::parse("spiffe://EXAMPLE.org/Server").unwrap();
        assert_eq!(id.trust_domain().name(), "example.org");
        assert_eq!(id.path(), "/Server");
    }

    #[test]
    fn rejects_wrong_scheme_and_empty() {
        assert!(SpiffeId::parse("").is_err());
        assert!(SpiffeId::parse("https://example.org/x").is_err());
        assert!(SpiffeId::parse("spiffe:/example.org/x").is_err());
        assert!(SpiffeId::parse("spiffe://").is_err());
    }

    #[test]
    fn rejects_authority_extras() {
        assert!(SpiffeId::parse("spiffe://user@example.org/x").is_err());
        assert!(SpiffeId::parse("spiffe://example.org:8443/x").is_err());
        assert!(SpiffeId::parse("spiffe://example.org/x?y=1").is_err());
        assert!(SpiffeId::parse("spiffe://example.org/x#frag").is_err());
    }

    #[test]
    fn rejects_traversal_and_double_slash() {
        assert!(SpiffeId::parse("spiffe://example.org/a/../b").is_err());
        assert!(SpiffeId::parse("spiffe://example.org/a/./b").is_err());
        assert!(SpiffeId::parse("spiffe://example.org//a").is_err());
        assert!(SpiffeId::parse("spiffe://example.org/a//b").is_err());
    }

    #[test]
    fn normalization_is_idempotent() {
        for input in
            ["spiffe://example.org/a/b", "spiffe://Example.Org/a/", "spiffe://example.org"]
        {
            let once = SpiffeId::parse(input).unwrap();
            let twice = SpiffeId::parse(&once.to_string()).unwrap();
            assert_eq!(once.to_string(), twice.to_string());
        }
    }

    #[test]
    fn display_name_rules() {
        assert_eq!(SpiffeId::parse("spiffe://example.org/ns/server").unwrap().display_name(), "server");
        assert_eq!(SpiffeId::parse("spiffe://example.org").unwrap().display_name(), "example.org");
    }

    #[test]
    fn ordering_matches_rendering() {
        let a = SpiffeId::parse("spiffe://example.org/a").unwrap();
        let b = SpiffeId::parse("spiffe://example.org/b").unwrap();
        let c = SpiffeId::parse("spiffe://other.org/a").unwrap();
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a.cmp(&a), Ordering::Equal);
    }
}
