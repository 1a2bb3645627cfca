//! Token validation primitives.
//!
//! Tokens are opaque strings; only their SHA-256 hash is stored or cached.
//! Issuance and rotation happen outside this service — here we only validate
//! and attach the resulting identity to the request.

use sha2::{Digest, Sha256};

/// Identity attached to requests authenticated with a user token.
#[derive(Debug, Clone, Copy)]
pub struct UserIdentity {
    pub user_id: i64,
    pub tenant_id: i64,
}

/// Identity attached to requests authenticated with an agent token.
#[derive(Debug, Clone, Copy)]
pub struct AgentIdentity {
    pub tenant_id: i64,
}

/// Hex-encoded SHA-256 of a raw token.
pub fn hash_token(raw: &str) -> String {
    let digest = Sha256::digest(raw.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Extract the token from an `Authorization: Bearer ...` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, rest) = header.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = rest.trim();
    if token.is_empty() { None } else { Some(token) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_hex() {
        let hash = hash_token("secret-token");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_token("secret-token"));
        assert_ne!(hash, hash_token("secret-token2"));
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn bearer_parsing() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("bearer abc"), Some("abc"));
        assert_eq!(bearer_token("Bearer   abc  "), Some("abc"));
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token("Bearer "), None);
        assert_eq!(bearer_token(""), None);
    }
}
