//! Shared-secret token gating every controller RPC endpoint.
//!
//! The token is generated once per session on the test-process side and handed
//! to the controller subprocess through its environment. It travels on the
//! wire only as a query parameter / request field.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Random shared secret for one controller session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(String);

impl Token {
    /// Generate a fresh random token (256 bits of UUID material).
    pub fn generate() -> Self {
        Self(format!(
            "{}{}",
            Uuid::new_v4().simple(),
            Uuid::new_v4().simple()
        ))
    }

    /// Wrap an existing secret, e.g. one read from the child environment.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Constant-time comparison against a candidate secret.
    ///
    /// Compares SHA-256 digests byte for byte without early exit, so neither
    /// the length nor a matching prefix of the candidate leaks through timing.
    pub fn matches(&self, candidate: &str) -> bool {
        let expected = Sha256::digest(self.0.as_bytes());
        let provided = Sha256::digest(candidate.as_bytes());
        expected
            .iter()
            .zip(provided.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl std::fmt::Display for Token {
    /// Redacted; tokens must never end up in logs verbatim.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<token:{}b>", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_are_distinct() {
        let a = Token::generate();
        let b = Token::generate();
        assert_ne!(a.as_str(), b.as_str());
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn matches_own_secret() {
        let token = Token::generate();
        assert!(token.matches(token.as_str()));
    }

    #[test]
    fn rejects_other_secrets() {
        let token = Token::generate();
        assert!(!token.matches("wrong"));
        assert!(!token.matches(""));
        assert!(!token.matches(Token::generate().as_str()));
    }

    #[test]
    fn display_never_reveals_secret() {
        let token = Token::from_string("super-secret-value");
        let shown = token.to_string();
        assert!(!shown.contains("super-secret-value"));
    }

    #[test]
    fn serde_is_transparent() {
        let token = Token::from_string("abc123");
        let json = serde_json::to_string(&token).unwrap();
        assert_eq!(json, "\"abc123\"");
        let back: Token = serde_json::from_str(&json).unwrap();
        assert!(back.matches("abc123"));
    }
}
