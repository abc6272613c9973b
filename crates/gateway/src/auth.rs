//! Token extraction and the authenticator seam.
//!
//! Verification itself is an external collaborator's job; the shipped
//! default accepts any non-empty token so the gateway runs standalone.

use async_trait::async_trait;
use thiserror::Error;

/// Authenticated caller identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Principal {
    pub subject: String,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing auth token")]
    Missing,
    #[error("auth token rejected")]
    Rejected,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<Principal, AuthError>;
}

/// Accepts any non-empty token.
pub struct AcceptNonEmpty;

#[async_trait]
impl Authenticator for AcceptNonEmpty {
    async fn authenticate(&self, token: &str) -> Result<Principal, AuthError> {
        if token.trim().is_empty() {
            Err(AuthError::Rejected)
        } else {
            Ok(Principal {
                subject: "anonymous".into(),
            })
        }
    }
}

/// Pull the token out of the query string (`?token=...`) or an
/// `Authorization: Bearer` header.
pub fn extract_token(query_token: Option<&str>, authorization: Option<&str>) -> Option<String> {
    if let Some(token) = query_token {
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    if let Some(header) = authorization {
        if let Some(bearer) = header.strip_prefix("Bearer ") {
            if !bearer.is_empty() {
                return Some(bearer.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_token_wins() {
        let token = extract_token(Some("abc"), Some("Bearer xyz"));
        assert_eq!(token.as_deref(), Some("abc"));
    }

    #[test]
    fn bearer_header_is_a_fallback() {
        let token = extract_token(None, Some("Bearer xyz"));
        assert_eq!(token.as_deref(), Some("xyz"));
    }

    #[test]
    fn missing_token_everywhere() {
        assert!(extract_token(None, None).is_none());
        assert!(extract_token(Some(""), Some("Basic zzz")).is_none());
    }

    #[tokio::test]
    async fn non_empty_token_is_accepted() {
        let auth = AcceptNonEmpty;
        assert!(auth.authenticate("anything").await.is_ok());
    }

    #[tokio::test]
    async fn blank_token_is_rejected() {
        let auth = AcceptNonEmpty;
        assert_eq!(auth.authenticate("  ").await, Err(AuthError::Rejected));
    }
}
