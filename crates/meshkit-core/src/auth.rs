//! Auth token header codec.
//!
//! The auth service itself is an external collaborator; what belongs
//! here is the header shape every subsystem agrees on:
//! `authorization: <TokenType> <AccessToken>`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::Metadata;

/// Canonical header key. [`Metadata`] reads are case-insensitive, so
/// `Authorization` is accepted on the way in.
pub const AUTHORIZATION_HEADER: &str = "authorization";

/// An OAuth-shaped access token.
///
/// Only `token_type` and `access_token` travel in headers; the rest is
/// filled by whoever introspects the token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    pub token_type: String,
    /// Unix seconds; zero when unknown.
    #[serde(default)]
    pub expires_at: i64,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Token {
    /// Parses the authorization header out of `metadata`.
    ///
    /// Returns a partial token (type and access token only), or `None`
    /// when the header is absent or not of the `<type> <token>` shape.
    pub fn from_metadata(metadata: &Metadata) -> Option<Token> {
        let header = metadata.get(AUTHORIZATION_HEADER)?;
        let (token_type, access_token) = header.split_once(' ')?;
        if token_type.is_empty() || access_token.is_empty() {
            return None;
        }
        Some(Token {
            access_token: access_token.to_string(),
            token_type: token_type.to_string(),
            ..Token::default()
        })
    }

    /// Writes the authorization header into `metadata`.
    pub fn write_metadata(&self, metadata: &mut Metadata) {
        metadata.set(
            AUTHORIZATION_HEADER,
            format!("{} {}", self.token_type, self.access_token),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn round_trips_through_metadata() {
        let token = Token {
            access_token: "abc123".into(),
            token_type: "Bearer".into(),
            ..Token::default()
        };

        let mut md = Metadata::new();
        token.write_metadata(&mut md);

        assert_eq!(Token::from_metadata(&md), Some(token));
    }

    #[test]
    fn reads_capitalised_header() {
        let mut md = Metadata::new();
        md.set("Authorization", "Bearer abc123");

        let token = Token::from_metadata(&md).unwrap();
        assert_eq!(token.token_type, "Bearer");
        assert_eq!(token.access_token, "abc123");
    }

    #[test_case(""; "empty")]
    #[test_case("Bearer"; "no token")]
    #[test_case(" abc"; "no type")]
    fn rejects_malformed(header: &str) {
        let mut md = Metadata::new();
        md.set(AUTHORIZATION_HEADER, header);
        assert_eq!(Token::from_metadata(&md), None);
    }
}
