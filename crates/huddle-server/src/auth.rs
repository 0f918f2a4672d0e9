//! Auth collaborator.
//!
//! Credential checking is out of scope for the chat engine; the upgrade
//! handler only needs a display name for the session. The session handle
//! is taken from `Authorization: Bearer <token>` or a `?token=` query
//! parameter and passed to an [`Authenticator`].

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use axum::http::{HeaderMap, header};
use thiserror::Error;
use uuid::Uuid;

/// Why a session was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No session token was presented and anonymous access is off.
    #[error("missing session token")]
    MissingToken,
    /// The token is not known.
    #[error("unknown session token")]
    UnknownToken,
}

/// Resolves a session handle to the display name used in messages.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Look up the display name for `handle` (`None` if none was sent).
    async fn display_name(&self, handle: Option<&str>) -> Result<String, AuthError>;
}

/// Fixed token table, typically loaded from settings.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, String>,
    allow_anonymous: bool,
}

impl StaticTokenAuthenticator {
    /// Build from a token to display name table.
    pub fn new(tokens: impl IntoIterator<Item = (String, String)>, allow_anonymous: bool) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
            allow_anonymous,
        }
    }

    /// Build from the settings token map.
    pub fn from_settings(settings: &huddle_settings::AuthSettings) -> Self {
        let tokens: &BTreeMap<String, String> = &settings.tokens;
        Self::new(tokens.clone(), settings.allow_anonymous)
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn display_name(&self, handle: Option<&str>) -> Result<String, AuthError> {
        match handle {
            Some(token) => self
                .tokens
                .get(token)
                .cloned()
                .ok_or(AuthError::UnknownToken),
            None if self.allow_anonymous => Ok(anonymous_name()),
            None => Err(AuthError::MissingToken),
        }
    }
}

/// `anonymous-` followed by eight hex digits.
fn anonymous_name() -> String {
    let id = Uuid::now_v7().simple().to_string();
    // the tail of a v7 UUID is random; the head is the timestamp
    format!("anonymous-{}", &id[id.len() - 8..])
}

/// Extract the session handle from the upgrade request.
///
/// The `Authorization` header wins over the query parameter. Blank values
/// count as absent.
pub fn session_handle(headers: &HeaderMap, query: &HashMap<String, String>) -> Option<String> {
    let from_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    let from_query = query
        .get("token")
        .map(|t| t.trim())
        .filter(|t| !t.is_empty());
    from_header.or(from_query).map(str::to_owned)
}
