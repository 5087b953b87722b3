//! SFU boundary: token acquisition and call peeking.
//!
//! The actual HTTP client, request framing and encryption live outside this
//! crate. The engine only consumes the [`SfuConnection`] trait and the typed
//! peek response.

mod call_state;

pub use call_state::{GroupCallState, ParticipantDescription, ParticipantId};

use crate::types::CallId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const HTTP_STATUS_OK: u16 = 200;
pub const HTTP_STATUS_TOKEN_INVALID: u16 = 401;
pub const HTTP_STATUS_NOT_FOUND: u16 = 404;

#[derive(Debug, Error)]
pub enum SfuError {
    #[error("could not obtain sfu token: {0}")]
    Auth(String),

    #[error("sfu request failed: {0}")]
    Network(String),

    #[error("sfu request timed out")]
    Timeout,

    #[error("invalid call state: {0}")]
    InvalidCallState(String),
}

impl From<prost::DecodeError> for SfuError {
    fn from(e: prost::DecodeError) -> Self {
        Self::InvalidCallState(e.to_string())
    }
}

/// Credentials for talking to an SFU, including the base urls this account
/// is allowed to use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SfuToken {
    pub sfu_base_url: String,
    pub allowed_base_urls: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

impl SfuToken {
    /// A base url is acceptable when it matches one of the allowed prefixes.
    pub fn is_allowed_base_url(&self, base_url: &str) -> bool {
        self.allowed_base_urls
            .iter()
            .any(|allowed| base_url.starts_with(allowed.as_str()))
    }
}

/// Payload of a successful peek.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeekResponseBody {
    /// Milliseconds since the unix epoch, as observed by the SFU.
    pub started_at: u64,
    pub max_participants: u32,
    /// Opaque until decrypted with the gck-derived state key; decodes into
    /// [`GroupCallState`] afterwards.
    pub encrypted_call_state: Option<Vec<u8>>,
}

/// Raw outcome of a peek request.
#[derive(Debug, Clone, PartialEq)]
pub struct PeekResponse {
    pub status_code: u16,
    pub body: Option<PeekResponseBody>,
}

impl PeekResponse {
    pub fn is_http_ok(&self) -> bool {
        self.status_code == HTTP_STATUS_OK
    }

    pub fn is_http_not_found(&self) -> bool {
        self.status_code == HTTP_STATUS_NOT_FOUND
    }

    pub fn is_token_invalid(&self) -> bool {
        self.status_code == HTTP_STATUS_TOKEN_INVALID
    }
}

/// Connection to the selective forwarding unit.
#[async_trait]
pub trait SfuConnection: Send + Sync {
    /// Obtain (or refresh) the SFU credentials for this account.
    async fn obtain_token(&self, force_refresh: bool) -> Result<SfuToken, SfuError>;

    /// Query the status of a call without joining media.
    async fn peek(
        &self,
        token: &SfuToken,
        sfu_base_url: &str,
        call_id: &CallId,
    ) -> Result<PeekResponse, SfuError>;
}
