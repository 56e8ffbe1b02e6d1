//! Error types for the orchestration engine
//!
//! Two families exist. [`EngineError`] is returned synchronously from engine
//! commands and lifecycle calls: unknown identifiers, malformed addresses,
//! invalid digits, missing sessions and bounded provider calls that failed or
//! timed out. [`ProviderError`] is what a Signaling Provider reports; on
//! asynchronous paths (registration, dialing, accepting) it never reaches a
//! caller and is turned into a `failed`/`disconnected` event instead.

use thiserror::Error;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Result type for Signaling Provider operations
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors returned by engine commands and lifecycle operations
#[derive(Debug, Error)]
pub enum EngineError {
    /// No account with this identity exists (disabled accounts never do)
    #[error("account {account:?} not found")]
    AccountNotFound { account: String },

    /// No call with this identifier exists
    #[error("call {call_id:?} not found")]
    CallNotFound { call_id: String },

    /// Answer/reject was issued for an outbound call
    #[error("call {call_id:?} is not an inbound call")]
    NotInbound { call_id: String },

    /// The call no longer owns a session handle
    #[error("call {call_id:?} has no active session")]
    NoActiveSession { call_id: String },

    /// Digit outside `0-9 * # A-D`
    #[error("invalid DTMF digit {digit:?}")]
    InvalidDigit { digit: char },

    /// The address does not parse as a SIP URI
    #[error("invalid SIP URI {uri:?}: {reason}")]
    InvalidUri { uri: String, reason: String },

    /// A bounded provider operation did not complete in time
    #[error("{operation} timed out after {seconds} seconds")]
    Timeout { operation: &'static str, seconds: u64 },

    /// The inbound listener could not be started
    #[error("failed to start inbound listener: {0}")]
    Listener(#[source] ProviderError),

    /// `start` was called on an engine that is already running
    #[error("engine already started")]
    AlreadyStarted,

    /// Provider error surfaced through a synchronous command
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl EngineError {
    /// Create an account-not-found error
    pub fn account_not_found(account: impl Into<String>) -> Self {
        Self::AccountNotFound {
            account: account.into(),
        }
    }

    /// Create a call-not-found error
    pub fn call_not_found(call_id: impl Into<String>) -> Self {
        Self::CallNotFound {
            call_id: call_id.into(),
        }
    }

    /// Create a not-an-inbound-call error
    pub fn not_inbound(call_id: impl Into<String>) -> Self {
        Self::NotInbound {
            call_id: call_id.into(),
        }
    }

    /// Create a no-active-session error
    pub fn no_active_session(call_id: impl Into<String>) -> Self {
        Self::NoActiveSession {
            call_id: call_id.into(),
        }
    }

    /// Create an invalid URI error
    pub fn invalid_uri(uri: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidUri {
            uri: uri.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error reports a missing account or call
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::AccountNotFound { .. } | Self::CallNotFound { .. }
        )
    }
}

/// Errors reported by a Signaling Provider
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The network or transport failed
    #[error("transport error: {message}")]
    Transport { message: String },

    /// The remote side answered with a final error response
    #[error("rejected with {code} {reason}")]
    Rejected { code: u16, reason: String },

    /// The dialog is already gone
    #[error("session terminated")]
    SessionTerminated,

    /// Media/playback failure
    #[error("media error: {message}")]
    Media { message: String },

    /// Anything else the provider wants to report
    #[error("{message}")]
    Other { message: String },
}

impl ProviderError {
    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a rejection error
    pub fn rejected(code: u16, reason: impl Into<String>) -> Self {
        Self::Rejected {
            code,
            reason: reason.into(),
        }
    }

    /// Create a media error
    pub fn media(message: impl Into<String>) -> Self {
        Self::Media {
            message: message.into(),
        }
    }

    /// Create a generic provider error
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }
}
