/// Errors produced by the session subsystem.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A broker operation ran before [`IdentityBroker::initialize`](crate::IdentityBroker::initialize).
    #[error("Identity broker is not initialized")]
    NotInitialized,

    /// `initialize` was called a second time.
    #[error("Already initialized")]
    AlreadyInitialized,

    /// [`SessionRegistry::resolve`](crate::SessionRegistry::resolve) ran before `initialize`
    /// in the same scope.
    #[error("Session registry is not initialized in this scope")]
    RegistryNotInitialized,

    /// Sign-in or sign-out redirect could not be constructed.
    #[error("Redirect initiation failed: {0}")]
    RedirectInitiation(String),

    /// Callback processing failed (state mismatch, provider error, code exchange failure).
    #[error("Callback error: {message}")]
    Callback {
        message: String,
        /// OAuth2 `error` code when the provider returned one.
        code: Option<String>,
        /// Silent-renewal attempt the callback belonged to, when known.
        renewal_tick: Option<u64>,
    },

    /// Silent renewal failed. Delivered on the error channel.
    #[error("Silent renewal failed: {message}")]
    SilentRenewal {
        message: String,
        /// The provider reported the session itself as invalid.
        session_invalid: bool,
    },

    /// Authenticated, but the session lacks the required roles.
    #[error("Access denied")]
    AccessDenied,

    /// Non-2xx response from the backend API.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Network-level failure.
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// A 2xx response body was not the expected JSON.
    #[error("Response decoding failed: {0}")]
    Decode(#[from] serde_json::Error),

    /// Persistent storage failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The identity provider answered with an error or a malformed document.
    #[error("{operation} failed{}: {detail}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Protocol {
        operation: &'static str,
        status: Option<u16>,
        detail: String,
        /// OAuth2 `error` code, when the body carried one.
        code: Option<String>,
    },

    /// Missing or invalid settings.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// OAuth2 error codes meaning the provider-side session is gone.
const SESSION_INVALID_CODES: &[&str] = &[
    "invalid_grant",
    "login_required",
    "interaction_required",
    "consent_required",
    "account_selection_required",
];

/// Whether an OAuth2 `error` code says the session can no longer be renewed.
#[must_use]
pub fn is_session_invalid_code(code: &str) -> bool {
    SESSION_INVALID_CODES.contains(&code)
}

impl Error {
    pub(crate) fn callback(message: impl Into<String>) -> Self {
        Self::Callback {
            message: message.into(),
            code: None,
            renewal_tick: None,
        }
    }

    /// A callback error from the provider's `error` response.
    pub(crate) fn provider_callback(
        message: impl Into<String>,
        code: String,
        renewal_tick: Option<u64>,
    ) -> Self {
        Self::Callback {
            message: message.into(),
            code: Some(code),
            renewal_tick,
        }
    }

    /// Tie this error to the silent-renewal attempt `tick`.
    ///
    /// Non-callback errors become [`Error::Callback`] with the same message and code.
    pub(crate) fn for_renewal_tick(self, tick: Option<u64>) -> Self {
        let Some(tick) = tick else { return self };
        match self {
            Self::Callback { message, code, .. } => Self::Callback {
                message,
                code,
                renewal_tick: Some(tick),
            },
            other => Self::Callback {
                code: other.oauth_code().map(str::to_owned),
                message: other.to_string(),
                renewal_tick: Some(tick),
            },
        }
    }

    /// The silent-renewal attempt a callback error belongs to, if known.
    #[must_use]
    pub fn renewal_tick(&self) -> Option<u64> {
        match self {
            Self::Callback { renewal_tick, .. } => *renewal_tick,
            _ => None,
        }
    }

    /// The OAuth2 `error` code carried by this error, if any.
    #[must_use]
    pub fn oauth_code(&self) -> Option<&str> {
        match self {
            Self::Callback { code, .. } | Self::Protocol { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// True when the provider indicated the session is invalid and must be dropped.
    #[must_use]
    pub fn is_session_invalid(&self) -> bool {
        match self {
            Self::SilentRenewal {
                session_invalid, ..
            } => *session_invalid,
            other => other.oauth_code().is_some_and(is_session_invalid_code),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_error_display_includes_status() {
        let err = Error::Protocol {
            operation: "token exchange",
            status: Some(400),
            detail: "bad code".into(),
            code: Some("invalid_grant".into()),
        };
        assert_eq!(err.to_string(), "token exchange failed (HTTP 400): bad code");
        assert!(err.is_session_invalid());
    }

    #[test]
    fn network_style_errors_are_not_session_invalid() {
        let err = Error::Protocol {
            operation: "token exchange",
            status: Some(503),
            detail: "unavailable".into(),
            code: None,
        };
        assert!(!err.is_session_invalid());
        assert!(!Error::AccessDenied.is_session_invalid());
    }

    #[test]
    fn silent_renewal_flag() {
        let err = Error::SilentRenewal {
            message: "login_required".into(),
            session_invalid: true,
        };
        assert!(err.is_session_invalid());
    }
}
