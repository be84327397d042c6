//! The identity-protocol layer beneath [`IdentityBroker`](crate::IdentityBroker).
//!
//! [`IdentityProtocol`] is the seam: it builds provider URLs, processes
//! callbacks, talks to the token endpoint, and owns persistent storage.
//! [`OidcProtocolClient`] is the reqwest-backed implementation.

mod oidc;
mod pending;

use async_trait::async_trait;
use url::Url;

use crate::error::Error;
use crate::types::Session;

pub use oidc::OidcProtocolClient;
pub use pending::RequestKind;

/// Parameters for an authorization request.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct SignInArgs {
    pub kind: RequestKind,
    /// Where to send the user after the callback. Kept in stored state, not in the URL.
    pub return_location: Option<String>,
    /// OIDC `prompt` value (`create` for registration, `none` for silent renewal).
    pub prompt: Option<String>,
    /// Tenant hint, sent as `acr_values=tenant:<tenant>`.
    pub tenant: Option<String>,
    pub id_token_hint: Option<String>,
    /// Silent-renewal attempt number, echoed back by the callback.
    pub renewal_tick: Option<u64>,
}

impl SignInArgs {
    #[must_use]
    pub fn new(kind: RequestKind) -> Self {
        Self {
            kind,
            return_location: None,
            prompt: None,
            tenant: None,
            id_token_hint: None,
            renewal_tick: None,
        }
    }
}

/// Result of processing an authorization callback.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct SignInResponse {
    pub session: Session,
    pub kind: RequestKind,
    pub return_location: Option<String>,
    pub renewal_tick: Option<u64>,
}

/// Parameters for an end-session request.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct SignOutArgs {
    pub id_token_hint: Option<String>,
    pub return_location: Option<String>,
}

/// The protocol client the broker orchestrates.
#[async_trait]
pub trait IdentityProtocol: Send + Sync + 'static {
    /// Build an authorization URL and store the pending request under its `state`.
    async fn create_sign_in_request(&self, args: SignInArgs) -> Result<Url, Error>;

    /// Validate a sign-in or silent-renewal callback and exchange its code.
    ///
    /// Does not persist the resulting session.
    async fn process_sign_in_response(&self, callback_url: &Url) -> Result<SignInResponse, Error>;

    /// Exchange the session's refresh token for fresh tokens.
    ///
    /// Does not persist the resulting session.
    async fn refresh(&self, session: &Session) -> Result<Session, Error>;

    /// Build the end-session URL. `None` when the provider has no end-session endpoint.
    async fn create_sign_out_request(&self, args: SignOutArgs) -> Result<Option<Url>, Error>;

    /// Validate a sign-out callback. Returns the stored return location, if any.
    async fn process_sign_out_response(&self, callback_url: &Url) -> Result<Option<String>, Error>;

    /// Read the persisted session, if any. Expiry is the caller's concern.
    async fn load_session(&self) -> Result<Option<Session>, Error>;

    async fn store_session(&self, session: &Session) -> Result<(), Error>;

    async fn remove_session(&self) -> Result<(), Error>;

    /// Drop pending request entries older than the state lifetime. Returns how many.
    async fn clear_stale_state(&self) -> Result<usize, Error>;
}
