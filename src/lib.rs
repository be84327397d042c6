#![doc = include_str!("../README.md")]

pub mod broker;
pub mod error;
pub mod guard;
pub mod id_token;
pub mod navigation;
mod observer;
pub mod pkce;
pub mod projection;
pub mod protocol;
pub mod registry;
pub mod settings;
pub mod storage;
#[cfg(test)]
mod testing;
pub mod transport;
pub mod types;
pub mod well_known;

// Re-exports for convenient access
pub use broker::{IdentityBroker, SignInOptions};
pub use error::{Error, Result, is_session_invalid_code};
pub use guard::{AuthorizationGuard, GuardOptions};
pub use navigation::{Navigator, NoopNavigator, RecordingNavigator};
pub use observer::Subscription;
pub use projection::{ProjectionOptions, SessionProjection, SessionView};
pub use protocol::{IdentityProtocol, OidcProtocolClient, RequestKind, SignInArgs, SignInResponse, SignOutArgs};
pub use registry::{RegistryHandle, ScopeId, SessionRegistry};
pub use settings::OidcSettings;
pub use storage::{FileStorage, MemoryStorage, SessionStorage};
pub use transport::{AuthorizedTransport, TransportCallback, TransportOptions};
pub use types::{ClaimSet, Session, SessionState, SubjectId};
pub use well_known::ProviderMetadata;
