//! Composition root: one broker, projection, guard and transport per application instance.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use derive_more::Display;
use parking_lot::RwLock;
use ulid::Ulid;

use crate::broker::IdentityBroker;
use crate::error::Error;
use crate::guard::AuthorizationGuard;
use crate::navigation::Navigator;
use crate::projection::SessionProjection;
use crate::protocol::{IdentityProtocol, OidcProtocolClient};
use crate::settings::OidcSettings;
use crate::storage::SessionStorage;
use crate::transport::{AuthorizedTransport, TransportOptions};

tokio::task_local! {
    static CURRENT: SessionRegistry;
}

/// Identifies one registry. Shows up in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub struct ScopeId(Ulid);

/// The wired components of an initialized registry. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    scope: ScopeId,
    broker: IdentityBroker,
    projection: SessionProjection,
    guard: AuthorizationGuard,
    transport: AuthorizedTransport,
}

impl RegistryHandle {
    #[must_use]
    pub fn scope(&self) -> ScopeId {
        self.scope
    }

    #[must_use]
    pub fn broker(&self) -> &IdentityBroker {
        &self.broker
    }

    #[must_use]
    pub fn projection(&self) -> &SessionProjection {
        &self.projection
    }

    #[must_use]
    pub fn guard(&self) -> &AuthorizationGuard {
        &self.guard
    }

    #[must_use]
    pub fn transport(&self) -> &AuthorizedTransport {
        &self.transport
    }
}

/// Holds the session components for one application instance.
///
/// Registries are independent of each other. There is no process-wide
/// instance; use [`SessionRegistry::scope`] to make one ambient for a task.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    id: ScopeId,
    initializing: AtomicBool,
    handle: RwLock<Option<RegistryHandle>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                id: ScopeId(Ulid::new()),
                initializing: AtomicBool::new(false),
                handle: RwLock::new(None),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> ScopeId {
        self.inner.id
    }

    /// Wire everything over the standard OIDC client and load the persisted session.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyInitialized`] on a second call, [`Error::Config`] for invalid settings.
    pub async fn initialize(
        &self,
        settings: OidcSettings,
        transport_options: TransportOptions,
        navigator: Arc<dyn Navigator>,
        storage: Arc<dyn SessionStorage>,
    ) -> Result<RegistryHandle, Error> {
        settings.validate()?;
        let protocol = Arc::new(OidcProtocolClient::new(settings.clone(), storage));
        self.initialize_with_protocol(settings, transport_options, navigator, protocol)
            .await
    }

    /// Like [`initialize`](Self::initialize), with a caller-supplied protocol client.
    ///
    /// # Errors
    ///
    /// As [`initialize`](Self::initialize).
    pub async fn initialize_with_protocol(
        &self,
        settings: OidcSettings,
        transport_options: TransportOptions,
        navigator: Arc<dyn Navigator>,
        protocol: Arc<dyn IdentityProtocol>,
    ) -> Result<RegistryHandle, Error> {
        if self.inner.initializing.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyInitialized);
        }

        let broker = IdentityBroker::new(navigator);
        if let Err(e) = broker.initialize_with(settings, protocol) {
            self.inner.initializing.store(false, Ordering::SeqCst);
            return Err(e);
        }
        let projection = SessionProjection::new(broker.clone());
        let guard = AuthorizationGuard::new(broker.clone(), projection.clone());
        let transport = AuthorizedTransport::new(broker.clone(), projection.clone(), transport_options);

        broker.load_persisted_session().await?;

        let handle = RegistryHandle {
            scope: self.inner.id,
            broker,
            projection,
            guard,
            transport,
        };
        *self.inner.handle.write() = Some(handle.clone());
        tracing::info!(scope = %self.inner.id, "Session registry initialized");
        Ok(handle)
    }

    /// The wired components.
    ///
    /// # Errors
    ///
    /// [`Error::RegistryNotInitialized`] before `initialize` has completed.
    pub fn resolve(&self) -> Result<RegistryHandle, Error> {
        self.inner
            .handle
            .read()
            .clone()
            .ok_or(Error::RegistryNotInitialized)
    }

    /// Run `future` with `registry` as the ambient registry of the task.
    pub async fn scope<F: Future>(registry: SessionRegistry, future: F) -> F::Output {
        CURRENT.scope(registry, future).await
    }

    /// The ambient registry, if the caller runs inside [`scope`](Self::scope).
    #[must_use]
    pub fn current() -> Option<SessionRegistry> {
        CURRENT.try_with(Clone::clone).ok()
    }

    /// Resolve the ambient registry.
    ///
    /// # Errors
    ///
    /// [`Error::RegistryNotInitialized`] outside a scope or before `initialize`.
    pub fn resolve_current() -> Result<RegistryHandle, Error> {
        Self::current()
            .ok_or(Error::RegistryNotInitialized)?
            .resolve()
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("id", &self.inner.id)
            .field("initialized", &self.inner.handle.read().is_some())
            .finish()
    }
}
