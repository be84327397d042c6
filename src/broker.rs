//! Single source of truth for the session.
//!
//! [`IdentityBroker`] owns the protocol client, the current [`Session`], the
//! renewal timer and the two notification channels. Every other component
//! reads through it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use tokio::task::JoinHandle;
use url::Url;

use crate::error::Error;
use crate::navigation::Navigator;
use crate::observer::{Handler, Observers, Subscription};
use crate::protocol::{IdentityProtocol, OidcProtocolClient, RequestKind, SignInArgs, SignOutArgs};
use crate::settings::OidcSettings;
use crate::storage::SessionStorage;
use crate::types::{Session, SessionState, now_epoch_seconds};

/// Floor for the renewal timer so a lead time longer than the token lifetime cannot spin.
const MIN_RENEWAL_DELAY: Duration = Duration::from_secs(1);

/// Options for [`IdentityBroker::initiate_sign_in`].
#[derive(Debug, Clone, Default)]
pub struct SignInOptions {
    /// Where to return after sign-in. Kept in protocol state across the round trip.
    pub return_location: Option<String>,
    /// Ask the provider to show its registration page.
    pub prompt_register: bool,
    pub tenant: Option<String>,
}

impl SignInOptions {
    #[must_use]
    pub fn returning_to(location: impl Into<String>) -> Self {
        Self {
            return_location: Some(location.into()),
            ..Self::default()
        }
    }
}

/// Handle to the broker. Cheap to clone; all clones share one session.
#[derive(Clone)]
pub struct IdentityBroker {
    inner: Arc<BrokerInner>,
}

struct Core {
    settings: OidcSettings,
    protocol: Arc<dyn IdentityProtocol>,
}

#[derive(Default)]
struct BrokerState {
    session: Option<Arc<Session>>,
    loading: bool,
    error: Option<String>,
    return_location: Option<String>,
}

struct RenewalTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

struct BrokerInner {
    navigator: Arc<dyn Navigator>,
    core: OnceLock<Core>,
    state: RwLock<BrokerState>,
    /// Serializes "update + fan-out" against "replay + register".
    publish_gate: ReentrantMutex<()>,
    session_observers: Observers<Option<Arc<Session>>>,
    error_observers: Observers<Error>,
    renewal_tick: AtomicU64,
    timer_generation: AtomicU64,
    timer: Mutex<Option<RenewalTimer>>,
}

impl Drop for BrokerInner {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.get_mut().take() {
            timer.handle.abort();
        }
    }
}

impl IdentityBroker {
    /// An uninitialized broker. Call [`initialize`](Self::initialize) once settings are known.
    #[must_use]
    pub fn new(navigator: Arc<dyn Navigator>) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                navigator,
                core: OnceLock::new(),
                state: RwLock::new(BrokerState::default()),
                publish_gate: ReentrantMutex::new(()),
                session_observers: Observers::new(),
                error_observers: Observers::new(),
                renewal_tick: AtomicU64::new(0),
                timer_generation: AtomicU64::new(0),
                timer: Mutex::new(None),
            }),
        }
    }

    /// One-time setup with the standard OIDC protocol client over `storage`.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for invalid settings, [`Error::AlreadyInitialized`] on a second call.
    pub fn initialize(
        &self,
        settings: OidcSettings,
        storage: Arc<dyn SessionStorage>,
    ) -> Result<(), Error> {
        settings.validate()?;
        let protocol = OidcProtocolClient::new(settings.clone(), storage);
        self.initialize_with(settings, Arc::new(protocol))
    }

    /// One-time setup with a caller-supplied protocol client.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for invalid settings, [`Error::AlreadyInitialized`] on a second call.
    pub fn initialize_with(
        &self,
        settings: OidcSettings,
        protocol: Arc<dyn IdentityProtocol>,
    ) -> Result<(), Error> {
        settings.validate()?;
        self.inner
            .core
            .set(Core { settings, protocol })
            .map_err(|_| Error::AlreadyInitialized)?;
        self.inner.state.write().loading = true;
        tracing::debug!("Identity broker initialized");
        Ok(())
    }

    fn core(&self) -> Result<&Core, Error> {
        self.inner.core.get().ok_or(Error::NotInitialized)
    }

    /// Settings passed to `initialize`.
    ///
    /// # Errors
    ///
    /// [`Error::NotInitialized`] before `initialize`.
    pub fn settings(&self) -> Result<&OidcSettings, Error> {
        self.core().map(|core| &core.settings)
    }

    /// The current session, or `None` when absent or expired.
    #[must_use]
    pub fn current_session(&self) -> Option<Arc<Session>> {
        self.inner
            .state
            .read()
            .session
            .clone()
            .filter(|s| !s.is_expired())
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        if self.inner.core.get().is_none() {
            return SessionState::Unknown;
        }
        let state = self.inner.state.read();
        if state.loading {
            SessionState::Loading
        } else if state.error.is_some() {
            SessionState::Error
        } else if state.session.as_ref().is_some_and(|s| !s.is_expired()) {
            SessionState::Authenticated
        } else {
            SessionState::Anonymous
        }
    }

    /// Message of the failure that put the broker into [`SessionState::Error`].
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.inner.state.read().error.clone()
    }

    /// The return location decoded from the last completed sign-in callback.
    pub fn take_return_location(&self) -> Option<String> {
        self.inner.state.write().return_location.take()
    }

    // ── Subscriptions ──────────────────────────────────────────────────

    /// Register for session changes.
    ///
    /// `handler` is called once with the current session before this returns,
    /// then on every change, synchronously and in subscription order.
    pub fn subscribe_to_session_changes<F>(&self, handler: F) -> Subscription
    where
        F: Fn(Option<&Session>) + Send + Sync + 'static,
    {
        let handler: Handler<Option<Arc<Session>>> =
            Arc::new(move |session: &Option<Arc<Session>>| handler(session.as_deref()));

        let _gate = self.inner.publish_gate.lock();
        let current = self.current_session();
        handler(&current);
        self.inner.session_observers.subscribe(handler)
    }

    /// Register for broker errors that have no caller to return to (silent renewal).
    pub fn subscribe_to_errors<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.inner.error_observers.subscribe(Arc::new(handler))
    }

    fn publish(&self, session: Option<Session>) {
        let session = session.filter(|s| !s.is_expired()).map(Arc::new);
        let _gate = self.inner.publish_gate.lock();
        {
            let mut state = self.inner.state.write();
            state.session = session.clone();
            state.loading = false;
        }
        self.inner.session_observers.notify(&session);
    }

    fn publish_error(&self, error: &Error) {
        let _gate = self.inner.publish_gate.lock();
        self.inner.error_observers.notify(error);
    }

    fn set_error_slot(&self, error: Option<&Error>) {
        let mut state = self.inner.state.write();
        state.error = error.map(ToString::to_string);
        state.loading = false;
    }

    /// Supersede any in-flight renewal and return the new tick.
    fn next_tick(&self) -> u64 {
        self.inner.renewal_tick.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_latest_tick(&self, tick: u64) -> bool {
        self.inner.renewal_tick.load(Ordering::SeqCst) == tick
    }

    // ── Loading ────────────────────────────────────────────────────────

    /// Restore a previously stored, unexpired session.
    ///
    /// Returns `None` on absence or expiry. A corrupt storage entry is logged,
    /// discarded, and treated as absence.
    ///
    /// # Errors
    ///
    /// [`Error::NotInitialized`] before `initialize`.
    pub async fn load_persisted_session(&self) -> Result<Option<Session>, Error> {
        let core = self.core()?;

        let loaded = match core.protocol.load_session().await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(error = %e, "Discarding unreadable persisted session");
                if let Err(e) = core.protocol.remove_session().await {
                    tracing::warn!(error = %e, "Failed to clear unreadable persisted session");
                }
                None
            }
        };

        let loaded = match loaded {
            Some(session) if session.is_expired() => {
                tracing::debug!("Persisted session has expired");
                if let Err(e) = core.protocol.remove_session().await {
                    tracing::warn!(error = %e, "Failed to clear expired persisted session");
                }
                None
            }
            other => other,
        };

        if let Err(e) = core.protocol.clear_stale_state().await {
            tracing::debug!(error = %e, "Failed to clear stale request state");
        }

        let (changed, was_loading) = {
            let state = self.inner.state.read();
            (state.session.as_deref() != loaded.as_ref(), state.loading)
        };
        if changed || was_loading {
            self.publish(loaded.clone());
        }
        match &loaded {
            Some(session) => self.arm_renewal_timer(session, None),
            None => self.cancel_renewal_timer(),
        }
        Ok(loaded)
    }

    // ── Sign-in ────────────────────────────────────────────────────────

    /// Redirect to the provider's authorization endpoint.
    ///
    /// # Errors
    ///
    /// [`Error::RedirectInitiation`] if the request cannot be built or the host
    /// refuses to navigate.
    pub async fn initiate_sign_in(&self, options: SignInOptions) -> Result<(), Error> {
        let core = self.core()?;

        let mut args = SignInArgs::new(RequestKind::SignIn);
        args.return_location = options
            .return_location
            .or_else(|| self.inner.navigator.current_location());
        args.prompt = options.prompt_register.then(|| "create".to_owned());
        args.tenant = options.tenant;

        let url = core
            .protocol
            .create_sign_in_request(args)
            .await
            .map_err(into_redirect_error)?;

        tracing::debug!(%url, "Redirecting to identity provider");
        self.inner.navigator.redirect(&url).map_err(into_redirect_error)
    }

    /// Handle the provider's redirect back to the sign-in callback route.
    ///
    /// # Errors
    ///
    /// [`Error::Callback`] on provider error, state mismatch, or failed code exchange.
    pub async fn complete_sign_in_callback(&self, callback_url: &Url) -> Result<Session, Error> {
        let core = self.core()?;

        let response = match core.protocol.process_sign_in_response(callback_url).await {
            Ok(response) if response.kind == RequestKind::SignIn => response,
            Ok(_) => return Err(self.fail_callback(Error::callback("not a sign-in callback"))),
            Err(e) => return Err(self.fail_callback(into_callback_error(e))),
        };

        self.next_tick();
        if let Err(e) = core.protocol.store_session(&response.session).await {
            tracing::warn!(error = %e, "Failed to persist session");
        }

        let session = response.session;
        {
            let mut state = self.inner.state.write();
            state.error = None;
            state.return_location = response.return_location;
        }
        self.publish(Some(session.clone()));
        self.arm_renewal_timer(&session, None);

        tracing::info!(subject = ?session.profile.subject(), "Sign-in completed");
        Ok(session)
    }

    fn fail_callback(&self, error: Error) -> Error {
        tracing::warn!(error = %error, "Sign-in callback failed");
        self.set_error_slot(Some(&error));
        error
    }

    // ── Silent renewal ─────────────────────────────────────────────────

    /// Renew the access token without user-visible navigation.
    ///
    /// Uses the refresh token when the session has one; otherwise starts a
    /// `prompt=none` authorization in a hidden frame, completed later by
    /// [`complete_silent_renewal_callback`](Self::complete_silent_renewal_callback).
    /// Failures are published on the error channel and also returned.
    ///
    /// # Errors
    ///
    /// [`Error::SilentRenewal`] when renewal fails or there is no session to renew.
    pub async fn initiate_silent_renewal(&self) -> Result<(), Error> {
        let core = self.core()?;
        let tick = self.next_tick();

        let current = self.inner.state.read().session.clone();
        let Some(current) = current else {
            return Err(self.fail_renewal(tick, silent_error("no session to renew", false)).await);
        };

        if current.refresh_token.is_some() {
            tracing::debug!(tick, "Renewing session with refresh token");
            match core.protocol.refresh(&current).await {
                Ok(renewed) => self.apply_renewal(tick, renewed).await.map(|_| ()),
                Err(e) => Err(self.fail_renewal(tick, e).await),
            }
        } else {
            let mut args = SignInArgs::new(RequestKind::SilentRenew);
            args.prompt = Some("none".to_owned());
            args.id_token_hint = current.id_token.clone();
            args.renewal_tick = Some(tick);

            let started = match core.protocol.create_sign_in_request(args).await {
                Ok(url) => self.inner.navigator.navigate_hidden(&url),
                Err(e) => Err(e),
            };
            match started {
                Ok(()) => {
                    tracing::debug!(tick, "Silent renewal started in hidden frame");
                    self.arm_retry_timer();
                    Ok(())
                }
                Err(e) => Err(self.fail_renewal(tick, e).await),
            }
        }
    }

    /// Handle the hidden-frame callback of a silent renewal.
    ///
    /// # Errors
    ///
    /// [`Error::SilentRenewal`] on failure or when a later renewal has superseded this one.
    pub async fn complete_silent_renewal_callback(&self, callback_url: &Url) -> Result<Session, Error> {
        let core = self.core()?;

        match core.protocol.process_sign_in_response(callback_url).await {
            Ok(response) if response.kind == RequestKind::SilentRenew => {
                let tick = response.renewal_tick.unwrap_or_default();
                self.apply_renewal(tick, response.session).await
            }
            Ok(response) => {
                tracing::warn!(kind = ?response.kind, "Unexpected callback on the silent-renewal route");
                Err(silent_error("not a silent-renewal callback", false))
            }
            Err(e) => match e.renewal_tick() {
                Some(tick) => Err(self.fail_renewal(tick, e).await),
                None => {
                    // No pending attempt to attribute it to; the session is left alone.
                    tracing::warn!(error = %e, "Unattributable silent-renewal callback failure");
                    Err(silent_error(e.to_string(), e.is_session_invalid()))
                }
            },
        }
    }

    async fn apply_renewal(&self, tick: u64, renewed: Session) -> Result<Session, Error> {
        if !self.is_latest_tick(tick) {
            tracing::debug!(tick, "Discarding superseded renewal result");
            return Err(silent_error("superseded by a later renewal", false));
        }

        let core = self.core()?;
        if let Err(e) = core.protocol.store_session(&renewed).await {
            tracing::warn!(error = %e, "Failed to persist renewed session");
        }
        if !self.is_latest_tick(tick) {
            return Err(silent_error("superseded by a later renewal", false));
        }

        self.inner.state.write().error = None;
        self.publish(Some(renewed.clone()));
        self.arm_renewal_timer(&renewed, None);
        tracing::debug!(tick, "Silent renewal completed");
        Ok(renewed)
    }

    /// Publish a renewal failure; clear the session only if the provider says it is invalid.
    async fn fail_renewal(&self, tick: u64, error: Error) -> Error {
        let error = match error {
            e @ Error::SilentRenewal { .. } => e,
            e @ Error::NotInitialized => return e,
            other => silent_error(other.to_string(), other.is_session_invalid()),
        };

        if !self.is_latest_tick(tick) {
            tracing::debug!(tick, error = %error, "Ignoring failure of superseded renewal");
            return error;
        }

        tracing::warn!(tick, error = %error, "Silent renewal failed");
        self.publish_error(&error);

        if error.is_session_invalid() {
            tracing::info!("Provider reports session invalid; signing out locally");
            self.clear_local().await;
        } else if self.current_session().is_some() {
            self.arm_retry_timer();
        } else if self.has_stored_session() {
            // Expired with no way to renew.
            self.clear_local().await;
        }
        error
    }

    // ── Sign-out ───────────────────────────────────────────────────────

    /// Redirect to the provider's end-session endpoint.
    ///
    /// The local session is cleared before navigating. When the provider has
    /// no end-session endpoint, navigates to `post_logout_redirect_uri` if set.
    ///
    /// # Errors
    ///
    /// [`Error::RedirectInitiation`] if the request cannot be built or the host
    /// refuses to navigate.
    pub async fn initiate_sign_out(&self) -> Result<(), Error> {
        let core = self.core()?;
        let id_token_hint = self
            .inner
            .state
            .read()
            .session
            .as_ref()
            .and_then(|s| s.id_token.clone());

        let url = core
            .protocol
            .create_sign_out_request(SignOutArgs {
                id_token_hint,
                return_location: None,
            })
            .await
            .map_err(into_redirect_error)?;

        self.clear_local().await;

        match url.or_else(|| core.settings.post_logout_redirect_uri().cloned()) {
            Some(url) => {
                tracing::debug!(%url, "Redirecting to end-session endpoint");
                self.inner.navigator.redirect(&url).map_err(into_redirect_error)
            }
            None => Ok(()),
        }
    }

    /// Handle the provider's redirect back after sign-out.
    ///
    /// # Errors
    ///
    /// [`Error::Callback`] on provider error or state mismatch. The local
    /// session is cleared either way.
    pub async fn complete_sign_out_callback(&self, callback_url: &Url) -> Result<(), Error> {
        let core = self.core()?;
        let result = core.protocol.process_sign_out_response(callback_url).await;
        self.clear_local().await;
        match result {
            Ok(return_location) => {
                self.inner.state.write().return_location = return_location;
                tracing::info!("Sign-out completed");
                Ok(())
            }
            Err(e) => Err(self.fail_callback(into_callback_error(e))),
        }
    }

    /// Drop the session locally, without a provider round trip.
    ///
    /// # Errors
    ///
    /// [`Error::Storage`] if the persisted copy could not be removed. The
    /// in-memory session is cleared and `None` published regardless.
    pub async fn remove_session(&self) -> Result<(), Error> {
        let core = self.core()?;
        self.next_tick();
        self.cancel_renewal_timer();
        let removed = core.protocol.remove_session().await;
        self.publish(None);
        removed
    }

    fn has_stored_session(&self) -> bool {
        self.inner.state.read().session.is_some()
    }

    async fn clear_local(&self) {
        if let Err(e) = self.remove_session().await {
            tracing::warn!(error = %e, "Failed to clear persisted session");
        }
    }

    // ── Renewal timer ──────────────────────────────────────────────────

    fn arm_renewal_timer(&self, session: &Session, delay: Option<Duration>) {
        let Ok(core) = self.core() else { return };
        if !core.settings.automatic_silent_renew() {
            return;
        }
        let Some(expires_at) = session.expires_at else {
            self.cancel_renewal_timer();
            return;
        };

        let delay = delay.unwrap_or_else(|| {
            let lead = i64::try_from(core.settings.renewal_lead_time().as_secs()).unwrap_or(i64::MAX);
            let secs = expires_at.saturating_sub(lead).saturating_sub(now_epoch_seconds());
            Duration::from_secs(u64::try_from(secs).unwrap_or(0))
        });
        self.schedule(delay.max(MIN_RENEWAL_DELAY));
    }

    fn arm_retry_timer(&self) {
        let Ok(core) = self.core() else { return };
        let Some(session) = self.current_session() else { return };
        let retry = core.settings.renewal_retry_interval();
        self.arm_renewal_timer(&session, Some(retry));
    }

    /// Cancel-then-schedule: at most one timer per broker.
    fn schedule(&self, delay: Duration) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("No async runtime; automatic renewal disabled");
            return;
        };

        let generation = self.inner.timer_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let weak: Weak<BrokerInner> = Arc::downgrade(&self.inner);

        let mut slot = self.inner.timer.lock();
        if let Some(previous) = slot.take() {
            previous.handle.abort();
        }
        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else { return };
            {
                let mut slot = inner.timer.lock();
                match slot.as_ref() {
                    Some(timer) if timer.generation == generation => {
                        slot.take();
                    }
                    _ => return,
                }
            }
            let broker = IdentityBroker { inner };
            tracing::debug!("Renewal timer fired");
            let _ = broker.initiate_silent_renewal().await;
        });
        tracing::debug!(delay_secs = delay.as_secs(), "Renewal timer armed");
        *slot = Some(RenewalTimer { generation, handle });
    }

    fn cancel_renewal_timer(&self) {
        if let Some(timer) = self.inner.timer.lock().take() {
            timer.handle.abort();
            tracing::debug!("Renewal timer cleared");
        }
    }

    /// Whether a renewal timer is currently armed.
    #[must_use]
    pub fn renewal_scheduled(&self) -> bool {
        self.inner.timer.lock().is_some()
    }
}

impl std::fmt::Debug for IdentityBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityBroker")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn silent_error(message: impl Into<String>, session_invalid: bool) -> Error {
    Error::SilentRenewal {
        message: message.into(),
        session_invalid,
    }
}

fn into_redirect_error(error: Error) -> Error {
    match error {
        e @ (Error::RedirectInitiation(_) | Error::NotInitialized) => e,
        other => Error::RedirectInitiation(other.to_string()),
    }
}

fn into_callback_error(error: Error) -> Error {
    match error {
        e @ Error::Callback { .. } => e,
        other => {
            let code = other.oauth_code().map(str::to_owned);
            Error::Callback {
                message: other.to_string(),
                code,
                renewal_tick: None,
            }
        }
    }
}
