//! In-process protocol double for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use url::Url;

use crate::error::Error;
use crate::navigation::query_param;
use crate::protocol::{IdentityProtocol, SignInArgs, SignInResponse, SignOutArgs};
use crate::settings::OidcSettings;
use crate::types::{ClaimSet, Session, now_epoch_seconds};

pub(crate) fn test_settings() -> OidcSettings {
    OidcSettings::new(
        "https://idp.example".parse().unwrap(),
        "client",
        "https://app.example/cb".parse().unwrap(),
    )
    .with_post_logout_redirect_uri("https://app.example/".parse().unwrap())
}

/// A session for subject `sub` that expires `ttl_secs` from now.
pub(crate) fn session_for(sub: &str, ttl_secs: i64) -> Session {
    Session::new(format!("at-{sub}"), "Bearer")
        .with_profile(ClaimSet::new().with("sub", sub))
        .with_expires_at(now_epoch_seconds() + ttl_secs)
}

#[derive(Default)]
struct FakeState {
    persisted: Option<Session>,
    pending: HashMap<String, SignInArgs>,
    next_sessions: VecDeque<Session>,
    refresh_failure: Option<Option<String>>,
    fail_load: bool,
    fail_requests: bool,
    next_state: u64,
}

/// Records calls and answers from canned data; never touches the network.
#[derive(Clone, Default)]
pub(crate) struct FakeProtocol {
    state: Arc<Mutex<FakeState>>,
    refresh_calls: Arc<AtomicUsize>,
}

impl FakeProtocol {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn persist(&self, session: Session) {
        self.state.lock().persisted = Some(session);
    }

    pub(crate) fn persisted(&self) -> Option<Session> {
        self.state.lock().persisted.clone()
    }

    pub(crate) fn fail_load(&self) {
        self.state.lock().fail_load = true;
    }

    pub(crate) fn fail_requests(&self) {
        self.state.lock().fail_requests = true;
    }

    /// Session handed out by the next successful callback.
    pub(crate) fn next_sign_in_session(&self, session: Session) {
        self.state.lock().next_sessions.push_back(session);
    }

    /// Make refresh fail, with the given OAuth2 error code.
    pub(crate) fn fail_refresh(&self, code: Option<&str>) {
        self.state.lock().refresh_failure = Some(code.map(str::to_owned));
    }

    pub(crate) fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    /// The error callback a provider would send for `authorize_url`.
    pub(crate) fn error_callback_for(authorize_url: &Url, code: &str) -> Url {
        let state = query_param(authorize_url, "state").unwrap_or_default();
        let mut url: Url = "https://app.example/cb".parse().unwrap();
        url.query_pairs_mut()
            .append_pair("error", code)
            .append_pair("state", &state);
        url
    }

    /// The callback URL a provider would redirect to after `authorize_url`.
    pub(crate) fn callback_for(authorize_url: &Url) -> Url {
        let state = query_param(authorize_url, "state").unwrap_or_default();
        let mut url: Url = "https://app.example/cb".parse().unwrap();
        url.query_pairs_mut()
            .append_pair("code", "fake-code")
            .append_pair("state", &state);
        url
    }
}

#[async_trait]
impl IdentityProtocol for FakeProtocol {
    async fn create_sign_in_request(&self, args: SignInArgs) -> Result<Url, Error> {
        let mut state = self.state.lock();
        if state.fail_requests {
            return Err(Error::Protocol {
                operation: "discovery",
                status: Some(503),
                detail: "unavailable".into(),
                code: None,
            });
        }
        state.next_state += 1;
        let id = format!("s{}", state.next_state);

        let mut url: Url = "https://idp.example/authorize".parse().unwrap();
        url.query_pairs_mut().append_pair("state", &id);
        if let Some(prompt) = &args.prompt {
            url.query_pairs_mut().append_pair("prompt", prompt);
        }
        state.pending.insert(id, args);
        Ok(url)
    }

    async fn process_sign_in_response(&self, callback_url: &Url) -> Result<SignInResponse, Error> {
        let id = query_param(callback_url, "state").unwrap_or_default();
        let mut state = self.state.lock();
        if let Some(code) = query_param(callback_url, "error") {
            let tick = state.pending.remove(&id).and_then(|args| args.renewal_tick);
            return Err(Error::provider_callback(
                format!("provider returned {code}"),
                code,
                tick,
            ));
        }
        let args = state
            .pending
            .remove(&id)
            .ok_or_else(|| Error::callback("unknown state"))?;
        let session = state
            .next_sessions
            .pop_front()
            .unwrap_or_else(|| session_for("user", 3600));
        Ok(SignInResponse {
            session,
            kind: args.kind,
            return_location: args.return_location,
            renewal_tick: args.renewal_tick,
        })
    }

    async fn refresh(&self, session: &Session) -> Result<Session, Error> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(code) = self.state.lock().refresh_failure.clone() {
            return Err(Error::Protocol {
                operation: "token refresh",
                status: code.as_ref().map(|_| 400),
                detail: "refused".into(),
                code,
            });
        }
        let mut renewed = session.clone();
        renewed.access_token = format!("{}+", session.access_token);
        renewed.expires_at = Some(now_epoch_seconds() + 3600);
        Ok(renewed)
    }

    async fn create_sign_out_request(&self, args: SignOutArgs) -> Result<Option<Url>, Error> {
        let mut url: Url = "https://idp.example/logout".parse().unwrap();
        if let Some(hint) = &args.id_token_hint {
            url.query_pairs_mut().append_pair("id_token_hint", hint);
        }
        Ok(Some(url))
    }

    async fn process_sign_out_response(&self, callback_url: &Url) -> Result<Option<String>, Error> {
        match query_param(callback_url, "error") {
            Some(code) => Err(Error::provider_callback(
                format!("provider returned {code}"),
                code,
                None,
            )),
            None => Ok(None),
        }
    }

    async fn load_session(&self) -> Result<Option<Session>, Error> {
        let state = self.state.lock();
        if state.fail_load {
            return Err(Error::Storage("corrupt".into()));
        }
        Ok(state.persisted.clone())
    }

    async fn store_session(&self, session: &Session) -> Result<(), Error> {
        self.persist(session.clone());
        Ok(())
    }

    async fn remove_session(&self) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.persisted = None;
        state.fail_load = false;
        Ok(())
    }

    async fn clear_stale_state(&self) -> Result<usize, Error> {
        Ok(0)
    }
}
