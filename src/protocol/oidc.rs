use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::OnceCell;
use url::Url;

use super::pending::{self, PendingRequest, RequestKind};
use super::{IdentityProtocol, SignInArgs, SignInResponse, SignOutArgs};
use crate::error::Error;
use crate::id_token;
use crate::navigation::query_param;
use crate::pkce::{self, PkcePair};
use crate::settings::OidcSettings;
use crate::storage::SessionStorage;
use crate::types::{ClaimSet, Session, now_epoch_seconds};
use crate::well_known::{ProviderMetadata, discovery_url};

/// Authorization-code + PKCE client for a standard OpenID provider.
pub struct OidcProtocolClient {
    settings: OidcSettings,
    storage: Arc<dyn SessionStorage>,
    http: reqwest::Client,
    metadata: OnceCell<ProviderMetadata>,
}

/// Token endpoint response.
#[derive(Debug, Clone, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    session_state: Option<String>,
}

/// RFC 6749 §5.2 error body.
#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

impl OidcProtocolClient {
    #[must_use]
    pub fn new(settings: OidcSettings, storage: Arc<dyn SessionStorage>) -> Self {
        Self {
            settings,
            storage,
            http: reqwest::Client::new(),
            metadata: OnceCell::new(),
        }
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    #[must_use]
    pub fn settings(&self) -> &OidcSettings {
        &self.settings
    }

    /// Provider endpoints: from settings when given, otherwise the discovery document (fetched once).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] on network failure, or [`Error::Protocol`]
    /// if the document is missing or malformed.
    pub async fn metadata(&self) -> Result<&ProviderMetadata, Error> {
        if let Some(metadata) = self.settings.metadata() {
            return Ok(metadata);
        }
        self.metadata
            .get_or_try_init(|| async {
                let url = discovery_url(self.settings.authority());
                tracing::debug!(%url, "Fetching OpenID discovery document");
                let response = self.http.get(&url).send().await?;
                let response = Self::ensure_success(response, "discovery").await?;
                response
                    .json::<ProviderMetadata>()
                    .await
                    .map_err(|e| Error::Protocol {
                        operation: "discovery",
                        status: None,
                        detail: e.to_string(),
                        code: None,
                    })
            })
            .await
    }

    async fn exchange_code(&self, code: &str, pending: &PendingRequest) -> Result<TokenResponse, Error> {
        let metadata = self.metadata().await?;
        let mut params = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", pending.redirect_uri.as_str()),
            ("client_id", self.settings.client_id()),
        ];
        if let Some(verifier) = pending.code_verifier.as_deref() {
            params.push(("code_verifier", verifier));
        }

        let response = self
            .http
            .post(metadata.token_endpoint.clone())
            .form(&params)
            .send()
            .await?;

        let response = Self::ensure_success(response, "token exchange").await?;
        Self::parse_tokens(response, "token exchange").await
    }

    async fn fetch_user_info(&self, endpoint: &Url, access_token: &str) -> Result<ClaimSet, Error> {
        let response = self
            .http
            .get(endpoint.clone())
            .bearer_auth(access_token)
            .send()
            .await?;

        let response = Self::ensure_success(response, "userinfo request").await?;
        response
            .json::<serde_json::Map<String, serde_json::Value>>()
            .await
            .map(ClaimSet::from)
            .map_err(|e| Error::Protocol {
                operation: "userinfo request",
                status: None,
                detail: e.to_string(),
                code: None,
            })
    }

    /// Turn a token response into a session, carrying over what a refresh response may omit.
    async fn build_session(
        &self,
        tokens: TokenResponse,
        previous: Option<&Session>,
        nonce: Option<&str>,
    ) -> Result<Session, Error> {
        if tokens.access_token.is_empty() {
            return Err(malformed("token response", "empty access_token"));
        }

        let mut profile = match (&tokens.id_token, previous) {
            (Some(raw), _) => {
                let claims = id_token::decode_claims(raw)?;
                id_token::check_nonce(&claims, nonce)?;
                if previous.is_some_and(|p| p.profile.subject() != claims.subject()) {
                    return Err(malformed("token refresh", "subject changed during renewal"));
                }
                id_token::profile_claims(claims)
            }
            (None, Some(previous)) => previous.profile.clone(),
            (None, None) => ClaimSet::new(),
        };

        if self.settings.load_user_info() {
            let endpoint = self.metadata().await?.userinfo_endpoint.clone();
            if let Some(endpoint) = endpoint {
                let info = self.fetch_user_info(&endpoint, &tokens.access_token).await?;
                if profile.subject().is_none() {
                    profile = info;
                } else if info.subject() != profile.subject() {
                    return Err(malformed("userinfo request", "subject does not match identity token"));
                } else {
                    profile.merge(info);
                }
            }
        }

        if profile.subject().is_none() {
            return Err(malformed("token response", "no subject claim; is the openid scope requested?"));
        }

        let token_type = if tokens.token_type.is_empty() {
            "Bearer".to_owned()
        } else {
            tokens.token_type
        };

        Ok(Session {
            access_token: tokens.access_token,
            token_type,
            refresh_token: tokens
                .refresh_token
                .or_else(|| previous.and_then(|p| p.refresh_token.clone())),
            id_token: tokens
                .id_token
                .or_else(|| previous.and_then(|p| p.id_token.clone())),
            profile,
            expires_at: tokens.expires_in.map(|secs| now_epoch_seconds() + secs),
            scope: tokens
                .scope
                .or_else(|| previous.and_then(|p| p.scope.clone())),
            session_state: tokens
                .session_state
                .or_else(|| previous.and_then(|p| p.session_state.clone())),
        })
    }

    async fn parse_tokens(
        response: reqwest::Response,
        operation: &'static str,
    ) -> Result<TokenResponse, Error> {
        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| malformed(operation, &e.to_string()))
    }

    /// Checks HTTP response status; returns the response on success or an error with details.
    async fn ensure_success(
        response: reqwest::Response,
        operation: &'static str,
    ) -> Result<reqwest::Response, Error> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let (detail, code) = match serde_json::from_str::<OAuthErrorBody>(&body) {
            Ok(parsed) => (
                parsed.error_description.unwrap_or_else(|| parsed.error.clone()),
                Some(parsed.error),
            ),
            Err(_) => (body, None),
        };
        Err(Error::Protocol {
            operation,
            status: Some(status),
            detail,
            code,
        })
    }

    fn state_ttl_secs(&self) -> i64 {
        i64::try_from(self.settings.state_ttl().as_secs()).unwrap_or(i64::MAX)
    }
}

#[async_trait]
impl IdentityProtocol for OidcProtocolClient {
    async fn create_sign_in_request(&self, args: SignInArgs) -> Result<Url, Error> {
        let metadata = self.metadata().await?;

        let redirect_uri = match args.kind {
            RequestKind::SilentRenew => self
                .settings
                .silent_redirect_uri()
                .unwrap_or(self.settings.redirect_uri()),
            _ => self.settings.redirect_uri(),
        };

        let pkce = PkcePair::generate();
        let pending = PendingRequest {
            id: pkce::generate_state_id(),
            kind: args.kind,
            code_verifier: Some(pkce.verifier),
            nonce: Some(pkce::generate_nonce()),
            redirect_uri: redirect_uri.to_string(),
            return_location: args.return_location,
            renewal_tick: args.renewal_tick,
            created_at: now_epoch_seconds(),
        };

        let mut url = metadata.authorization_endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("client_id", self.settings.client_id())
                .append_pair("redirect_uri", &pending.redirect_uri)
                .append_pair("response_type", self.settings.response_type())
                .append_pair("scope", self.settings.scope())
                .append_pair("state", &pending.id)
                .append_pair("code_challenge", &pkce.challenge)
                .append_pair("code_challenge_method", "S256");
            if let Some(nonce) = &pending.nonce {
                query.append_pair("nonce", nonce);
            }
            if let Some(prompt) = &args.prompt {
                query.append_pair("prompt", prompt);
            }
            if let Some(tenant) = &args.tenant {
                query.append_pair("acr_values", &format!("tenant:{tenant}"));
            }
            if let Some(hint) = &args.id_token_hint {
                query.append_pair("id_token_hint", hint);
            }
            for (name, value) in &self.settings.extra_query_params {
                query.append_pair(name, value);
            }
        }

        pending::save(self.storage.as_ref(), &pending).await?;
        Ok(url)
    }

    async fn process_sign_in_response(&self, callback_url: &Url) -> Result<SignInResponse, Error> {
        let state = query_param(callback_url, "state");

        if let Some(error) = query_param(callback_url, "error") {
            let taken = match &state {
                Some(state) => pending::take(self.storage.as_ref(), state).await?,
                None => None,
            };
            let description = query_param(callback_url, "error_description")
                .unwrap_or_else(|| error.clone());
            tracing::warn!(error = %error, description = %description, "OIDC error from provider");
            return Err(Error::provider_callback(
                description,
                error,
                taken.and_then(|p| p.renewal_tick),
            ));
        }

        let state = state.ok_or_else(|| Error::callback("missing state"))?;
        let code = query_param(callback_url, "code").ok_or_else(|| Error::callback("missing code"))?;

        let pending = pending::take(self.storage.as_ref(), &state)
            .await?
            .ok_or_else(|| {
                tracing::warn!("OIDC state mismatch");
                Error::callback("state mismatch: no matching authorization request")
            })?;

        if pending.kind == RequestKind::SignOut {
            return Err(Error::callback("state belongs to a sign-out request"));
        }
        let tick = pending.renewal_tick;
        if pending.is_stale(now_epoch_seconds(), self.state_ttl_secs()) {
            return Err(Error::callback("authorization request expired").for_renewal_tick(tick));
        }

        let tokens = self
            .exchange_code(&code, &pending)
            .await
            .inspect_err(|e| tracing::error!(error = %e, "Token exchange failed"))
            .map_err(|e| e.for_renewal_tick(tick))?;
        let session = self
            .build_session(tokens, None, pending.nonce.as_deref())
            .await
            .map_err(|e| e.for_renewal_tick(tick))?;

        Ok(SignInResponse {
            session,
            kind: pending.kind,
            return_location: pending.return_location,
            renewal_tick: pending.renewal_tick,
        })
    }

    async fn refresh(&self, session: &Session) -> Result<Session, Error> {
        let refresh_token = session
            .refresh_token
            .as_deref()
            .ok_or_else(|| malformed("token refresh", "session has no refresh token"))?;
        let metadata = self.metadata().await?;

        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.settings.client_id()),
            ("scope", self.settings.scope()),
        ];

        let response = self
            .http
            .post(metadata.token_endpoint.clone())
            .form(&params)
            .send()
            .await?;

        let response = Self::ensure_success(response, "token refresh").await?;
        let tokens = Self::parse_tokens(response, "token refresh").await?;
        self.build_session(tokens, Some(session), None).await
    }

    async fn create_sign_out_request(&self, args: SignOutArgs) -> Result<Option<Url>, Error> {
        let metadata = self.metadata().await?;
        let Some(mut url) = metadata.end_session_endpoint.clone() else {
            return Ok(None);
        };

        let pending = self.settings.post_logout_redirect_uri().map(|uri| PendingRequest {
            id: pkce::generate_state_id(),
            kind: RequestKind::SignOut,
            code_verifier: None,
            nonce: None,
            redirect_uri: uri.to_string(),
            return_location: args.return_location.clone(),
            renewal_tick: None,
            created_at: now_epoch_seconds(),
        });

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("client_id", self.settings.client_id());
            if let Some(hint) = &args.id_token_hint {
                query.append_pair("id_token_hint", hint);
            }
            if let Some(pending) = &pending {
                query
                    .append_pair("post_logout_redirect_uri", &pending.redirect_uri)
                    .append_pair("state", &pending.id);
            }
        }

        if let Some(pending) = &pending {
            pending::save(self.storage.as_ref(), pending).await?;
        }
        Ok(Some(url))
    }

    async fn process_sign_out_response(&self, callback_url: &Url) -> Result<Option<String>, Error> {
        if let Some(error) = query_param(callback_url, "error") {
            let description = query_param(callback_url, "error_description")
                .unwrap_or_else(|| error.clone());
            return Err(Error::provider_callback(description, error, None));
        }

        let Some(state) = query_param(callback_url, "state") else {
            return Ok(None);
        };
        let pending = pending::take(self.storage.as_ref(), &state)
            .await?
            .ok_or_else(|| Error::callback("state mismatch: no matching sign-out request"))?;
        if pending.kind != RequestKind::SignOut {
            return Err(Error::callback("state does not belong to a sign-out request"));
        }
        Ok(pending.return_location)
    }

    async fn load_session(&self) -> Result<Option<Session>, Error> {
        let key = self.settings.session_storage_key();
        let Some(raw) = self.storage.get(&key).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| Error::Storage(format!("corrupt session entry {key}: {e}")))
    }

    async fn store_session(&self, session: &Session) -> Result<(), Error> {
        let json = serde_json::to_string(session).map_err(|e| Error::Storage(e.to_string()))?;
        self.storage
            .set(&self.settings.session_storage_key(), json)
            .await
    }

    async fn remove_session(&self) -> Result<(), Error> {
        self.storage
            .remove(&self.settings.session_storage_key())
            .await
    }

    async fn clear_stale_state(&self) -> Result<usize, Error> {
        pending::clear_stale(
            self.storage.as_ref(),
            now_epoch_seconds(),
            self.state_ttl_secs(),
        )
        .await
    }
}

fn malformed(operation: &'static str, detail: &str) -> Error {
    Error::Protocol {
        operation,
        status: None,
        detail: detail.into(),
        code: None,
    }
}
