//! Outbound HTTP with bearer-token injection and 401/403 handling.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use reqwest::header::{AUTHORIZATION, HeaderValue};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use url::Url;

use crate::broker::IdentityBroker;
use crate::error::Error;
use crate::observer::Subscription;
use crate::projection::SessionProjection;

/// Callback invoked by the transport on an authorization failure.
pub type TransportCallback = Arc<dyn Fn() + Send + Sync>;

const DEFAULT_LOCALIZATION_MARKERS: &[&str] = &["/assets/i18n/", "/locales/"];

/// Which requests get the bearer token, and how failures are reported.
///
/// The header is attached when, in order:
/// 1. the URL is under an excluded prefix: never;
/// 2. the path contains a localization marker: never;
/// 3. the URL is under `base_api_url` or an included prefix: always;
/// 4. neither `base_api_url` nor any inclusion is configured: always.
///
/// "Under" means same scheme, host and port, and a path at or below the
/// prefix path on a segment boundary: `https://api.example/v1` covers
/// `/v1` and `/v1/users` but not `/v1x` or `https://api.example.evil/`.
/// Prefixes that do not parse as absolute URLs match nothing.
///
/// Rule 4 makes an unconfigured transport send the token everywhere.
/// Configure `base_api_url` when the client also talks to third parties.
#[derive(Clone)]
pub struct TransportOptions {
    pub base_api_url: Option<Url>,
    pub include_prefixes: Vec<String>,
    pub exclude_prefixes: Vec<String>,
    pub localization_markers: Vec<String>,
    /// Replaces the sign-out redirect after a 401.
    pub on_unauthorized: Option<TransportCallback>,
    pub on_forbidden: Option<TransportCallback>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            base_api_url: None,
            include_prefixes: Vec::new(),
            exclude_prefixes: Vec::new(),
            localization_markers: DEFAULT_LOCALIZATION_MARKERS
                .iter()
                .map(|m| (*m).to_owned())
                .collect(),
            on_unauthorized: None,
            on_forbidden: None,
        }
    }
}

impl TransportOptions {
    #[must_use]
    pub fn for_api(base_api_url: Url) -> Self {
        Self {
            base_api_url: Some(base_api_url),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn include(mut self, prefix: impl Into<String>) -> Self {
        self.include_prefixes.push(prefix.into());
        self
    }

    #[must_use]
    pub fn exclude(mut self, prefix: impl Into<String>) -> Self {
        self.exclude_prefixes.push(prefix.into());
        self
    }

    #[must_use]
    pub fn on_unauthorized(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_unauthorized = Some(Arc::new(callback));
        self
    }

    #[must_use]
    pub fn on_forbidden(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_forbidden = Some(Arc::new(callback));
        self
    }

    /// Whether a request to `url` carries the `Authorization` header.
    #[must_use]
    pub fn should_attach(&self, url: &Url) -> bool {
        if self.exclude_prefixes.iter().any(|p| is_under_str(url, p)) {
            return false;
        }
        if self
            .localization_markers
            .iter()
            .any(|m| url.path().contains(m.as_str()))
        {
            return false;
        }
        if self
            .base_api_url
            .as_ref()
            .is_some_and(|base| is_under(url, base))
            || self.include_prefixes.iter().any(|p| is_under_str(url, p))
        {
            return true;
        }
        self.base_api_url.is_none() && self.include_prefixes.is_empty()
    }
}

fn is_under_str(url: &Url, prefix: &str) -> bool {
    Url::parse(prefix).is_ok_and(|prefix| is_under(url, &prefix))
}

/// Same origin, and `url`'s path is `prefix`'s path or below it.
fn is_under(url: &Url, prefix: &Url) -> bool {
    if url.scheme() != prefix.scheme()
        || url.host_str() != prefix.host_str()
        || url.port_or_known_default() != prefix.port_or_known_default()
    {
        return false;
    }
    let base = prefix.path();
    if base.ends_with('/') {
        return url.path().starts_with(base);
    }
    url.path()
        .strip_prefix(base)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

impl std::fmt::Debug for TransportOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportOptions")
            .field("base_api_url", &self.base_api_url)
            .field("include_prefixes", &self.include_prefixes)
            .field("exclude_prefixes", &self.exclude_prefixes)
            .field("localization_markers", &self.localization_markers)
            .field("on_unauthorized", &self.on_unauthorized.is_some())
            .field("on_forbidden", &self.on_forbidden.is_some())
            .finish()
    }
}

/// HTTP client for the backend API. Cheap to clone.
#[derive(Clone)]
pub struct AuthorizedTransport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    http: reqwest::Client,
    broker: IdentityBroker,
    projection: SessionProjection,
    options: TransportOptions,
    /// Set once a 401 has been handled; cleared when a session is published.
    unauthorized_handled: Arc<AtomicBool>,
    _subscription: Subscription,
}

impl AuthorizedTransport {
    #[must_use]
    pub fn new(broker: IdentityBroker, projection: SessionProjection, options: TransportOptions) -> Self {
        Self::with_http_client(broker, projection, options, reqwest::Client::new())
    }

    #[must_use]
    pub fn with_http_client(
        broker: IdentityBroker,
        projection: SessionProjection,
        options: TransportOptions,
        http: reqwest::Client,
    ) -> Self {
        let unauthorized_handled = Arc::new(AtomicBool::new(false));
        let subscription = {
            let latch = unauthorized_handled.clone();
            broker.subscribe_to_session_changes(move |session| {
                if session.is_some() {
                    latch.store(false, Ordering::SeqCst);
                }
            })
        };
        Self {
            inner: Arc::new(TransportInner {
                http,
                broker,
                projection,
                options,
                unauthorized_handled,
                _subscription: subscription,
            }),
        }
    }

    #[must_use]
    pub fn options(&self) -> &TransportOptions {
        &self.inner.options
    }

    /// Absolute URLs pass through; anything else is joined onto `base_api_url`.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for a relative URL without a base, or an unparsable one.
    pub fn resolve(&self, url: &str) -> Result<Url, Error> {
        match Url::parse(url) {
            Ok(absolute) => Ok(absolute),
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                let base = self.inner.options.base_api_url.as_ref().ok_or_else(|| {
                    Error::Config(format!("relative URL '{url}' needs base_api_url"))
                })?;
                base.join(url)
                    .map_err(|e| Error::Config(format!("invalid URL '{url}': {e}")))
            }
            Err(e) => Err(Error::Config(format!("invalid URL '{url}': {e}"))),
        }
    }

    /// A request builder for a custom call. Send it with [`send`](Self::send).
    ///
    /// # Errors
    ///
    /// See [`resolve`](Self::resolve).
    pub fn request(&self, method: Method, url: &str) -> Result<RequestBuilder, Error> {
        Ok(self.inner.http.request(method, self.resolve(url)?))
    }

    /// Build and [`execute`](Self::execute) a request.
    ///
    /// # Errors
    ///
    /// [`Error::Transport`] if the request cannot be built or sent.
    pub async fn send(&self, builder: RequestBuilder) -> Result<Response, Error> {
        self.execute(builder.build()?).await
    }

    /// Send `request`, attaching the bearer token when the URL qualifies.
    ///
    /// A 401 to a request that carried the token clears the session and starts
    /// sign-out once per session; a 403 only invokes `on_forbidden`. Either
    /// response is still returned.
    ///
    /// # Errors
    ///
    /// [`Error::Transport`] on network failure.
    pub async fn execute(&self, mut request: reqwest::Request) -> Result<Response, Error> {
        let mut token_sent = false;
        if self.inner.options.should_attach(request.url()) {
            let value = self.inner.projection.authorization_header_value();
            if !value.is_empty() {
                match HeaderValue::from_str(&value) {
                    Ok(mut header) => {
                        header.set_sensitive(true);
                        request.headers_mut().insert(AUTHORIZATION, header);
                        token_sent = true;
                    }
                    Err(e) => tracing::warn!(error = %e, "Access token is not a valid header value"),
                }
            }
        }

        let url = request.url().clone();
        let response = self.inner.http.execute(request).await?;

        match response.status() {
            StatusCode::UNAUTHORIZED if token_sent => self.handle_unauthorized(&url).await,
            StatusCode::FORBIDDEN => {
                tracing::debug!(%url, "Forbidden");
                if let Some(callback) = &self.inner.options.on_forbidden {
                    callback();
                }
            }
            _ => {}
        }
        Ok(response)
    }

    async fn handle_unauthorized(&self, url: &Url) {
        if self.inner.unauthorized_handled.swap(true, Ordering::SeqCst) {
            tracing::debug!(%url, "Unauthorized response already handled for this session");
            return;
        }
        tracing::warn!(%url, "Unauthorized response; ending session");

        if let Err(e) = self.inner.broker.remove_session().await {
            tracing::warn!(error = %e, "Failed to clear session after 401");
        }
        match &self.inner.options.on_unauthorized {
            Some(callback) => callback(),
            None => {
                if let Err(e) = self.inner.broker.initiate_sign_out().await {
                    tracing::error!(error = %e, "Failed to start sign-out after 401");
                }
            }
        }
    }

    async fn call<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: &str,
        body: Option<&B>,
    ) -> Result<Response, Error> {
        let mut builder = self.request(method, url)?;
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let response = self.send(builder).await?;
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            Err(Error::Http { status, body })
        }
    }

    /// # Errors
    ///
    /// [`Error::Http`] for non-2xx, [`Error::Transport`] or [`Error::Decode`] otherwise.
    pub async fn get<T: DeserializeOwned>(&self, url: &str) -> Result<T, Error> {
        let bytes = self.call::<()>(Method::GET, url, None).await?.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// # Errors
    ///
    /// As [`get`](Self::get).
    pub async fn post<B, T>(&self, url: &str, body: &B) -> Result<T, Error>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let bytes = self.call(Method::POST, url, Some(body)).await?.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// # Errors
    ///
    /// As [`get`](Self::get).
    pub async fn put<B, T>(&self, url: &str, body: &B) -> Result<T, Error>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let bytes = self.call(Method::PUT, url, Some(body)).await?.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// # Errors
    ///
    /// As [`get`](Self::get).
    pub async fn patch<B, T>(&self, url: &str, body: &B) -> Result<T, Error>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let bytes = self.call(Method::PATCH, url, Some(body)).await?.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// `None` when the server answers with an empty body.
    ///
    /// # Errors
    ///
    /// As [`get`](Self::get).
    pub async fn delete<T: DeserializeOwned>(&self, url: &str) -> Result<Option<T>, Error> {
        let bytes = self.call::<()>(Method::DELETE, url, None).await?.bytes().await?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

impl std::fmt::Debug for AuthorizedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizedTransport")
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}
