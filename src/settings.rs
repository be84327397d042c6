use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::error::Error;
use crate::well_known::ProviderMetadata;

const DEFAULT_RESPONSE_TYPE: &str = "code";
const DEFAULT_SCOPE: &str = "openid profile email";

/// OpenID Connect client settings.
///
/// Required fields are constructor parameters; everything else starts from
/// defaults (`response_type=code`, `scope="openid profile email"`, automatic
/// renewal on) and is overridden with `with_*` methods.
///
/// ```rust,ignore
/// use oidc_session::OidcSettings;
///
/// let settings = OidcSettings::new(
///     "https://idp.example".parse()?,
///     "abc",
///     "https://app.example/cb".parse()?,
/// )
/// .with_post_logout_redirect_uri("https://app.example/".parse()?);
/// ```
///
/// Settings also deserialize from the host's configuration document, with the
/// same defaults applied to missing fields.
#[derive(Debug, Clone, Deserialize)]
#[non_exhaustive]
pub struct OidcSettings {
    pub(crate) authority: Url,
    pub(crate) client_id: String,
    pub(crate) redirect_uri: Url,
    #[serde(default)]
    pub(crate) post_logout_redirect_uri: Option<Url>,
    #[serde(default)]
    pub(crate) silent_redirect_uri: Option<Url>,
    #[serde(default = "default_response_type")]
    pub(crate) response_type: String,
    #[serde(default = "default_scope")]
    pub(crate) scope: String,
    #[serde(default = "default_true")]
    pub(crate) automatic_silent_renew: bool,
    #[serde(default = "default_lead_time", with = "seconds")]
    pub(crate) renewal_lead_time: Duration,
    #[serde(default = "default_retry_interval", with = "seconds")]
    pub(crate) renewal_retry_interval: Duration,
    #[serde(default)]
    pub(crate) load_user_info: bool,
    #[serde(default = "default_state_ttl", with = "seconds")]
    pub(crate) state_ttl: Duration,
    #[serde(default)]
    pub(crate) extra_query_params: BTreeMap<String, String>,
    #[serde(default)]
    pub(crate) metadata: Option<ProviderMetadata>,
}

fn default_response_type() -> String {
    DEFAULT_RESPONSE_TYPE.into()
}

fn default_scope() -> String {
    DEFAULT_SCOPE.into()
}

fn default_true() -> bool {
    true
}

fn default_lead_time() -> Duration {
    Duration::from_secs(60)
}

fn default_retry_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_state_ttl() -> Duration {
    Duration::from_secs(600)
}

mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

impl OidcSettings {
    #[must_use]
    pub fn new(authority: Url, client_id: impl Into<String>, redirect_uri: Url) -> Self {
        Self {
            authority,
            client_id: client_id.into(),
            redirect_uri,
            post_logout_redirect_uri: None,
            silent_redirect_uri: None,
            response_type: default_response_type(),
            scope: default_scope(),
            automatic_silent_renew: true,
            renewal_lead_time: default_lead_time(),
            renewal_retry_interval: default_retry_interval(),
            load_user_info: false,
            state_ttl: default_state_ttl(),
            extra_query_params: BTreeMap::new(),
            metadata: None,
        }
    }

    /// Create settings from environment variables.
    ///
    /// # Required env vars
    /// - `OIDC_AUTHORITY`: provider base URL (discovery is fetched from it)
    /// - `OIDC_CLIENT_ID`: client identifier
    /// - `OIDC_REDIRECT_URI`: sign-in callback URL
    ///
    /// # Optional env vars
    /// - `OIDC_POST_LOGOUT_REDIRECT_URI`
    /// - `OIDC_SILENT_REDIRECT_URI`
    /// - `OIDC_SCOPE`: space-separated scopes
    /// - `OIDC_AUTOMATIC_SILENT_RENEW`: `"0"` or `"false"` disables renewal
    /// - `OIDC_LOAD_USER_INFO`: `"1"` or `"true"` merges userinfo claims into the profile
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if required env vars are missing or URLs are invalid.
    pub fn from_env() -> Result<Self, Error> {
        let authority = required_url("OIDC_AUTHORITY")?;
        let client_id = std::env::var("OIDC_CLIENT_ID")
            .map_err(|_| Error::Config("OIDC_CLIENT_ID is required".into()))?;
        let redirect_uri = required_url("OIDC_REDIRECT_URI")?;

        let mut settings = Self::new(authority, client_id, redirect_uri);

        if let Some(url) = optional_url("OIDC_POST_LOGOUT_REDIRECT_URI")? {
            settings = settings.with_post_logout_redirect_uri(url);
        }
        if let Some(url) = optional_url("OIDC_SILENT_REDIRECT_URI")? {
            settings = settings.with_silent_redirect_uri(url);
        }
        if let Ok(scope) = std::env::var("OIDC_SCOPE") {
            settings = settings.with_scope(scope);
        }
        if matches!(
            std::env::var("OIDC_AUTOMATIC_SILENT_RENEW").as_deref(),
            Ok("0") | Ok("false"),
        ) {
            settings = settings.with_automatic_silent_renew(false);
        }
        if matches!(
            std::env::var("OIDC_LOAD_USER_INFO").as_deref(),
            Ok("1") | Ok("true"),
        ) {
            settings = settings.with_load_user_info(true);
        }

        Ok(settings)
    }

    /// Check the settings can drive an authorization-code flow.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<(), Error> {
        if self.client_id.trim().is_empty() {
            return Err(Error::Config("client_id must not be empty".into()));
        }
        for (name, url) in [
            ("authority", &self.authority),
            ("redirect_uri", &self.redirect_uri),
        ] {
            if !matches!(url.scheme(), "http" | "https") {
                return Err(Error::Config(format!("{name} must be an http(s) URL: {url}")));
            }
        }
        if self.response_type != DEFAULT_RESPONSE_TYPE {
            return Err(Error::Config(format!(
                "unsupported response_type '{}', only 'code' is supported",
                self.response_type
            )));
        }
        if !self.scope.split_whitespace().any(|s| s == "openid") {
            return Err(Error::Config("scope must include 'openid'".into()));
        }
        Ok(())
    }

    #[must_use]
    pub fn with_post_logout_redirect_uri(mut self, url: Url) -> Self {
        self.post_logout_redirect_uri = Some(url);
        self
    }

    /// Callback for hidden-frame renewal (used when no refresh token is available).
    #[must_use]
    pub fn with_silent_redirect_uri(mut self, url: Url) -> Self {
        self.silent_redirect_uri = Some(url);
        self
    }

    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    #[must_use]
    pub fn with_response_type(mut self, response_type: impl Into<String>) -> Self {
        self.response_type = response_type.into();
        self
    }

    #[must_use]
    pub fn with_automatic_silent_renew(mut self, enabled: bool) -> Self {
        self.automatic_silent_renew = enabled;
        self
    }

    /// How long before expiry the renewal timer fires (default 60 s).
    #[must_use]
    pub fn with_renewal_lead_time(mut self, lead: Duration) -> Self {
        self.renewal_lead_time = lead;
        self
    }

    /// Delay before the next attempt after a failed renewal (default 30 s).
    #[must_use]
    pub fn with_renewal_retry_interval(mut self, interval: Duration) -> Self {
        self.renewal_retry_interval = interval;
        self
    }

    #[must_use]
    pub fn with_load_user_info(mut self, enabled: bool) -> Self {
        self.load_user_info = enabled;
        self
    }

    /// Lifetime of pending sign-in/sign-out state entries (default 10 min).
    #[must_use]
    pub fn with_state_ttl(mut self, ttl: Duration) -> Self {
        self.state_ttl = ttl;
        self
    }

    /// Extra query parameters appended to every authorization request.
    #[must_use]
    pub fn with_extra_query_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_query_params.insert(name.into(), value.into());
        self
    }

    /// Use explicit endpoints instead of fetching the discovery document.
    #[must_use]
    pub fn with_metadata(mut self, metadata: ProviderMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    #[must_use]
    pub fn authority(&self) -> &Url {
        &self.authority
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub fn redirect_uri(&self) -> &Url {
        &self.redirect_uri
    }

    #[must_use]
    pub fn post_logout_redirect_uri(&self) -> Option<&Url> {
        self.post_logout_redirect_uri.as_ref()
    }

    #[must_use]
    pub fn silent_redirect_uri(&self) -> Option<&Url> {
        self.silent_redirect_uri.as_ref()
    }

    #[must_use]
    pub fn response_type(&self) -> &str {
        &self.response_type
    }

    #[must_use]
    pub fn scope(&self) -> &str {
        &self.scope
    }

    #[must_use]
    pub fn automatic_silent_renew(&self) -> bool {
        self.automatic_silent_renew
    }

    #[must_use]
    pub fn renewal_lead_time(&self) -> Duration {
        self.renewal_lead_time
    }

    #[must_use]
    pub fn renewal_retry_interval(&self) -> Duration {
        self.renewal_retry_interval
    }

    #[must_use]
    pub fn load_user_info(&self) -> bool {
        self.load_user_info
    }

    #[must_use]
    pub fn state_ttl(&self) -> Duration {
        self.state_ttl
    }

    #[must_use]
    pub fn metadata(&self) -> Option<&ProviderMetadata> {
        self.metadata.as_ref()
    }

    /// Storage key under which the session for this client is persisted.
    #[must_use]
    pub fn session_storage_key(&self) -> String {
        format!(
            "oidc.user:{}:{}",
            self.authority.as_str().trim_end_matches('/'),
            self.client_id
        )
    }
}

fn required_url(var: &str) -> Result<Url, Error> {
    let raw = std::env::var(var).map_err(|_| Error::Config(format!("{var} is required")))?;
    raw.parse()
        .map_err(|e| Error::Config(format!("{var}: {e}")))
}

fn optional_url(var: &str) -> Result<Option<Url>, Error> {
    match std::env::var(var) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("{var}: {e}"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_settings() -> OidcSettings {
        OidcSettings::new(
            "https://idp.example".parse().unwrap(),
            "abc",
            "https://app.example/cb".parse().unwrap(),
        )
    }

    #[test]
    fn defaults_applied() {
        let settings = test_settings();
        assert_eq!(settings.response_type(), "code");
        assert_eq!(settings.scope(), "openid profile email");
        assert!(settings.automatic_silent_renew());
        assert_eq!(settings.renewal_lead_time(), Duration::from_secs(60));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn deserialized_settings_get_defaults() {
        let settings: OidcSettings = serde_json::from_str(
            r#"{
                "authority": "https://idp.example",
                "client_id": "abc",
                "redirect_uri": "https://app.example/cb",
                "renewal_lead_time": 120
            }"#,
        )
        .unwrap();
        assert_eq!(settings.scope(), "openid profile email");
        assert_eq!(settings.response_type(), "code");
        assert_eq!(settings.renewal_lead_time(), Duration::from_secs(120));
        assert_eq!(settings.state_ttl(), Duration::from_secs(600));
    }

    #[test]
    fn caller_overrides_win() {
        let settings = test_settings()
            .with_scope("openid api")
            .with_automatic_silent_renew(false);
        assert_eq!(settings.scope(), "openid api");
        assert!(!settings.automatic_silent_renew());
    }

    #[test]
    fn validation_rejects_bad_settings() {
        assert!(matches!(
            test_settings().with_response_type("token").validate(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            test_settings().with_scope("profile").validate(),
            Err(Error::Config(_))
        ));
        let no_client = OidcSettings::new(
            "https://idp.example".parse().unwrap(),
            " ",
            "https://app.example/cb".parse().unwrap(),
        );
        assert!(matches!(no_client.validate(), Err(Error::Config(_))));
        let bad_scheme = OidcSettings::new(
            "ftp://idp.example".parse().unwrap(),
            "abc",
            "https://app.example/cb".parse().unwrap(),
        );
        assert!(matches!(bad_scheme.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn storage_key_is_per_client() {
        assert_eq!(
            test_settings().session_storage_key(),
            "oidc.user:https://idp.example:abc"
        );
    }
}
