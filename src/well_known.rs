use serde::{Deserialize, Serialize};
use url::Url;

/// Subset of the OpenID Provider discovery document
/// (`/.well-known/openid-configuration`) the client needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ProviderMetadata {
    pub issuer: String,
    pub authorization_endpoint: Url,
    pub token_endpoint: Url,
    #[serde(default)]
    pub userinfo_endpoint: Option<Url>,
    #[serde(default)]
    pub end_session_endpoint: Option<Url>,
    #[serde(default)]
    pub jwks_uri: Option<Url>,
    #[serde(default)]
    pub code_challenge_methods_supported: Vec<String>,
}

impl ProviderMetadata {
    #[must_use]
    pub fn new(issuer: impl Into<String>, authorization_endpoint: Url, token_endpoint: Url) -> Self {
        Self {
            issuer: issuer.into(),
            authorization_endpoint,
            token_endpoint,
            userinfo_endpoint: None,
            end_session_endpoint: None,
            jwks_uri: None,
            code_challenge_methods_supported: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_userinfo_endpoint(mut self, url: Url) -> Self {
        self.userinfo_endpoint = Some(url);
        self
    }

    #[must_use]
    pub fn with_end_session_endpoint(mut self, url: Url) -> Self {
        self.end_session_endpoint = Some(url);
        self
    }
}

/// Discovery document URL for an authority.
pub(crate) fn discovery_url(authority: &Url) -> String {
    format!(
        "{}/.well-known/openid-configuration",
        authority.as_str().trim_end_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_url_handles_trailing_slash() {
        let with_path: Url = "https://idp.example/realms/app/".parse().unwrap();
        assert_eq!(
            discovery_url(&with_path),
            "https://idp.example/realms/app/.well-known/openid-configuration"
        );
        let bare: Url = "https://idp.example".parse().unwrap();
        assert_eq!(
            discovery_url(&bare),
            "https://idp.example/.well-known/openid-configuration"
        );
    }

    #[test]
    fn parses_minimal_document() {
        let doc: ProviderMetadata = serde_json::from_value(serde_json::json!({
            "issuer": "https://idp.example",
            "authorization_endpoint": "https://idp.example/authorize",
            "token_endpoint": "https://idp.example/token",
            "response_types_supported": ["code"]
        }))
        .unwrap();
        assert!(doc.end_session_endpoint.is_none());
        assert_eq!(doc.token_endpoint.as_str(), "https://idp.example/token");
    }
}
