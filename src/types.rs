use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Stable subject identifier (OIDC `sub` claim).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into)]
#[serde(transparent)]
pub struct SubjectId(pub String);

/// Decoded identity claims.
///
/// An open mapping: providers add whatever they like. Read `role` through
/// [`ClaimSet::roles`], never directly, because providers send it either as a
/// string or as an array of strings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClaimSet(Map<String, JsonValue>);

impl ClaimSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a claim.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&JsonValue> {
        self.0.get(name)
    }

    /// A claim as a non-empty string.
    #[must_use]
    pub fn string(&self, name: &str) -> Option<&str> {
        self.0
            .get(name)
            .and_then(JsonValue::as_str)
            .filter(|s| !s.is_empty())
    }

    /// The `sub` claim.
    #[must_use]
    pub fn subject(&self) -> Option<SubjectId> {
        self.string("sub").map(|s| SubjectId(s.to_owned()))
    }

    /// The `role` claim normalized to a list. Empty when absent.
    #[must_use]
    pub fn roles(&self) -> Vec<String> {
        match self.0.get("role") {
            Some(JsonValue::String(role)) if !role.is_empty() => vec![role.clone()],
            Some(JsonValue::Array(items)) => items
                .iter()
                .filter_map(JsonValue::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// A boolean claim. Accepts `true` and the string `"true"`.
    #[must_use]
    pub fn flag(&self, name: &str) -> bool {
        match self.0.get(name) {
            Some(JsonValue::Bool(b)) => *b,
            Some(JsonValue::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    /// Fill in claims missing from `self` with those from `other`.
    ///
    /// `sub` is never taken from `other`.
    pub fn merge(&mut self, other: ClaimSet) {
        for (name, value) in other.0 {
            if name == "sub" {
                continue;
            }
            self.0.entry(name).or_insert(value);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &JsonValue)> {
        self.0.iter()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Map<String, JsonValue>> for ClaimSet {
    fn from(map: Map<String, JsonValue>) -> Self {
        Self(map)
    }
}

/// The authenticated principal's credentials and claims.
///
/// Only [`IdentityBroker`](crate::IdentityBroker) creates sessions. Consumers
/// see them through [`SessionProjection`](crate::SessionProjection).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Session {
    pub access_token: String,
    pub token_type: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub profile: ClaimSet,
    /// Access token expiry, epoch seconds.
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub session_state: Option<String>,
}

impl Session {
    #[must_use]
    pub fn new(access_token: impl Into<String>, token_type: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: token_type.into(),
            refresh_token: None,
            id_token: None,
            profile: ClaimSet::default(),
            expires_at: None,
            scope: None,
            session_state: None,
        }
    }

    #[must_use]
    pub fn with_profile(mut self, profile: ClaimSet) -> Self {
        self.profile = profile;
        self
    }

    #[must_use]
    pub fn with_expires_at(mut self, expires_at: i64) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    #[must_use]
    pub fn with_refresh_token(mut self, token: impl Into<String>) -> Self {
        self.refresh_token = Some(token.into());
        self
    }

    #[must_use]
    pub fn with_id_token(mut self, token: impl Into<String>) -> Self {
        self.id_token = Some(token.into());
        self
    }

    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Whether the session is unusable at `now` (epoch seconds).
    ///
    /// A session without an access token counts as expired.
    #[must_use]
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.access_token.is_empty() || self.expires_at.is_some_and(|exp| exp <= now)
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_epoch_seconds())
    }

    /// Seconds until expiry; `None` when the provider gave no lifetime.
    #[must_use]
    pub fn expires_in(&self) -> Option<i64> {
        self.expires_at.map(|exp| exp - now_epoch_seconds())
    }

    /// Granted scopes, split on whitespace.
    pub fn scopes(&self) -> impl Iterator<Item = &str> {
        self.scope.as_deref().unwrap_or_default().split_whitespace()
    }

    /// `"<token_type> <access_token>"`.
    #[must_use]
    pub fn authorization_header_value(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }
}

/// Derived lifecycle state of the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SessionState {
    Unknown,
    Loading,
    Authenticated,
    Anonymous,
    Error,
}

pub(crate) fn now_epoch_seconds() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}
