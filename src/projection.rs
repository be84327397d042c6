//! Read-only views derived from the broker's latest published session.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::broker::IdentityBroker;
use crate::observer::Subscription;
use crate::types::{ClaimSet, Session, SessionState};

/// Which claim and role mark an administrator.
#[derive(Debug, Clone)]
pub struct ProjectionOptions {
    /// Boolean claim that grants admin on its own.
    pub admin_claim: String,
    /// Role name that grants admin.
    pub admin_role: String,
}

impl Default for ProjectionOptions {
    fn default() -> Self {
        Self {
            admin_claim: "is_admin".to_owned(),
            admin_role: "admin".to_owned(),
        }
    }
}

/// The derivations, as free functions over an optional session.
///
/// [`SessionProjection`] and [`SessionView`] both call these; nothing else
/// computes them.
pub mod derive {
    use super::ProjectionOptions;
    use crate::types::{ClaimSet, Session};

    #[must_use]
    pub fn is_authenticated(session: Option<&Session>, now: i64) -> bool {
        session.is_some_and(|s| !s.is_expired_at(now))
    }

    /// `given_name family_name`, then `email`, then `name`, else empty.
    #[must_use]
    pub fn display_name(profile: &ClaimSet) -> String {
        let given = profile.string("given_name");
        let family = profile.string("family_name");
        if given.is_some() || family.is_some() {
            return [given, family]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join(" ");
        }
        profile
            .string("email")
            .or_else(|| profile.string("name"))
            .unwrap_or_default()
            .to_owned()
    }

    #[must_use]
    pub fn roles(profile: &ClaimSet) -> Vec<String> {
        profile.roles()
    }

    #[must_use]
    pub fn is_admin(profile: &ClaimSet, options: &ProjectionOptions) -> bool {
        profile.flag(&options.admin_claim)
            || profile.roles().iter().any(|r| *r == options.admin_role)
    }

    /// `"<token_type> <access_token>"`, or empty when there is no session.
    #[must_use]
    pub fn authorization_header_value(session: Option<&Session>) -> String {
        session
            .map(Session::authorization_header_value)
            .unwrap_or_default()
    }
}

/// Owned snapshot of every derivation at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionView {
    pub state: SessionState,
    pub is_authenticated: bool,
    pub profile: Option<ClaimSet>,
    pub display_name: String,
    pub roles: Vec<String>,
    pub is_admin: bool,
    pub access_token: Option<String>,
    pub authorization_header_value: String,
}

/// Always-current projection of the broker's session.
///
/// Updated synchronously from the broker's notification; reads never block
/// on I/O. Cheap to clone.
#[derive(Clone)]
pub struct SessionProjection {
    inner: Arc<ProjectionInner>,
}

struct ProjectionInner {
    broker: IdentityBroker,
    options: ProjectionOptions,
    latest: Arc<RwLock<Option<Arc<Session>>>>,
    _subscription: Subscription,
}

impl SessionProjection {
    #[must_use]
    pub fn new(broker: IdentityBroker) -> Self {
        Self::with_options(broker, ProjectionOptions::default())
    }

    #[must_use]
    pub fn with_options(broker: IdentityBroker, options: ProjectionOptions) -> Self {
        let latest = Arc::new(RwLock::new(None));
        let subscription = {
            let latest = latest.clone();
            broker.subscribe_to_session_changes(move |session| {
                *latest.write() = session.cloned().map(Arc::new);
            })
        };
        Self {
            inner: Arc::new(ProjectionInner {
                broker,
                options,
                latest,
                _subscription: subscription,
            }),
        }
    }

    #[must_use]
    pub fn broker(&self) -> &IdentityBroker {
        &self.inner.broker
    }

    /// The latest published session, if it has not expired since.
    #[must_use]
    pub fn session(&self) -> Option<Arc<Session>> {
        self.inner
            .latest
            .read()
            .clone()
            .filter(|s| derive::is_authenticated(Some(s), crate::types::now_epoch_seconds()))
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.broker.state()
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.session().is_some()
    }

    #[must_use]
    pub fn profile(&self) -> Option<ClaimSet> {
        self.session().map(|s| s.profile.clone())
    }

    #[must_use]
    pub fn display_name(&self) -> String {
        self.session()
            .map(|s| derive::display_name(&s.profile))
            .unwrap_or_default()
    }

    #[must_use]
    pub fn roles(&self) -> Vec<String> {
        self.session()
            .map(|s| derive::roles(&s.profile))
            .unwrap_or_default()
    }

    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.session()
            .is_some_and(|s| derive::is_admin(&s.profile, &self.inner.options))
    }

    #[must_use]
    pub fn access_token(&self) -> Option<String> {
        self.session().map(|s| s.access_token.clone())
    }

    #[must_use]
    pub fn authorization_header_value(&self) -> String {
        derive::authorization_header_value(self.session().as_deref())
    }

    /// All derivations computed from one read of the session.
    #[must_use]
    pub fn snapshot(&self) -> SessionView {
        let session = self.session();
        let profile = session.as_ref().map(|s| &s.profile);
        SessionView {
            state: self.state(),
            is_authenticated: session.is_some(),
            profile: profile.cloned(),
            display_name: profile.map(derive::display_name).unwrap_or_default(),
            roles: profile.map(derive::roles).unwrap_or_default(),
            is_admin: profile.is_some_and(|p| derive::is_admin(p, &self.inner.options)),
            access_token: session.as_ref().map(|s| s.access_token.clone()),
            authorization_header_value: derive::authorization_header_value(session.as_deref()),
        }
    }
}

impl std::fmt::Debug for SessionProjection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionProjection")
            .field("is_authenticated", &self.is_authenticated())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::navigation::RecordingNavigator;
    use crate::testing::{FakeProtocol, session_for, test_settings};
    use crate::types::now_epoch_seconds;

    fn profile(pairs: &[(&str, serde_json::Value)]) -> ClaimSet {
        pairs
            .iter()
            .fold(ClaimSet::new(), |set, (k, v)| set.with(*k, v.clone()))
    }

    #[test]
    fn display_name_prefers_full_name_then_email_then_name() {
        use serde_json::json;

        let full = profile(&[
            ("sub", json!("1")),
            ("given_name", json!("Ada")),
            ("family_name", json!("Lovelace")),
            ("email", json!("ada@example.com")),
        ]);
        assert_eq!(derive::display_name(&full), "Ada Lovelace");

        let email = profile(&[("sub", json!("1")), ("email", json!("a@b.com"))]);
        assert_eq!(derive::display_name(&email), "a@b.com");

        let name = profile(&[("sub", json!("1")), ("name", json!("ada"))]);
        assert_eq!(derive::display_name(&name), "ada");

        let given_only = profile(&[("sub", json!("1")), ("given_name", json!("Ada"))]);
        assert_eq!(derive::display_name(&given_only), "Ada");

        assert_eq!(derive::display_name(&profile(&[("sub", json!("1"))])), "");
    }

    #[test]
    fn role_shapes_normalize_identically() {
        use serde_json::json;

        let scalar = profile(&[("role", json!("Admin"))]);
        let array = profile(&[("role", json!(["Admin"]))]);
        assert_eq!(derive::roles(&scalar), derive::roles(&array));
        assert_eq!(derive::roles(&scalar), vec!["Admin".to_string()]);
        assert!(derive::roles(&ClaimSet::new()).is_empty());
    }

    #[test]
    fn admin_by_claim_or_role() {
        use serde_json::json;

        let options = ProjectionOptions::default();
        assert!(derive::is_admin(&profile(&[("is_admin", json!(true))]), &options));
        assert!(derive::is_admin(&profile(&[("role", json!(["user", "admin"]))]), &options));
        assert!(!derive::is_admin(&profile(&[("role", json!("Admin"))]), &options));

        let custom = ProjectionOptions {
            admin_claim: "staff".into(),
            admin_role: "Admin".into(),
        };
        assert!(derive::is_admin(&profile(&[("role", json!("Admin"))]), &custom));
    }

    #[test]
    fn expired_session_is_never_authenticated() {
        let now = now_epoch_seconds();
        let expired = session_for("1", -1).with_refresh_token("rt").with_scope("openid");
        assert!(!derive::is_authenticated(Some(&expired), now));
        assert!(derive::is_authenticated(Some(&session_for("1", 60)), now));
        assert!(!derive::is_authenticated(None, now));
    }

    #[test]
    fn header_value_is_empty_without_session() {
        assert_eq!(derive::authorization_header_value(None), "");
        assert_eq!(
            derive::authorization_header_value(Some(&session_for("1", 60))),
            "Bearer at-1"
        );
    }

    #[tokio::test]
    async fn projection_follows_broker() {
        let fake = FakeProtocol::new();
        fake.persist(session_for("1", 3600).with_profile(
            ClaimSet::new()
                .with("sub", "1")
                .with("given_name", "Ada")
                .with("family_name", "Lovelace"),
        ));
        let broker = IdentityBroker::new(Arc::new(RecordingNavigator::new()));
        broker
            .initialize_with(test_settings(), Arc::new(fake.clone()))
            .unwrap();
        let projection = SessionProjection::new(broker.clone());
        assert!(!projection.is_authenticated());
        assert_eq!(projection.state(), SessionState::Loading);

        broker.load_persisted_session().await.unwrap();
        let view = projection.snapshot();
        assert!(view.is_authenticated);
        assert_eq!(view.state, SessionState::Authenticated);
        assert_eq!(view.display_name, "Ada Lovelace");
        assert_eq!(view.authorization_header_value, "Bearer at-1");

        broker.remove_session().await.unwrap();
        assert!(!projection.is_authenticated());
        assert_eq!(projection.display_name(), "");
        assert_eq!(projection.state(), SessionState::Anonymous);
    }
}
