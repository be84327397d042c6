//! Access decisions for protected views and actions.

use crate::broker::{IdentityBroker, SignInOptions};
use crate::error::Error;
use crate::projection::SessionProjection;

/// What a protected view requires.
#[derive(Debug, Clone, Default)]
pub struct GuardOptions {
    /// Where to come back after sign-in. Defaults to the navigator's current location.
    pub return_location: Option<String>,
    /// Any one of these roles grants access. Empty means any authenticated user.
    pub required_roles: Vec<String>,
    pub prompt_register: bool,
    pub tenant: Option<String>,
}

impl GuardOptions {
    #[must_use]
    pub fn returning_to(location: impl Into<String>) -> Self {
        Self {
            return_location: Some(location.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_required_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_roles = roles.into_iter().map(Into::into).collect();
        self
    }
}

/// Decides whether the current user may enter a view, redirecting to sign-in otherwise.
#[derive(Debug, Clone)]
pub struct AuthorizationGuard {
    broker: IdentityBroker,
    projection: SessionProjection,
}

impl AuthorizationGuard {
    #[must_use]
    pub fn new(broker: IdentityBroker, projection: SessionProjection) -> Self {
        Self { broker, projection }
    }

    /// `true` when the user is signed in and holds one of the required roles.
    ///
    /// Without a session this starts sign-in (once) and returns `false`.
    ///
    /// # Errors
    ///
    /// Propagates failures from loading the persisted session or starting the redirect.
    pub async fn can_activate(&self, options: GuardOptions) -> Result<bool, Error> {
        if !self.projection.is_authenticated() {
            self.broker.load_persisted_session().await?;
        }

        if !self.projection.is_authenticated() {
            tracing::debug!(
                return_location = ?options.return_location,
                "No session; starting sign-in"
            );
            self.broker
                .initiate_sign_in(SignInOptions {
                    return_location: options.return_location,
                    prompt_register: options.prompt_register,
                    tenant: options.tenant,
                })
                .await?;
            return Ok(false);
        }

        if options.required_roles.is_empty() {
            return Ok(true);
        }
        let granted = self.has_any_role_now(&options.required_roles);
        if !granted {
            tracing::debug!(required = ?options.required_roles, "Missing required role");
        }
        Ok(granted)
    }

    /// Like [`can_activate`](Self::can_activate), but a refusal is an error.
    ///
    /// # Errors
    ///
    /// [`Error::AccessDenied`] when sign-in was started or a role is missing.
    pub async fn require_access(&self, options: GuardOptions) -> Result<(), Error> {
        if self.can_activate(options).await? {
            Ok(())
        } else {
            Err(Error::AccessDenied)
        }
    }

    // Last-known values; may lag a pending load.

    #[must_use]
    pub fn is_authenticated_now(&self) -> bool {
        self.projection.is_authenticated()
    }

    #[must_use]
    pub fn has_role_now(&self, role: &str) -> bool {
        self.projection.roles().iter().any(|r| r == role)
    }

    #[must_use]
    pub fn has_any_role_now<S: AsRef<str>>(&self, roles: &[S]) -> bool {
        let held = self.projection.roles();
        roles.iter().any(|r| held.iter().any(|h| h == r.as_ref()))
    }

    #[must_use]
    pub fn has_all_roles_now<S: AsRef<str>>(&self, roles: &[S]) -> bool {
        let held = self.projection.roles();
        roles.iter().all(|r| held.iter().any(|h| h == r.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::navigation::RecordingNavigator;
    use crate::testing::{FakeProtocol, session_for, test_settings};
    use crate::types::ClaimSet;

    fn guard(fake: &FakeProtocol, navigator: &RecordingNavigator) -> AuthorizationGuard {
        let broker = IdentityBroker::new(Arc::new(navigator.clone()));
        broker
            .initialize_with(test_settings(), Arc::new(fake.clone()))
            .unwrap();
        let projection = SessionProjection::new(broker.clone());
        AuthorizationGuard::new(broker, projection)
    }

    fn with_roles(roles: serde_json::Value) -> crate::types::Session {
        session_for("1", 3600).with_profile(ClaimSet::new().with("sub", "1").with("role", roles))
    }

    #[tokio::test]
    async fn anonymous_user_is_redirected_once() {
        let fake = FakeProtocol::new();
        let navigator = RecordingNavigator::new();
        let guard = guard(&fake, &navigator);

        let allowed = guard
            .can_activate(GuardOptions::returning_to("/reports"))
            .await
            .unwrap();
        assert!(!allowed);
        assert_eq!(navigator.redirects().len(), 1);
    }

    #[tokio::test]
    async fn return_location_defaults_to_current_location() {
        let fake = FakeProtocol::new();
        let navigator = RecordingNavigator::new();
        navigator.set_current_location("/settings");
        let guard = guard(&fake, &navigator);

        assert!(!guard.can_activate(GuardOptions::default()).await.unwrap());

        let callback = FakeProtocol::callback_for(&navigator.last_redirect().unwrap());
        guard.broker.complete_sign_in_callback(&callback).await.unwrap();
        assert_eq!(guard.broker.take_return_location().as_deref(), Some("/settings"));
    }

    #[tokio::test]
    async fn persisted_session_is_loaded_before_deciding() {
        let fake = FakeProtocol::new();
        fake.persist(session_for("1", 3600));
        let navigator = RecordingNavigator::new();
        let guard = guard(&fake, &navigator);

        assert!(guard.can_activate(GuardOptions::default()).await.unwrap());
        assert!(navigator.redirects().is_empty());
    }

    #[tokio::test]
    async fn roles_are_any_of() {
        let fake = FakeProtocol::new();
        fake.persist(with_roles(serde_json::json!(["editor"])));
        let navigator = RecordingNavigator::new();
        let guard = guard(&fake, &navigator);

        let editors = GuardOptions::default().with_required_roles(["admin", "editor"]);
        assert!(guard.can_activate(editors).await.unwrap());

        let admins = GuardOptions::default().with_required_roles(["admin"]);
        assert!(!guard.can_activate(admins.clone()).await.unwrap());
        assert!(matches!(
            guard.require_access(admins).await,
            Err(Error::AccessDenied)
        ));
        assert!(navigator.redirects().is_empty());
    }

    #[tokio::test]
    async fn sync_helpers_read_last_known_roles() {
        let fake = FakeProtocol::new();
        fake.persist(with_roles(serde_json::json!("Admin")));
        let navigator = RecordingNavigator::new();
        let guard = guard(&fake, &navigator);
        assert!(!guard.is_authenticated_now());

        guard.broker.load_persisted_session().await.unwrap();
        assert!(guard.is_authenticated_now());
        assert!(guard.has_role_now("Admin"));
        assert!(guard.has_any_role_now(&["x", "Admin"]));
        assert!(!guard.has_all_roles_now(&["x", "Admin"]));
    }
}
