use std::sync::Arc;

use parking_lot::Mutex;
use url::Url;

use crate::error::Error;

/// Host navigation: full-page redirects to and from the identity provider.
///
/// Browser hosts set `window.location`; desktop hosts open the system
/// browser; headless hosts may record or ignore the request.
pub trait Navigator: Send + Sync + 'static {
    /// Navigate the whole page to `url`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RedirectInitiation`] if the host cannot navigate.
    fn redirect(&self, url: &Url) -> Result<(), Error>;

    /// Load `url` without user-visible navigation (hidden frame renewal).
    ///
    /// # Errors
    ///
    /// The default implementation reports that the host has no hidden frames.
    fn navigate_hidden(&self, url: &Url) -> Result<(), Error> {
        let _ = url;
        Err(Error::RedirectInitiation(
            "host does not support hidden navigation".into(),
        ))
    }

    /// The location the user is currently on, used as the default return location.
    fn current_location(&self) -> Option<String> {
        None
    }
}

/// Navigator for hosts without navigation: requests are logged and dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNavigator;

impl Navigator for NoopNavigator {
    fn redirect(&self, url: &Url) -> Result<(), Error> {
        tracing::debug!(%url, "Navigation requested on a host without navigation");
        Ok(())
    }
}

/// Records every navigation request instead of performing it.
///
/// Useful for headless hosts that hand the URL to the user themselves, and in tests.
#[derive(Debug, Clone, Default)]
pub struct RecordingNavigator {
    inner: Arc<Mutex<Recorded>>,
}

#[derive(Debug, Default)]
struct Recorded {
    redirects: Vec<Url>,
    hidden: Vec<Url>,
    location: Option<String>,
}

impl RecordingNavigator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend the user is currently at `location`.
    pub fn set_current_location(&self, location: impl Into<String>) {
        self.inner.lock().location = Some(location.into());
    }

    #[must_use]
    pub fn redirects(&self) -> Vec<Url> {
        self.inner.lock().redirects.clone()
    }

    #[must_use]
    pub fn hidden_navigations(&self) -> Vec<Url> {
        self.inner.lock().hidden.clone()
    }

    #[must_use]
    pub fn last_redirect(&self) -> Option<Url> {
        self.inner.lock().redirects.last().cloned()
    }
}

impl Navigator for RecordingNavigator {
    fn redirect(&self, url: &Url) -> Result<(), Error> {
        self.inner.lock().redirects.push(url.clone());
        Ok(())
    }

    fn navigate_hidden(&self, url: &Url) -> Result<(), Error> {
        self.inner.lock().hidden.push(url.clone());
        Ok(())
    }

    fn current_location(&self) -> Option<String> {
        self.inner.lock().location.clone()
    }
}

/// Read a query parameter from a navigation URL.
pub(crate) fn query_param(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_navigator_keeps_order() {
        let nav = RecordingNavigator::new();
        nav.redirect(&"https://a.example/1".parse().unwrap()).unwrap();
        nav.redirect(&"https://a.example/2".parse().unwrap()).unwrap();
        assert_eq!(nav.redirects().len(), 2);
        assert_eq!(nav.last_redirect().unwrap().path(), "/2");
        assert!(nav.current_location().is_none());
        nav.set_current_location("/reports");
        assert_eq!(nav.current_location().as_deref(), Some("/reports"));
    }

    #[test]
    fn noop_navigator_has_no_hidden_frames() {
        let url: Url = "https://idp.example/authorize".parse().unwrap();
        assert!(NoopNavigator.redirect(&url).is_ok());
        assert!(matches!(
            NoopNavigator.navigate_hidden(&url),
            Err(Error::RedirectInitiation(_))
        ));
    }

    #[test]
    fn query_param_decodes() {
        let url: Url = "https://app.example/cb?code=x%20y&state=s".parse().unwrap();
        assert_eq!(query_param(&url, "code").as_deref(), Some("x y"));
        assert!(query_param(&url, "error").is_none());
    }
}
