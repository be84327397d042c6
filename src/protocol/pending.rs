use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::storage::SessionStorage;

pub(crate) const STATE_KEY_PREFIX: &str = "oidc.state:";

/// Which flow a pending request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    SignIn,
    SilentRenew,
    SignOut,
}

/// Data kept between starting a redirect and handling its callback.
///
/// Stored under `oidc.state:<id>`; the provider only ever sees `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PendingRequest {
    pub(crate) id: String,
    pub(crate) kind: RequestKind,
    #[serde(default)]
    pub(crate) code_verifier: Option<String>,
    #[serde(default)]
    pub(crate) nonce: Option<String>,
    pub(crate) redirect_uri: String,
    #[serde(default)]
    pub(crate) return_location: Option<String>,
    #[serde(default)]
    pub(crate) renewal_tick: Option<u64>,
    pub(crate) created_at: i64,
}

impl PendingRequest {
    pub(crate) fn is_stale(&self, now: i64, ttl_secs: i64) -> bool {
        now - self.created_at > ttl_secs
    }
}

fn key(id: &str) -> String {
    format!("{STATE_KEY_PREFIX}{id}")
}

pub(crate) async fn save(storage: &dyn SessionStorage, request: &PendingRequest) -> Result<(), Error> {
    let json = serde_json::to_string(request).map_err(|e| Error::Storage(e.to_string()))?;
    storage.set(&key(&request.id), json).await
}

/// Remove and return the pending request for `id`. Entries are single-use.
pub(crate) async fn take(
    storage: &dyn SessionStorage,
    id: &str,
) -> Result<Option<PendingRequest>, Error> {
    let key = key(id);
    let Some(raw) = storage.get(&key).await? else {
        return Ok(None);
    };
    storage.remove(&key).await?;
    match serde_json::from_str(&raw) {
        Ok(request) => Ok(Some(request)),
        Err(e) => {
            tracing::warn!(error = %e, "Discarding unreadable pending request");
            Ok(None)
        }
    }
}

pub(crate) async fn clear_stale(
    storage: &dyn SessionStorage,
    now: i64,
    ttl_secs: i64,
) -> Result<usize, Error> {
    let mut removed = 0;
    for key in storage.keys(STATE_KEY_PREFIX).await? {
        let stale = match storage.get(&key).await? {
            Some(raw) => serde_json::from_str::<PendingRequest>(&raw)
                .map(|r| r.is_stale(now, ttl_secs))
                .unwrap_or(true),
            None => false,
        };
        if stale {
            storage.remove(&key).await?;
            removed += 1;
        }
    }
    Ok(removed)
}
