use std::sync::Arc;

use shared::domain::TokenPair;
use storage::{CredentialBackend, MemoryCredentialStore, SqliteCredentialStore};
use tracing::{debug, warn};

/// Storage facade shared by the HTTP pipeline, the refresher and the realtime
/// connection. Backend failures are logged and read as "no credentials"; the
/// backend then rejects the unauthenticated request on its own terms.
#[derive(Clone)]
pub struct CredentialStore {
    backend: Arc<dyn CredentialBackend>,
}

impl CredentialStore {
    pub fn new(backend: Arc<dyn CredentialBackend>) -> Self {
        Self { backend }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCredentialStore::new()))
    }

    pub async fn open_sqlite(database_url: &str) -> anyhow::Result<Self> {
        let store = SqliteCredentialStore::open(database_url).await?;
        Ok(Self::new(Arc::new(store)))
    }

    pub async fn read(&self) -> Option<TokenPair> {
        match self.backend.load().await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "credentials: read failed, continuing without tokens");
                None
            }
        }
    }

    /// Persists both tokens as one unit. Returns whether the write landed.
    pub async fn save(&self, pair: &TokenPair) -> bool {
        match self.backend.store(pair).await {
            Ok(()) => {
                debug!("credentials: token pair saved");
                true
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "credentials: save failed");
                false
            }
        }
    }

    pub async fn clear(&self) {
        match self.backend.erase().await {
            Ok(()) => debug!("credentials: cleared"),
            Err(err) => warn!(error = %format!("{err:#}"), "credentials: clear failed"),
        }
    }

    pub async fn access_token(&self) -> Option<String> {
        self.read().await.map(|pair| pair.access_token)
    }

    pub async fn refresh_token(&self) -> Option<String> {
        self.read().await.map(|pair| pair.refresh_token)
    }
}
