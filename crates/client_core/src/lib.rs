pub mod api;
pub mod config;
pub mod credentials;
pub mod dispatcher;
pub mod error;
pub mod http;
pub mod realtime;
pub mod refresh;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::info;

pub use api::{MarketplaceApi, SignupRequest};
pub use config::{load_settings, ClientSettings, ReconnectPolicy};
pub use credentials::CredentialStore;
pub use dispatcher::{EventDispatcher, Handler, Subscription};
pub use error::{ApiError, ClientError, FrameError};
pub use http::{ApiClient, ApiResult};
pub use realtime::{ConnectionEvent, ConnectionManager, ConnectionState, RealtimeError};
pub use refresh::{RefreshError, TokenRefresher};
pub use shared::{
    domain::{ConversationId, MessageId, TokenPair, UserId},
    protocol::{ClientFrame, Envelope, EventTag, ServerEvent},
};

/// HTTP and realtime halves wired to one credential store.
pub struct MarketplaceClient {
    pub api: MarketplaceApi,
    pub realtime: ConnectionManager,
}

impl MarketplaceClient {
    /// Opens the on-disk credential store named by the settings and starts the
    /// realtime task (disconnected until [`ConnectionManager::connect`]).
    pub async fn init(settings: &ClientSettings) -> Result<Self> {
        let credentials = CredentialStore::open_sqlite(&settings.credentials_database_url)
            .await
            .with_context(|| {
                format!(
                    "failed to open credential store at {}",
                    settings.credentials_database_url
                )
            })?;
        Self::with_credentials(settings, credentials)
    }

    pub fn with_credentials(settings: &ClientSettings, credentials: CredentialStore) -> Result<Self> {
        let client = ApiClient::new(settings, credentials.clone())?;
        let realtime = ConnectionManager::start(settings, credentials, EventDispatcher::new())?;
        info!(api = client.base_url(), realtime = %settings.realtime_url, "client initialized");
        Ok(Self {
            api: MarketplaceApi::new(client),
            realtime,
        })
    }

    pub fn events(&self) -> &EventDispatcher {
        self.realtime.dispatcher()
    }

    pub fn credentials(&self) -> &CredentialStore {
        self.api.client().credentials()
    }

    pub fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.realtime.subscribe_events()
    }

    /// Disconnects the realtime channel and stops its task.
    pub async fn teardown(self) {
        self.realtime.disconnect().await;
        self.realtime.shutdown().await;
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
