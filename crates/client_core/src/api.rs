use serde::Serialize;
use serde_json::json;
use shared::domain::ConversationId;
use tracing::{info, warn};

use crate::http::{ApiClient, ApiResult};

#[derive(Debug, Clone, Serialize)]
pub struct SignupRequest {
    pub name: String,
    pub email: String,
    pub password: String,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

/// Marketplace endpoints used by the app shell. Payloads stay as
/// [`Envelope`](shared::protocol::Envelope) data for the screens to decode.
pub struct MarketplaceApi {
    client: ApiClient,
}

impl MarketplaceApi {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    /// Signs in; the token pair in the response is persisted by the pipeline.
    pub async fn login(&self, email: &str, password: &str) -> ApiResult {
        let envelope = self
            .client
            .post_public("/auth/login", &LoginRequest { email, password })
            .await?;
        if envelope.token_pair().is_none() {
            warn!("api: login succeeded without a token pair");
        }
        info!("api: logged in");
        Ok(envelope)
    }

    pub async fn signup(&self, request: &SignupRequest) -> ApiResult {
        self.client.post_public("/auth/signup", request).await
    }

    /// Tells the backend to revoke the refresh token, then forgets local
    /// credentials whatever the backend answered.
    pub async fn logout(&self) {
        let credentials = self.client.credentials();
        if let Some(refresh_token) = credentials.refresh_token().await {
            if let Err(err) = self
                .client
                .post("/auth/logout", &json!({ "refreshToken": refresh_token }))
                .await
            {
                warn!(error = %err, "api: logout call failed, clearing locally");
            }
        }
        credentials.clear().await;
        info!("api: logged out");
    }

    pub async fn profile(&self) -> ApiResult {
        self.client.get("/profile").await
    }

    pub async fn conversations(&self) -> ApiResult {
        self.client.get("/conversations").await
    }

    pub async fn messages(&self, conversation_id: &ConversationId) -> ApiResult {
        self.client
            .get(&format!("/conversations/{conversation_id}/messages"))
            .await
    }

    pub async fn send_message(&self, conversation_id: &ConversationId, text: &str) -> ApiResult {
        self.client
            .post(
                &format!("/conversations/{conversation_id}/messages"),
                &json!({ "content": text }),
            )
            .await
    }
}
