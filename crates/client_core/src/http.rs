use std::sync::Arc;

use reqwest::{Client, Method};
use serde::Serialize;
use serde_json::Value;
use shared::protocol::Envelope;
use tracing::{debug, info_span, warn, Instrument};
use url::Url;
use uuid::Uuid;

use crate::{
    config::ClientSettings,
    credentials::CredentialStore,
    error::{ApiError, ClientError},
    refresh::TokenRefresher,
};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

pub type ApiResult<T = Envelope> = Result<T, ApiError>;

struct RawResponse {
    status: u16,
    body: Vec<u8>,
}

/// Authenticated HTTP client. Every call resolves to an [`ApiResult`]; a 401
/// on an authenticated call triggers at most one token refresh and one retry.
pub struct ApiClient {
    http: Client,
    base_url: String,
    credentials: CredentialStore,
    refresher: Arc<TokenRefresher>,
}

impl ApiClient {
    pub fn new(settings: &ClientSettings, credentials: CredentialStore) -> Result<Self, ClientError> {
        let base = Url::parse(&settings.api_base_url).map_err(|source| ClientError::InvalidUrl {
            field: "api_base_url",
            value: settings.api_base_url.clone(),
            source,
        })?;
        let base_url = base.as_str().trim_end_matches('/').to_string();
        let http = Client::builder().timeout(settings.request_timeout).build()?;
        let refresher = Arc::new(TokenRefresher::new(
            http.clone(),
            join_url(&base_url, &settings.refresh_path),
            credentials.clone(),
        ));
        Ok(Self {
            http,
            base_url,
            credentials,
            refresher,
        })
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn refresher(&self) -> &Arc<TokenRefresher> {
        &self.refresher
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        requires_auth: bool,
    ) -> ApiResult {
        let request_id = Uuid::new_v4();
        let span = info_span!("api", %method, path, %request_id);
        self.send_inner(method, path, body, requires_auth, request_id)
            .instrument(span)
            .await
    }

    async fn send_inner(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        requires_auth: bool,
        request_id: Uuid,
    ) -> ApiResult {
        let url = join_url(&self.base_url, path);
        let token = if requires_auth {
            let token = self.credentials.access_token().await;
            if token.is_none() {
                debug!("api: no access token, sending unauthenticated");
            }
            token
        } else {
            None
        };

        let mut response = self
            .execute(&method, &url, body, token.as_deref(), request_id)
            .await?;

        if requires_auth && response.status == 401 {
            let pair = match self.refresher.refresh_rejected(token.as_deref()).await {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(error = %err, "api: refresh failed, clearing credentials");
                    self.credentials.clear().await;
                    return Err(ApiError::auth(format!("session expired: {err}")));
                }
            };
            debug!("api: retrying with refreshed token");
            response = self
                .execute(&method, &url, body, Some(&pair.access_token), request_id)
                .await?;
        }

        let envelope = interpret(response.status, &response.body)?;
        if let Some(pair) = envelope.token_pair() {
            debug!("api: persisting token pair from response");
            self.credentials.save(&pair).await;
        }
        Ok(envelope)
    }

    async fn execute(
        &self,
        method: &Method,
        url: &str,
        body: Option<&Value>,
        bearer: Option<&str>,
        request_id: Uuid,
    ) -> Result<RawResponse, ApiError> {
        let mut request = self
            .http
            .request(method.clone(), url)
            .header(REQUEST_ID_HEADER, request_id.to_string());
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|err| {
            warn!(error = %err, "api: transport failure");
            ApiError::network(err.to_string())
        })?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|err| ApiError::network(err.to_string()))?;
        debug!(status, bytes = body.len(), "api: response received");
        Ok(RawResponse {
            status,
            body: body.to_vec(),
        })
    }

    pub async fn get(&self, path: &str) -> ApiResult {
        self.send(Method::GET, path, None, true).await
    }

    pub async fn delete(&self, path: &str) -> ApiResult {
        self.send(Method::DELETE, path, None, true).await
    }

    pub async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> ApiResult {
        let body = to_body(body)?;
        self.send(Method::POST, path, Some(&body), true).await
    }

    pub async fn put<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> ApiResult {
        let body = to_body(body)?;
        self.send(Method::PUT, path, Some(&body), true).await
    }

    pub async fn patch<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> ApiResult {
        let body = to_body(body)?;
        self.send(Method::PATCH, path, Some(&body), true).await
    }

    /// POST without credentials (login, signup, password reset).
    pub async fn post_public<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> ApiResult {
        let body = to_body(body)?;
        self.send(Method::POST, path, Some(&body), false).await
    }
}

fn to_body<B: Serialize + ?Sized>(body: &B) -> ApiResult<Value> {
    serde_json::to_value(body).map_err(|err| ApiError::parse(format!("request body: {err}")))
}

pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Maps a raw response onto the error taxonomy. Non-2xx statuses and
/// `success: false` bodies are treated alike.
pub fn interpret(status: u16, body: &[u8]) -> ApiResult {
    let envelope = Envelope::normalize(status, body)
        .map_err(|err| ApiError::parse(format!("status {status}: {err}")))?;

    match status {
        200..=299 if envelope.success => Ok(envelope),
        401 | 403 => Err(ApiError::auth(
            envelope
                .message
                .or(envelope.error)
                .unwrap_or_else(|| format!("status {status}")),
        )),
        200..=499 => Err(ApiError::Validation {
            status,
            error: envelope.error,
            message: envelope.message,
        }),
        _ => Err(ApiError::Server {
            status,
            error: envelope.error,
            message: envelope.message,
        }),
    }
}

#[cfg(test)]
#[path = "tests/http_tests.rs"]
mod tests;
