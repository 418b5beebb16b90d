use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use reqwest::Client;
use serde::Serialize;
use shared::{domain::TokenPair, protocol::Envelope};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::credentials::CredentialStore;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefreshError {
    #[error("no-refresh-token")]
    NoRefreshToken,
    #[error("refresh rejected with status {status}")]
    Rejected { status: u16, message: Option<String> },
    #[error("refresh request failed: {0}")]
    Network(String),
    #[error("refresh response could not be parsed: {0}")]
    Parse(String),
    #[error("refresh response did not carry a token pair")]
    MissingTokens,
}

type RefreshFlight = Shared<BoxFuture<'static, Result<TokenPair, RefreshError>>>;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// Exchanges the stored refresh token for a new pair.
///
/// Concurrent callers share a single in-flight exchange: the first caller
/// starts it, everyone arriving before it finishes awaits the same outcome.
pub struct TokenRefresher {
    http: Client,
    refresh_url: String,
    credentials: CredentialStore,
    inflight: Mutex<Option<RefreshFlight>>,
}

impl TokenRefresher {
    pub fn new(http: Client, refresh_url: impl Into<String>, credentials: CredentialStore) -> Self {
        Self {
            http,
            refresh_url: refresh_url.into(),
            credentials,
            inflight: Mutex::new(None),
        }
    }

    pub fn refresh_url(&self) -> &str {
        &self.refresh_url
    }

    pub async fn refresh(&self) -> Result<TokenPair, RefreshError> {
        let flight = {
            let mut inflight = self.inflight.lock().await;
            match inflight.as_ref() {
                Some(flight) => {
                    debug!("refresh: joining in-flight exchange");
                    flight.clone()
                }
                None => {
                    let flight = exchange(
                        self.http.clone(),
                        self.refresh_url.clone(),
                        self.credentials.clone(),
                    )
                    .boxed()
                    .shared();
                    *inflight = Some(flight.clone());
                    flight
                }
            }
        };

        let outcome = flight.clone().await;

        let mut inflight = self.inflight.lock().await;
        if inflight
            .as_ref()
            .is_some_and(|current| current.ptr_eq(&flight))
        {
            *inflight = None;
        }
        outcome
    }

    /// Refresh on behalf of a request whose `rejected` access token got a 401.
    /// When the stored token has already moved on, another caller refreshed in
    /// the meantime and the stored pair is returned without a network call.
    pub async fn refresh_rejected(&self, rejected: Option<&str>) -> Result<TokenPair, RefreshError> {
        if let (Some(rejected), Some(current)) = (rejected, self.credentials.read().await) {
            if current.access_token != rejected {
                debug!("refresh: access token already rotated by another request");
                return Ok(current);
            }
        }
        self.refresh().await
    }
}

async fn exchange(
    http: Client,
    refresh_url: String,
    credentials: CredentialStore,
) -> Result<TokenPair, RefreshError> {
    let Some(refresh_token) = credentials.refresh_token().await else {
        warn!("refresh: no refresh token stored");
        return Err(RefreshError::NoRefreshToken);
    };

    info!("refresh: exchanging refresh token");
    // No Authorization header on this call.
    let response = http
        .post(&refresh_url)
        .json(&RefreshRequest {
            refresh_token: &refresh_token,
        })
        .send()
        .await
        .map_err(|err| RefreshError::Network(err.to_string()))?;
    let status = response.status().as_u16();
    let body = response
        .bytes()
        .await
        .map_err(|err| RefreshError::Network(err.to_string()))?;

    let envelope =
        Envelope::normalize(status, &body).map_err(|err| RefreshError::Parse(err.to_string()))?;
    if !(200..300).contains(&status) || !envelope.success {
        warn!(status, "refresh: rejected by backend");
        return Err(RefreshError::Rejected {
            status,
            message: envelope.message.or(envelope.error),
        });
    }

    let pair = envelope.token_pair().ok_or(RefreshError::MissingTokens)?;
    if !credentials.save(&pair).await {
        warn!("refresh: new token pair could not be persisted");
    }
    info!("refresh: token pair rotated");
    Ok(pair)
}

#[cfg(test)]
#[path = "tests/refresh_tests.rs"]
mod tests;
