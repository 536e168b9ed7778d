//! Preference API Client - HTTP communication with the preference service
//!
//! Handles the three REST calls the sync engine needs:
//! - Identity association (sign-in)
//! - Preference fetch (pull)
//! - Preference push

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;

use super::models::{AssociationRequest, AssociationResponse, IdentityProof, PreferenceSnapshot};

const ASSOCIATE_PATH: &str = "associate";
const FETCH_PATH: &str = "fetchPreferences";
const SYNC_PATH: &str = "syncPreferences";

/// Remote preference service contract
///
/// Calls may be issued concurrently; sequencing is the caller's concern.
#[async_trait]
pub trait RemotePreferences: Send + Sync {
    /// Resolve an identity to a service user id. Idempotent per identity.
    async fn associate_user(
        &self,
        proof: &IdentityProof,
    ) -> Result<AssociationResponse, PreferenceApiError>;

    /// `Ok(None)` when the service has no preferences for the user yet
    async fn fetch_preferences(
        &self,
        user_id: &str,
        token: &str,
    ) -> Result<Option<PreferenceSnapshot>, PreferenceApiError>;

    async fn push_preferences(
        &self,
        user_id: &str,
        token: &str,
        snapshot: &PreferenceSnapshot,
    ) -> Result<(), PreferenceApiError>;
}

/// HTTP client for the preference service
pub struct PreferenceApiClient {
    client: Client,
    base_url: String,
}

impl PreferenceApiClient {
    /// Create new API client
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, PreferenceApiError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

#[async_trait]
impl RemotePreferences for PreferenceApiClient {
    async fn associate_user(
        &self,
        proof: &IdentityProof,
    ) -> Result<AssociationResponse, PreferenceApiError> {
        if !proof.is_complete() {
            return Err(PreferenceApiError::MissingCredentials);
        }

        let response = self
            .client
            .post(self.endpoint(ASSOCIATE_PATH))
            .json(&AssociationRequest::from(proof))
            .send()
            .await?;

        let association: AssociationResponse = handle_response(response).await?;
        log::info!(
            "Associated identity with user {} (new user: {}, preferences: {})",
            association.user_id,
            association.is_new_user,
            association.preferences.is_some()
        );
        Ok(association)
    }

    async fn fetch_preferences(
        &self,
        user_id: &str,
        token: &str,
    ) -> Result<Option<PreferenceSnapshot>, PreferenceApiError> {
        let url = url::Url::parse_with_params(&self.endpoint(FETCH_PATH), &[("userId", user_id)])
            .map_err(|e| PreferenceApiError::InvalidUrl(e.to_string()))?;

        let response = self.client.get(url).bearer_auth(token).send().await?;

        // No preferences stored yet
        if response.status() == StatusCode::NOT_FOUND {
            log::debug!("No remote preferences for user {}", user_id);
            return Ok(None);
        }

        let snapshot: PreferenceSnapshot = handle_response(response).await?;
        Ok(Some(snapshot))
    }

    async fn push_preferences(
        &self,
        user_id: &str,
        token: &str,
        snapshot: &PreferenceSnapshot,
    ) -> Result<(), PreferenceApiError> {
        let response = self
            .client
            .post(self.endpoint(SYNC_PATH))
            .bearer_auth(token)
            .json(snapshot)
            .send()
            .await?;

        if response.status().is_success() {
            log::info!(
                "Pushed preferences for user {} ({} marked items)",
                user_id,
                snapshot.marked_items.len()
            );
            Ok(())
        } else {
            Err(handle_error(response).await)
        }
    }
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum PreferenceApiError {
    #[error("Identity proof is incomplete")]
    MissingCredentials,

    #[error("Server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Invalid response from server")]
    InvalidResponse,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

/// Handle successful JSON response
async fn handle_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, PreferenceApiError> {
    if response.status().is_success() {
        response
            .json::<T>()
            .await
            .map_err(|_| PreferenceApiError::InvalidResponse)
    } else {
        Err(handle_error(response).await)
    }
}

/// Convert any non-success response to ServerError
async fn handle_error(response: reqwest::Response) -> PreferenceApiError {
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());

    let message = serde_json::from_str::<ErrorResponse>(&body)
        .map(|e| e.error)
        .unwrap_or(body);

    PreferenceApiError::ServerError {
        status: status.as_u16(),
        message,
    }
}

// ============================================================================
// Tests
// ============================================================================
