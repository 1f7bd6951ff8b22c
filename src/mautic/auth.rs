use crate::http::{build_client, is_success};
use crate::mautic::MauticError;
use crate::settings::Settings;
use crate::store::{KeyValueStore, keys};
use reqwest::Client;
use serde::Deserialize;
use serde_with::{DisplayFromStr, PickFirst, serde_as};
use std::{sync::Arc, time::Duration};
use tracing::{debug, error};

#[serde_as]
#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Cached tokens are dropped this long before Mautic expires them.
const EXPIRY_MARGIN_SECS: u64 = 30;

/// Client-credentials token exchange with the result cached in the store
/// until shortly before `expires_in` elapses.
#[derive(Clone)]
pub struct TokenProvider {
    store: Arc<dyn KeyValueStore>,
    http: Client,
}

impl TokenProvider {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            http: build_client(),
        }
    }

    pub async fn get_token(&self, settings: &Settings) -> Result<String, MauticError> {
        if !settings.is_configured() {
            return Err(MauticError::Unconfigured);
        }
        if let Some(token) = self
            .store
            .get(keys::ACCESS_TOKEN)
            .await?
            .filter(|token| !token.is_empty())
        {
            return Ok(token);
        }

        debug!(target = "mautic_sync.auth", "requesting new access token");
        match self.request_token(settings).await {
            Ok((token, expires_in)) => {
                let ttl = expires_in.saturating_sub(EXPIRY_MARGIN_SECS);
                if ttl > 0 {
                    self.store
                        .set(keys::ACCESS_TOKEN, &token, Some(Duration::from_secs(ttl)))
                        .await?;
                }
                Ok(token)
            }
            Err(err) => {
                error!(target = "mautic_sync.auth", error = %err, "failed to get mautic token");
                Err(err)
            }
        }
    }

    /// Drop the cached token, e.g. after credentials change.
    pub async fn forget(&self) -> Result<(), MauticError> {
        self.store.delete(keys::ACCESS_TOKEN).await?;
        Ok(())
    }

    async fn request_token(&self, settings: &Settings) -> Result<(String, u64), MauticError> {
        let url = format!("{}/oauth/v2/token", settings.base_url);
        let params = [
            ("client_id", settings.client_id.as_str()),
            ("client_secret", settings.client_secret.as_str()),
            ("grant_type", "client_credentials"),
        ];
        let response = self
            .http
            .post(url)
            .form(&params)
            .send()
            .await
            .map_err(|err| MauticError::Token(err.to_string()))?;

        if !is_success(response.status()) {
            return Err(MauticError::Token(format!(
                "response code {}",
                response.status().as_u16()
            )));
        }

        let payload: TokenResponse = response
            .json()
            .await
            .map_err(|err| MauticError::Token(format!("malformed body: {err}")))?;
        match (payload.access_token, payload.expires_in) {
            (Some(token), Some(expires_in)) if !token.trim().is_empty() => {
                Ok((token.trim().to_string(), expires_in))
            }
            _ => Err(MauticError::Token(
                "access token or expiration not provided".into(),
            )),
        }
    }
}
