//! Google Cloud access-token resolution, shared by the GCS storage
//! gateway and the Firestore metadata backend.
//!
//! Tokens are resolved via Application Default Credentials in this
//! order:
//!
//! 1. `GOOGLE_OAUTH_ACCESS_TOKEN` environment variable (direct token)
//! 2. `GOOGLE_APPLICATION_CREDENTIALS` (credential JSON file)
//! 3. the gcloud ADC well-known file
//!    (`~/.config/gcloud/application_default_credentials.json`)
//! 4. the GCE metadata server (when running on Google Cloud)
//!
//! `authorized_user` credentials are exchanged via the OAuth2 refresh
//! flow.  `service_account` keys would need RS256 JWT signing; without
//! an RSA dependency the provider falls back to the metadata server or
//! the token environment variable, matching how the rest of the system
//! resolves GCP credentials.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::errors::{StoreError, StoreResult};

const OAUTH_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const METADATA_TOKEN_URI: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Cached access token with expiry.
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

/// Resolves and caches Google OAuth2 access tokens.
pub struct GcpTokenProvider {
    client: reqwest::Client,
    cache: Mutex<Option<CachedToken>>,
}

impl GcpTokenProvider {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            cache: Mutex::new(None),
        }
    }

    /// Current bearer token, refreshed when within 60s of expiry.
    pub async fn bearer(&self) -> StoreResult<String> {
        {
            let cache = self.cache.lock().expect("token cache mutex poisoned");
            if let Some(cached) = cache.as_ref() {
                if cached.expires_at > Instant::now() + Duration::from_secs(60) {
                    return Ok(cached.access_token.clone());
                }
            }
        }

        let (token, expires_in) = self.fetch().await?;
        {
            let mut cache = self.cache.lock().expect("token cache mutex poisoned");
            *cache = Some(CachedToken {
                access_token: token.clone(),
                expires_at: Instant::now() + Duration::from_secs(expires_in),
            });
        }
        Ok(token)
    }

    async fn fetch(&self) -> StoreResult<(String, u64)> {
        if let Ok(token) = std::env::var("GOOGLE_OAUTH_ACCESS_TOKEN") {
            return Ok((token, 3600));
        }
        if let Ok(creds_path) = std::env::var("GOOGLE_APPLICATION_CREDENTIALS") {
            return self.from_credentials_file(&creds_path).await;
        }
        if let Some(adc_path) = adc_well_known_path() {
            if std::path::Path::new(&adc_path).exists() {
                return self.from_credentials_file(&adc_path).await;
            }
        }
        self.from_metadata_server().await
    }

    async fn from_credentials_file(&self, path: &str) -> StoreResult<(String, u64)> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            StoreError::upstream("gcp", anyhow::anyhow!("failed to read {path}: {e}"))
        })?;
        let creds: serde_json::Value = serde_json::from_str(&contents)?;
        let cred_type = creds.get("type").and_then(|v| v.as_str()).unwrap_or("");

        match cred_type {
            "authorized_user" => {
                self.from_refresh_token(
                    creds.get("client_id").and_then(|v| v.as_str()).unwrap_or(""),
                    creds
                        .get("client_secret")
                        .and_then(|v| v.as_str())
                        .unwrap_or(""),
                    creds
                        .get("refresh_token")
                        .and_then(|v| v.as_str())
                        .unwrap_or(""),
                )
                .await
            }
            "service_account" => {
                // RS256 JWT signing needs an RSA crate; resolve through
                // the metadata server or the token env var instead.
                warn!(
                    "service_account key at {path} cannot be signed locally; \
                     falling back to metadata server / GOOGLE_OAUTH_ACCESS_TOKEN"
                );
                self.from_metadata_server().await
            }
            other => Err(StoreError::upstream(
                "gcp",
                anyhow::anyhow!("unsupported credential type in {path}: {other}"),
            )),
        }
    }

    async fn from_refresh_token(
        &self,
        client_id: &str,
        client_secret: &str,
        refresh_token: &str,
    ) -> StoreResult<(String, u64)> {
        let response = self
            .client
            .post(OAUTH_TOKEN_URI)
            .form(&[
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| StoreError::upstream("gcp", e))?;
        if !response.status().is_success() {
            return Err(StoreError::upstream(
                "gcp",
                anyhow::anyhow!("token refresh failed with HTTP {}", response.status()),
            ));
        }
        parse_token_response(
            response
                .json::<serde_json::Value>()
                .await
                .map_err(|e| StoreError::upstream("gcp", e))?,
        )
    }

    async fn from_metadata_server(&self) -> StoreResult<(String, u64)> {
        let response = self
            .client
            .get(METADATA_TOKEN_URI)
            .header("Metadata-Flavor", "Google")
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| {
                StoreError::upstream(
                    "gcp",
                    anyhow::anyhow!(
                        "metadata server unreachable ({e}); set \
                         GOOGLE_APPLICATION_CREDENTIALS or GOOGLE_OAUTH_ACCESS_TOKEN"
                    ),
                )
            })?;
        if !response.status().is_success() {
            return Err(StoreError::upstream(
                "gcp",
                anyhow::anyhow!("metadata server returned HTTP {}", response.status()),
            ));
        }
        parse_token_response(
            response
                .json::<serde_json::Value>()
                .await
                .map_err(|e| StoreError::upstream("gcp", e))?,
        )
    }
}

fn parse_token_response(body: serde_json::Value) -> StoreResult<(String, u64)> {
    let access_token = body
        .get("access_token")
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            StoreError::upstream("gcp", anyhow::anyhow!("no access_token in token response"))
        })?
        .to_string();
    let expires_in = body
        .get("expires_in")
        .and_then(|v| v.as_u64())
        .unwrap_or(3600);
    Ok((access_token, expires_in))
}

fn adc_well_known_path() -> Option<String> {
    std::env::var("HOME").ok().map(|home| {
        format!("{home}/.config/gcloud/application_default_credentials.json")
    })
}
