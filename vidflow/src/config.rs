//! Runtime configuration.

use crate::model::PrivacyStatus;
use oauth2::ClientSecret;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Google OAuth2 authorization endpoint used for interactive grants.
pub const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";

/// Google OAuth2 token endpoint used for both code exchange and token refresh.
pub const GOOGLE_TOKEN_URL: &str = "https://www.googleapis.com/oauth2/v3/token";

/// Host serving the YouTube Data API v3 upload endpoints.
pub const YOUTUBE_API_BASE: &str = "https://www.googleapis.com";

/// Resumable upload chunks must be a multiple of this many bytes (except the last one).
pub const UPLOAD_GRANULARITY: usize = 256 * 1024;

/// "People & Blogs", YouTube's catch-all category.
const DEFAULT_CATEGORY_ID: &str = "22";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub oauth_client_id: String,
    pub oauth_client_secret: Option<ClientSecret>,
    pub auth_url: String,
    pub token_url: String,
    /// Scheme and host of the publishing API; tests point this at a local server.
    pub upload_base_url: String,
    /// Bytes per resumable-upload chunk. Payloads no larger than this go in a single request.
    pub chunk_size: usize,
    /// Overall deadline for one publish, from token refresh to the final upload response.
    pub publish_timeout_secs: u64,
    pub privacy: PrivacyStatus,
    pub category_id: String,
    /// Directory that storage locators are resolved against.
    pub media_root: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            oauth_client_id: String::new(),
            oauth_client_secret: None,
            auth_url: GOOGLE_AUTH_URL.to_string(),
            token_url: GOOGLE_TOKEN_URL.to_string(),
            upload_base_url: YOUTUBE_API_BASE.to_string(),
            chunk_size: 32 * UPLOAD_GRANULARITY,
            publish_timeout_secs: 600,
            privacy: PrivacyStatus::default(),
            category_id: DEFAULT_CATEGORY_ID.to_string(),
            media_root: PathBuf::from("uploads"),
        }
    }
}

impl Config {
    /// Reads a JSON config file; absent keys keep their defaults.
    pub async fn from_file(path: &Path) -> eyre::Result<Self> {
        use eyre::Context;
        let json = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("read config file {}", path.display()))?;
        serde_json::from_str(&json).with_context(|| format!("parse config file {}", path.display()))
    }

    pub fn validate(&self) -> eyre::Result<()> {
        if self.oauth_client_id.trim().is_empty() {
            eyre::bail!("an OAuth client id is required");
        }
        if self.chunk_size == 0 || self.chunk_size % UPLOAD_GRANULARITY != 0 {
            eyre::bail!(
                "chunk size {} is not a positive multiple of {UPLOAD_GRANULARITY} bytes",
                self.chunk_size
            );
        }
        if self.publish_timeout_secs == 0 {
            eyre::bail!("publish timeout must be at least one second");
        }
        Ok(())
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }
}
