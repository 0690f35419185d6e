//! One publish attempt: credential, bytes, metadata, upload.
//!
//! The orchestrator neither retries nor touches the video store. It returns either the
//! platform's identifier or the classified failure, and the approval workflow decides what to
//! record.

use crate::broker::TokenBroker;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::{AccountId, ExternalId, PrivacyStatus, UploadMetadata, Video, VideoId};
use crate::source::VideoSource;
use crate::upload::UploadClient;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::instrument;

/// Everything needed to push one video, resolved before any bytes move.
#[derive(Debug)]
struct PublishAttempt<'a> {
    video: &'a VideoId,
    account: &'a AccountId,
    metadata: UploadMetadata,
}

#[derive(Clone)]
pub struct PublishOrchestrator {
    broker: TokenBroker,
    uploader: Arc<dyn UploadClient>,
    source: Arc<dyn VideoSource>,
    category_id: String,
    privacy: PrivacyStatus,
}

impl std::fmt::Debug for PublishOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishOrchestrator")
            .field("category_id", &self.category_id)
            .field("privacy", &self.privacy)
            .finish_non_exhaustive()
    }
}

impl PublishOrchestrator {
    pub fn new(
        config: &Config,
        broker: TokenBroker,
        uploader: Arc<dyn UploadClient>,
        source: Arc<dyn VideoSource>,
    ) -> Self {
        Self {
            broker,
            uploader,
            source,
            category_id: config.category_id.clone(),
            privacy: config.privacy,
        }
    }

    fn attempt<'a>(&self, video: &'a Video, account: &'a AccountId) -> PublishAttempt<'a> {
        PublishAttempt {
            video: &video.id,
            account,
            metadata: UploadMetadata {
                title: video.title.clone(),
                description: video.description.clone(),
                category_id: self.category_id.clone(),
                privacy: self.privacy,
            },
        }
    }

    /// Publishes `video` on behalf of `account`, giving up at `deadline`.
    ///
    /// A deadline that passes at any stage is reported as [`Error::Transport`].
    #[instrument(skip(self, video, deadline), fields(video = %video.id))]
    pub async fn publish(
        &self,
        video: &Video,
        account: &AccountId,
        deadline: Instant,
    ) -> Result<ExternalId> {
        let attempt = self.attempt(video, account);

        let access = tokio::time::timeout_at(
            deadline,
            self.broker.valid_access_credential(attempt.account),
        )
        .await
        .map_err(|_| Error::deadline_exceeded("obtaining an access credential"))??;

        let external_id = tokio::time::timeout_at(deadline, async {
            let payload = self.source.open(&video.locator).await?;
            tracing::debug!(len = payload.len, "opened video payload");
            self.uploader
                .upload(payload, &attempt.metadata, &access)
                .await
        })
        .await
        .map_err(|_| Error::deadline_exceeded("uploading"))??;

        tracing::info!(video = %attempt.video, %external_id, "video published");
        Ok(external_id)
    }
}
