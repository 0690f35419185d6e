//! The approval state machine: who may move a video where, and what happens when they do.
//!
//! Approval is a two-step write. The video first moves `pending -> approved`, then the publish
//! runs, and only its success moves the video `approved -> uploaded`. A failed publish leaves
//! the video `approved`, from where [`ApprovalWorkflow::retry_publish`] can try again without
//! another review.
//!
//! At most one publish per video runs at a time. Each publish holds an in-process claim on the
//! video id for its whole duration, and every status write is conditional on the status it
//! expects to replace, so a stale caller gets `Conflict` rather than a second upload.

use crate::broker::TokenBroker;
use crate::config::Config;
use crate::error::{Error, Remedy, Result};
use crate::model::{
    AccountId, Action, Actor, Capability, ExternalId, NewVideo, Video, VideoId, VideoStatus,
};
use crate::publish::PublishOrchestrator;
use crate::store::{AccountDirectory, StatusChange, VideoStore};
use jiff::Timestamp;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::instrument;

/// How an approval (or a retry) ended, once the video had been approved.
#[derive(Debug)]
pub enum PublishOutcome {
    Published { external_id: ExternalId },
    /// The approval stands, but the video did not reach the platform.
    ApprovedNotPublished { error: Error },
}

impl PublishOutcome {
    pub fn external_id(&self) -> Option<&ExternalId> {
        match self {
            PublishOutcome::Published { external_id } => Some(external_id),
            PublishOutcome::ApprovedNotPublished { .. } => None,
        }
    }

    pub fn remedy(&self) -> Remedy {
        match self {
            PublishOutcome::Published { .. } => Remedy::None,
            PublishOutcome::ApprovedNotPublished { error } => error.remedy(),
        }
    }
}

/// Video ids with a publish currently running.
#[derive(Debug, Default, Clone)]
struct InFlight(Arc<Mutex<HashSet<VideoId>>>);

impl InFlight {
    fn claim(&self, id: &VideoId) -> Option<PublishClaim> {
        let mut held = self.0.lock().unwrap_or_else(|e| e.into_inner());
        held.insert(id.clone()).then(|| PublishClaim {
            in_flight: self.clone(),
            id: id.clone(),
        })
    }

    #[cfg(test)]
    fn is_held(&self, id: &VideoId) -> bool {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(id)
    }
}

/// Exclusive right to publish one video. Released on drop, including when the publishing
/// future is cancelled.
#[derive(Debug)]
struct PublishClaim {
    in_flight: InFlight,
    id: VideoId,
}

impl Drop for PublishClaim {
    fn drop(&mut self) {
        self.in_flight
            .0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

pub struct ApprovalWorkflow {
    videos: Arc<dyn VideoStore>,
    directory: Arc<dyn AccountDirectory>,
    broker: TokenBroker,
    publisher: PublishOrchestrator,
    in_flight: InFlight,
    publish_timeout: Duration,
}

impl std::fmt::Debug for ApprovalWorkflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalWorkflow")
            .field("publisher", &self.publisher)
            .field("publish_timeout", &self.publish_timeout)
            .finish_non_exhaustive()
    }
}

impl ApprovalWorkflow {
    pub fn new(
        config: &Config,
        videos: Arc<dyn VideoStore>,
        directory: Arc<dyn AccountDirectory>,
        broker: TokenBroker,
        publisher: PublishOrchestrator,
    ) -> Self {
        Self {
            videos,
            directory,
            broker,
            publisher,
            in_flight: InFlight::default(),
            publish_timeout: config.publish_timeout(),
        }
    }

    /// Records a newly uploaded draft as `pending`.
    #[instrument(skip_all, fields(creator = %new.creator, editor = %new.editor))]
    pub async fn submit(&self, new: NewVideo) -> Result<Video> {
        if new.title.trim().is_empty() {
            return Err(Error::Rejected("a video needs a title".into()));
        }
        let video = new.into_video(VideoId::generate(), Timestamp::now());
        self.videos.insert(video.clone()).await?;
        tracing::info!(video = %video.id, "video submitted for review");
        Ok(video)
    }

    pub async fn get(&self, id: &VideoId) -> Result<Video> {
        self.videos
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.clone()))
    }

    /// Pending videos `actor` is allowed to see.
    ///
    /// Creators see their own, admins see everything, and editors see those of the creator
    /// they are linked to (nothing, if they are not linked).
    #[instrument(skip(self))]
    pub async fn list_pending(&self, actor: &Actor) -> Result<Vec<Video>> {
        let creator: Option<AccountId> = match actor.capability {
            Capability::Admin => None,
            Capability::Creator => Some(actor.id.clone()),
            Capability::Editor => {
                let linked = self
                    .directory
                    .account(&actor.id)
                    .await?
                    .and_then(|account| account.linked_creator);
                match linked {
                    Some(creator) => Some(creator),
                    None => {
                        tracing::debug!("editor is not linked to a creator");
                        return Ok(Vec::new());
                    }
                }
            }
        };
        self.videos
            .list(VideoStatus::Pending, creator.as_ref())
            .await
    }

    /// Approves a pending video and publishes it with the acting account's credentials.
    ///
    /// Refusals (`NotFound`, `Forbidden`, `CredentialMissing`, `Conflict`) leave the video
    /// untouched. Once the approval is written, a publish failure is reported as
    /// [`PublishOutcome::ApprovedNotPublished`].
    #[instrument(skip(self, actor), fields(actor = %actor.id))]
    pub async fn approve(&self, id: &VideoId, actor: &Actor) -> Result<PublishOutcome> {
        let video = self.get(id).await?;
        actor.authorize(Action::Publish, &video)?;
        self.require_credential(&actor.id).await?;
        if video.status != VideoStatus::Pending {
            return Err(Error::Conflict {
                video: id.clone(),
                expected: VideoStatus::Pending,
                found: video.status,
            });
        }

        // a claim held while the video is still pending belongs to a racing approval
        let claim = self.in_flight.claim(id).ok_or_else(|| Error::Conflict {
            video: id.clone(),
            expected: VideoStatus::Pending,
            found: VideoStatus::Approved,
        })?;
        let approved = self
            .videos
            .transition(id, VideoStatus::Pending, StatusChange::approved())
            .await?;
        tracing::info!("video approved");

        self.publish_claimed(approved, actor, claim).await
    }

    /// Re-runs the publish of a video whose earlier publish failed.
    #[instrument(skip(self, actor), fields(actor = %actor.id))]
    pub async fn retry_publish(&self, id: &VideoId, actor: &Actor) -> Result<PublishOutcome> {
        let video = self.get(id).await?;
        actor.authorize(Action::Publish, &video)?;
        self.require_credential(&actor.id).await?;

        let claim = self
            .in_flight
            .claim(id)
            .ok_or_else(|| Error::PublishInProgress(id.clone()))?;
        // re-read under the claim: a publish may have finished since the first read
        let video = self.get(id).await?;
        if video.status != VideoStatus::Approved {
            return Err(Error::Conflict {
                video: id.clone(),
                expected: VideoStatus::Approved,
                found: video.status,
            });
        }

        self.publish_claimed(video, actor, claim).await
    }

    /// Rejects a pending video.
    ///
    /// Any actor may reject any video. Videos that already left `pending` are refused with
    /// `Conflict` and keep their status and external id.
    #[instrument(skip(self, actor), fields(actor = %actor.id))]
    pub async fn reject(&self, id: &VideoId, actor: &Actor) -> Result<Video> {
        let video = self.get(id).await?;
        actor.authorize(Action::Reject, &video)?;
        let rejected = self
            .videos
            .transition(id, VideoStatus::Pending, StatusChange::rejected())
            .await?;
        tracing::info!("video rejected");
        Ok(rejected)
    }

    async fn require_credential(&self, account: &AccountId) -> Result<()> {
        if self.broker.has_publish_credential(account).await? {
            Ok(())
        } else {
            Err(Error::CredentialMissing(account.clone()))
        }
    }

    /// Publishes an approved video and records the result. `_claim` is released on return.
    async fn publish_claimed(
        &self,
        video: Video,
        actor: &Actor,
        _claim: PublishClaim,
    ) -> Result<PublishOutcome> {
        let deadline = Instant::now() + self.publish_timeout;
        let external_id = match self.publisher.publish(&video, &actor.id, deadline).await {
            Ok(external_id) => external_id,
            Err(error) => {
                tracing::warn!(
                    video = %video.id,
                    %error,
                    remedy = ?error.remedy(),
                    "approved video was not published"
                );
                return Ok(PublishOutcome::ApprovedNotPublished { error });
            }
        };

        if let Err(e) = self
            .videos
            .transition(
                &video.id,
                VideoStatus::Approved,
                StatusChange::uploaded(external_id.clone()),
            )
            .await
        {
            tracing::error!(
                video = %video.id,
                %external_id,
                error = %e,
                "video was published but recording its external id failed"
            );
            return Err(e);
        }
        Ok(PublishOutcome::Published { external_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExchangeFailure;
    use crate::mock::{MemoryVideoSource, MockAuthority, MockUploader};
    use crate::model::Account;
    use crate::store::MemoryStore;
    use oauth2::RefreshToken;

    struct Harness {
        workflow: Arc<ApprovalWorkflow>,
        store: Arc<MemoryStore>,
        authority: Arc<MockAuthority>,
        uploader: Arc<MockUploader>,
        broker: TokenBroker,
    }

    fn harness(uploader: MockUploader) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let authority = Arc::new(MockAuthority::new());
        let uploader = Arc::new(uploader);
        let source = Arc::new(MemoryVideoSource::new());
        source.insert("drafts/v.mp4", &b"frames"[..]);

        let config = Config {
            publish_timeout_secs: 30,
            ..Config::default()
        };
        let broker = TokenBroker::new(store.clone(), authority.clone());
        let publisher =
            PublishOrchestrator::new(&config, broker.clone(), uploader.clone(), source);
        let workflow = ApprovalWorkflow::new(
            &config,
            store.clone(),
            store.clone(),
            broker.clone(),
            publisher,
        );
        Harness {
            workflow: Arc::new(workflow),
            store,
            authority,
            uploader,
            broker,
        }
    }

    impl Harness {
        async fn connect(&self, account: &str) {
            self.broker
                .store_grant(
                    &account.into(),
                    RefreshToken::new(format!("1//{account}")),
                    None,
                )
                .await
                .unwrap();
        }

        async fn submit(&self, creator: &str) -> Video {
            self.workflow
                .submit(NewVideo {
                    title: "Launch trailer".into(),
                    description: "cut 4".into(),
                    locator: "drafts/v.mp4".into(),
                    creator: creator.into(),
                    editor: "ed".into(),
                })
                .await
                .unwrap()
        }

        async fn status(&self, id: &VideoId) -> (VideoStatus, Option<ExternalId>) {
            let video = self.workflow.get(id).await.unwrap();
            (video.status, video.external_id)
        }
    }

    fn creator(id: &str) -> Actor {
        Actor::new(id, Capability::Creator)
    }

    #[tokio::test]
    async fn approval_publishes_and_records_the_external_id() {
        let h = harness(MockUploader::new());
        h.connect("carol").await;
        let v = h.submit("carol").await;
        assert_eq!(v.status, VideoStatus::Pending);
        h.uploader.push_outcome(Ok("yt_123".into()));

        let outcome = h.workflow.approve(&v.id, &creator("carol")).await.unwrap();
        assert_eq!(outcome.external_id(), Some(&ExternalId::from("yt_123")));
        assert_eq!(
            h.status(&v.id).await,
            (VideoStatus::Uploaded, Some("yt_123".into()))
        );
        assert_eq!(h.uploader.uploads()[0].metadata.title, "Launch trailer");
    }

    #[tokio::test]
    async fn approval_without_a_credential_leaves_the_video_pending() {
        let h = harness(MockUploader::new());
        let v = h.submit("carol").await;

        let err = h
            .workflow
            .approve(&v.id, &creator("carol"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CredentialMissing(_)));
        assert_eq!(err.remedy(), Remedy::Reconnect);
        assert_eq!(h.status(&v.id).await, (VideoStatus::Pending, None));
        assert_eq!(h.authority.calls(), 0);
    }

    #[tokio::test]
    async fn unknown_videos_and_foreign_creators_are_refused_first() {
        let h = harness(MockUploader::new());
        h.connect("carol").await;
        let v = h.submit("carol").await;

        assert!(matches!(
            h.workflow
                .approve(&"nope".into(), &creator("carol"))
                .await,
            Err(Error::NotFound(_))
        ));
        // dave has no credential either, but ownership is checked first
        assert!(matches!(
            h.workflow.approve(&v.id, &creator("dave")).await,
            Err(Error::Forbidden { .. })
        ));
        assert!(matches!(
            h.workflow
                .approve(&v.id, &Actor::new("ed", Capability::Editor))
                .await,
            Err(Error::Forbidden { .. })
        ));
        assert_eq!(h.status(&v.id).await, (VideoStatus::Pending, None));
    }

    #[tokio::test]
    async fn admins_publish_with_their_own_credential() {
        let h = harness(MockUploader::new());
        h.connect("root").await;
        let v = h.submit("carol").await;

        let outcome = h
            .workflow
            .approve(&v.id, &Actor::new("root", Capability::Admin))
            .await
            .unwrap();
        assert!(matches!(outcome, PublishOutcome::Published { .. }));
    }

    #[tokio::test]
    async fn failed_exchange_keeps_the_approval_and_skips_the_upload() {
        let h = harness(MockUploader::new());
        h.connect("carol").await;
        let v = h.submit("carol").await;
        h.authority.fail_next(ExchangeFailure::RevokedGrant);

        let outcome = h.workflow.approve(&v.id, &creator("carol")).await.unwrap();
        let PublishOutcome::ApprovedNotPublished { error } = outcome else {
            panic!("expected the publish to fail");
        };
        assert!(matches!(error, Error::AuthExchangeFailed { .. }));
        assert_eq!(error.remedy(), Remedy::Reconnect);
        assert_eq!(h.status(&v.id).await, (VideoStatus::Approved, None));
        assert_eq!(h.uploader.calls(), 0);
    }

    #[tokio::test]
    async fn transport_failure_then_retry_records_one_external_id() {
        let h = harness(MockUploader::new());
        h.connect("carol").await;
        let v = h.submit("carol").await;
        h.uploader
            .push_outcome(Err(Error::Transport("connection reset".into())));

        let outcome = h.workflow.approve(&v.id, &creator("carol")).await.unwrap();
        assert_eq!(outcome.remedy(), Remedy::Retry);
        assert_eq!(h.status(&v.id).await, (VideoStatus::Approved, None));

        // approving again is not how a failed publish is retried
        assert!(matches!(
            h.workflow.approve(&v.id, &creator("carol")).await,
            Err(Error::Conflict { .. })
        ));

        let outcome = h
            .workflow
            .retry_publish(&v.id, &creator("carol"))
            .await
            .unwrap();
        assert_eq!(outcome.external_id(), Some(&ExternalId::from("yt_2")));
        assert_eq!(
            h.status(&v.id).await,
            (VideoStatus::Uploaded, Some("yt_2".into()))
        );

        // a second retry cannot publish again
        assert!(matches!(
            h.workflow.retry_publish(&v.id, &creator("carol")).await,
            Err(Error::Conflict {
                found: VideoStatus::Uploaded,
                ..
            })
        ));
        assert_eq!(h.uploader.calls(), 2);
    }

    #[tokio::test]
    async fn retry_requires_an_approved_video() {
        let h = harness(MockUploader::new());
        h.connect("carol").await;
        let v = h.submit("carol").await;
        assert!(matches!(
            h.workflow.retry_publish(&v.id, &creator("carol")).await,
            Err(Error::Conflict {
                expected: VideoStatus::Approved,
                found: VideoStatus::Pending,
                ..
            })
        ));
        assert_eq!(h.uploader.calls(), 0);
    }

    #[tokio::test]
    async fn concurrent_approvals_upload_once() {
        let (uploader, gate) = MockUploader::gated();
        let h = harness(uploader);
        h.connect("carol").await;
        let v = h.submit("carol").await;

        let first = tokio::spawn({
            let workflow = Arc::clone(&h.workflow);
            let id = v.id.clone();
            async move { workflow.approve(&id, &creator("carol")).await }
        });
        gate.wait_entered().await;

        let second = h.workflow.approve(&v.id, &creator("carol")).await;
        assert!(matches!(second, Err(Error::Conflict { .. })), "{second:?}");
        assert!(matches!(
            h.workflow.retry_publish(&v.id, &creator("carol")).await,
            Err(Error::PublishInProgress(_))
        ));

        gate.open();
        let outcome = first.await.unwrap().unwrap();
        assert_eq!(outcome.external_id(), Some(&ExternalId::from("yt_1")));
        assert_eq!(h.uploader.calls(), 1);
        assert_eq!(
            h.status(&v.id).await,
            (VideoStatus::Uploaded, Some("yt_1".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn hung_publish_times_out_and_releases_the_claim() {
        let (uploader, gate) = MockUploader::gated();
        let h = harness(uploader);
        h.connect("carol").await;
        let v = h.submit("carol").await;

        let outcome = h.workflow.approve(&v.id, &creator("carol")).await.unwrap();
        let PublishOutcome::ApprovedNotPublished { error } = outcome else {
            panic!("expected the publish to time out");
        };
        assert!(matches!(error, Error::Transport(_)), "{error:?}");
        assert_eq!(h.status(&v.id).await, (VideoStatus::Approved, None));
        assert!(!h.workflow.in_flight.is_held(&v.id));

        gate.open();
        let outcome = h
            .workflow
            .retry_publish(&v.id, &creator("carol"))
            .await
            .unwrap();
        assert_eq!(outcome.external_id(), Some(&ExternalId::from("yt_2")));
    }

    #[tokio::test]
    async fn cancelled_publish_stays_approved_and_releases_the_claim() {
        let (uploader, gate) = MockUploader::gated();
        let h = harness(uploader);
        h.connect("carol").await;
        let v = h.submit("carol").await;

        let approval = tokio::spawn({
            let workflow = Arc::clone(&h.workflow);
            let id = v.id.clone();
            async move { workflow.approve(&id, &creator("carol")).await }
        });
        gate.wait_entered().await;
        approval.abort();
        assert!(approval.await.unwrap_err().is_cancelled());

        assert_eq!(h.status(&v.id).await, (VideoStatus::Approved, None));
        assert!(!h.workflow.in_flight.is_held(&v.id));
    }

    #[tokio::test]
    async fn reject_only_applies_to_pending_videos() {
        let h = harness(MockUploader::new());
        h.connect("carol").await;
        let pending = h.submit("carol").await;
        let published = h.submit("carol").await;
        h.workflow
            .approve(&published.id, &creator("carol"))
            .await
            .unwrap();
        let (_, external_id) = h.status(&published.id).await;
        assert!(external_id.is_some());

        // no ownership rule for rejection
        let rejected = h
            .workflow
            .reject(&pending.id, &Actor::new("ed", Capability::Editor))
            .await
            .unwrap();
        assert_eq!(rejected.status, VideoStatus::Rejected);

        assert!(matches!(
            h.workflow.reject(&published.id, &creator("carol")).await,
            Err(Error::Conflict {
                found: VideoStatus::Uploaded,
                ..
            })
        ));
        assert_eq!(
            h.status(&published.id).await,
            (VideoStatus::Uploaded, external_id)
        );
        assert!(matches!(
            h.workflow.reject(&"nope".into(), &creator("carol")).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn pending_visibility_follows_capability() {
        let h = harness(MockUploader::new());
        let carols = h.submit("carol").await;
        let daves = h.submit("dave").await;
        h.store
            .upsert_account(Account {
                id: "ed".into(),
                capability: Capability::Editor,
                linked_creator: Some("carol".into()),
            })
            .await;

        let ids = |videos: Vec<Video>| -> Vec<VideoId> {
            let mut ids: Vec<_> = videos.into_iter().map(|v| v.id).collect();
            ids.sort();
            ids
        };
        let mut everything = vec![carols.id.clone(), daves.id.clone()];
        everything.sort();

        let listed = h.workflow.list_pending(&creator("carol")).await.unwrap();
        assert_eq!(ids(listed), vec![carols.id.clone()]);

        let listed = h
            .workflow
            .list_pending(&Actor::new("ed", Capability::Editor))
            .await
            .unwrap();
        assert_eq!(ids(listed), vec![carols.id.clone()]);

        let listed = h
            .workflow
            .list_pending(&Actor::new("stray", Capability::Editor))
            .await
            .unwrap();
        assert!(listed.is_empty());

        let listed = h
            .workflow
            .list_pending(&Actor::new("root", Capability::Admin))
            .await
            .unwrap();
        assert_eq!(ids(listed), everything);
    }

    #[tokio::test]
    async fn submissions_need_a_title() {
        let h = harness(MockUploader::new());
        let err = h
            .workflow
            .submit(NewVideo {
                title: "   ".into(),
                description: String::new(),
                locator: "drafts/v.mp4".into(),
                creator: "carol".into(),
                editor: "ed".into(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.remedy(), Remedy::FixMetadata);
    }
}
