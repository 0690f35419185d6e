//! Scriptable stand-ins for the external collaborators of the pipeline.
//!
//! These let tests (and downstream crates, with the `mock` feature) drive the approval workflow
//! without a real OAuth authority, publishing API, or media store:
//!
//! - [`MockAuthority`] mints a distinct access credential per refresh unless told to fail or
//!   rotate the grant.
//! - [`MockUploader`] records every upload it receives and answers with scripted outcomes.
//!   An optional [`UploadGate`] holds uploads open so tests can observe in-flight behavior.
//! - [`MemoryVideoSource`] serves payloads from memory.

use crate::error::{Error, ExchangeFailure, Result};
use crate::model::{AccessCredential, AccountId, ExternalId, StorageLocator, UploadMetadata};
use crate::oauth::{AccessGrant, OAuthAuthority};
use crate::source::{self, VideoPayload, VideoSource};
use crate::upload::UploadClient;
use async_trait::async_trait;
use bytes::Bytes;
use oauth2::RefreshToken;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, Semaphore};

#[derive(Debug)]
enum AuthorityStep {
    Fail(ExchangeFailure),
    Rotate(RefreshToken),
}

/// An OAuth authority that answers refreshes from a script.
#[derive(Debug, Default)]
pub struct MockAuthority {
    script: Mutex<VecDeque<AuthorityStep>>,
    calls: AtomicUsize,
}

impl MockAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of refresh exchanges attempted so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Make the next exchange fail.
    pub fn fail_next(&self, kind: ExchangeFailure) {
        self.push(AuthorityStep::Fail(kind));
    }

    /// Make the next exchange hand back a new refresh credential along with the access one.
    pub fn rotate_next(&self, refresh: RefreshToken) {
        self.push(AuthorityStep::Rotate(refresh));
    }

    fn push(&self, step: AuthorityStep) {
        self.script
            .lock()
            .expect("mock authority script poisoned")
            .push_back(step);
    }
}

#[async_trait]
impl OAuthAuthority for MockAuthority {
    async fn refresh(&self, account: &AccountId, _refresh: &RefreshToken) -> Result<AccessGrant> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let step = self
            .script
            .lock()
            .expect("mock authority script poisoned")
            .pop_front();

        let access = AccessCredential::new(format!("ya29.mock-{n}"), None);
        match step {
            None => Ok(AccessGrant {
                access,
                refresh: None,
            }),
            Some(AuthorityStep::Rotate(refresh)) => Ok(AccessGrant {
                access,
                refresh: Some(refresh),
            }),
            Some(AuthorityStep::Fail(kind)) => Err(Error::AuthExchangeFailed {
                account: account.clone(),
                kind,
                detail: "scripted failure".into(),
            }),
        }
    }
}

/// Holds uploads open until released.
#[derive(Debug)]
pub struct UploadGate {
    entered: Notify,
    release: Semaphore,
}

impl UploadGate {
    fn new() -> Self {
        Self {
            entered: Notify::new(),
            release: Semaphore::new(0),
        }
    }

    /// Resolves once an upload has reached the gate.
    pub async fn wait_entered(&self) {
        self.entered.notified().await;
    }

    /// Lets one waiting (or future) upload through.
    pub fn open(&self) {
        self.release.add_permits(1);
    }
}

/// One upload as the publishing API would have received it.
#[derive(Debug, Clone)]
pub struct RecordedUpload {
    pub metadata: UploadMetadata,
    pub bytes: Bytes,
    pub content_type: String,
    pub access: String,
}

/// A publishing API that records what it is sent.
///
/// Unscripted uploads succeed with ids `yt_1`, `yt_2`, and so on.
#[derive(Debug, Default)]
pub struct MockUploader {
    script: Mutex<VecDeque<Result<ExternalId>>>,
    uploads: Mutex<Vec<RecordedUpload>>,
    calls: AtomicUsize,
    gate: Option<Arc<UploadGate>>,
}

impl MockUploader {
    pub fn new() -> Self {
        Self::default()
    }

    /// An uploader whose uploads block until the returned gate is opened.
    pub fn gated() -> (Self, Arc<UploadGate>) {
        let gate = Arc::new(UploadGate::new());
        let uploader = Self {
            gate: Some(Arc::clone(&gate)),
            ..Self::default()
        };
        (uploader, gate)
    }

    /// Queue the outcome of the next upload.
    pub fn push_outcome(&self, outcome: Result<ExternalId>) {
        self.script
            .lock()
            .expect("mock uploader script poisoned")
            .push_back(outcome);
    }

    /// Number of uploads started, including ones still waiting at the gate.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Uploads that got past the gate and transferred their bytes.
    pub fn uploads(&self) -> Vec<RecordedUpload> {
        self.uploads
            .lock()
            .expect("mock uploader log poisoned")
            .clone()
    }
}

#[async_trait]
impl UploadClient for MockUploader {
    async fn upload(
        &self,
        payload: VideoPayload,
        metadata: &UploadMetadata,
        access: &AccessCredential,
    ) -> Result<ExternalId> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(gate) = &self.gate {
            gate.entered.notify_one();
            gate.release
                .acquire()
                .await
                .map_err(|_| Error::Transport("upload gate closed".into()))?
                .forget();
        }

        let bytes = source::collect(payload.stream).await?;
        self.uploads
            .lock()
            .expect("mock uploader log poisoned")
            .push(RecordedUpload {
                metadata: metadata.clone(),
                bytes,
                content_type: payload.content_type,
                access: access.secret().to_string(),
            });

        self.script
            .lock()
            .expect("mock uploader script poisoned")
            .pop_front()
            .unwrap_or_else(|| Ok(ExternalId::new(format!("yt_{n}"))))
    }
}

/// Serves payloads from memory.
#[derive(Debug, Default)]
pub struct MemoryVideoSource {
    files: Mutex<HashMap<StorageLocator, Bytes>>,
}

impl MemoryVideoSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, locator: impl Into<StorageLocator>, bytes: impl Into<Bytes>) {
        self.files
            .lock()
            .expect("memory source poisoned")
            .insert(locator.into(), bytes.into());
    }
}

#[async_trait]
impl VideoSource for MemoryVideoSource {
    async fn open(&self, locator: &StorageLocator) -> Result<VideoPayload> {
        let bytes = self
            .files
            .lock()
            .expect("memory source poisoned")
            .get(locator)
            .cloned()
            .ok_or_else(|| Error::Storage(format!("no stored video at {locator}")))?;
        Ok(VideoPayload {
            len: bytes.len() as u64,
            content_type: "video/mp4".into(),
            stream: Box::pin(tokio_stream::once(Ok(bytes))),
        })
    }
}
