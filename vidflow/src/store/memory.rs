//! In-process implementation of every store trait, with JSON snapshots for the CLI.

use super::{AccountDirectory, CredentialStore, StatusChange, VideoStore};
use crate::error::{Error, Result};
use crate::model::{
    AccessCredential, Account, AccountId, CredentialSet, Video, VideoId, VideoStatus,
};
use async_trait::async_trait;
use eyre::Context;
use jiff::Timestamp;
use oauth2::RefreshToken;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Serialized form of a [`MemoryStore`].
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub videos: Vec<Video>,
    #[serde(default)]
    pub credentials: Vec<CredentialSet>,
    #[serde(default)]
    pub accounts: Vec<Account>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    videos: RwLock<HashMap<VideoId, Video>>,
    credentials: RwLock<HashMap<AccountId, CredentialSet>>,
    accounts: RwLock<HashMap<AccountId, Account>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            videos: RwLock::new(
                snapshot
                    .videos
                    .into_iter()
                    .map(|v| (v.id.clone(), v))
                    .collect(),
            ),
            credentials: RwLock::new(
                snapshot
                    .credentials
                    .into_iter()
                    .map(|c| (c.account.clone(), c))
                    .collect(),
            ),
            accounts: RwLock::new(
                snapshot
                    .accounts
                    .into_iter()
                    .map(|a| (a.id.clone(), a))
                    .collect(),
            ),
        }
    }

    pub async fn snapshot(&self) -> Snapshot {
        let mut videos: Vec<_> = self.videos.read().await.values().cloned().collect();
        videos.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        let mut credentials: Vec<_> = self.credentials.read().await.values().cloned().collect();
        credentials.sort_by(|a, b| a.account.cmp(&b.account));
        let mut accounts: Vec<_> = self.accounts.read().await.values().cloned().collect();
        accounts.sort_by(|a, b| a.id.cmp(&b.id));
        Snapshot {
            videos,
            credentials,
            accounts,
        }
    }

    /// Loads a snapshot file; a missing file yields an empty store.
    pub async fn load(path: &Path) -> eyre::Result<Self> {
        if !tokio::fs::try_exists(path)
            .await
            .with_context(|| format!("check for state file {}", path.display()))?
        {
            tracing::debug!(path = %path.display(), "no state file yet, starting empty");
            return Ok(Self::new());
        }
        let json = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("read state file {}", path.display()))?;
        let snapshot: Snapshot = serde_json::from_str(&json)
            .with_context(|| format!("parse state file {}", path.display()))?;
        Ok(Self::from_snapshot(snapshot))
    }

    /// Writes a snapshot next to `path` and renames it into place.
    pub async fn save(&self, path: &Path) -> eyre::Result<()> {
        let json = serde_json::to_string_pretty(&self.snapshot().await)
            .context("serialize state snapshot")?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        tokio::fs::write(&tmp, json)
            .await
            .context("write temporary state file")?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("move state file into {}", path.display()))?;
        Ok(())
    }

    pub async fn upsert_account(&self, account: Account) {
        self.accounts
            .write()
            .await
            .insert(account.id.clone(), account);
    }
}

/// Exclusive hold on a state file, shared by every process that loads and saves it.
///
/// The lock lives on a `<state>.lock` sibling because [`MemoryStore::save`] replaces the state
/// file itself. It is released when dropped.
#[derive(Debug)]
pub struct StateLock {
    _file: File,
    path: PathBuf,
}

impl StateLock {
    /// Waits until no other process holds the lock for `state`.
    pub async fn acquire(state: &Path) -> eyre::Result<Self> {
        let mut path = state.as_os_str().to_owned();
        path.push(".lock");
        let path = PathBuf::from(path);
        tokio::task::spawn_blocking(move || -> eyre::Result<Self> {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)
                .with_context(|| format!("open lock file {}", path.display()))?;
            fs4::fs_std::FileExt::lock_exclusive(&file)
                .with_context(|| format!("lock {}", path.display()))?;
            tracing::trace!(path = %path.display(), "holding state lock");
            Ok(Self { _file: file, path })
        })
        .await
        .context("state lock task")?
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl VideoStore for MemoryStore {
    async fn insert(&self, video: Video) -> Result<()> {
        let mut videos = self.videos.write().await;
        if videos.contains_key(&video.id) {
            return Err(Error::Storage(format!("video {} already exists", video.id)));
        }
        videos.insert(video.id.clone(), video);
        Ok(())
    }

    async fn get(&self, id: &VideoId) -> Result<Option<Video>> {
        Ok(self.videos.read().await.get(id).cloned())
    }

    async fn list(&self, status: VideoStatus, creator: Option<&AccountId>) -> Result<Vec<Video>> {
        let mut matching: Vec<_> = self
            .videos
            .read()
            .await
            .values()
            .filter(|v| v.status == status)
            .filter(|v| creator.is_none_or(|c| &v.creator == c))
            .cloned()
            .collect();
        matching.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(matching)
    }

    async fn transition(
        &self,
        id: &VideoId,
        expected: VideoStatus,
        change: StatusChange,
    ) -> Result<Video> {
        if change.status == VideoStatus::Uploaded
            && change
                .external_id
                .as_ref()
                .is_none_or(|ext| ext.as_str().trim().is_empty())
        {
            return Err(Error::Storage(format!(
                "refusing to mark video {id} uploaded without an external id"
            )));
        }

        let mut videos = self.videos.write().await;
        let video = videos.get_mut(id).ok_or_else(|| Error::NotFound(id.clone()))?;
        if video.status != expected || !expected.can_transition_to(change.status) {
            return Err(Error::Conflict {
                video: id.clone(),
                expected,
                found: video.status,
            });
        }
        video.status = change.status;
        video.external_id = change.external_id;
        video.updated_at = Timestamp::now();
        Ok(video.clone())
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn get(&self, account: &AccountId) -> Result<Option<CredentialSet>> {
        Ok(self.credentials.read().await.get(account).cloned())
    }

    async fn put(&self, set: CredentialSet) -> Result<()> {
        self.credentials
            .write()
            .await
            .insert(set.account.clone(), set);
        Ok(())
    }

    async fn replace_access(
        &self,
        account: &AccountId,
        derived_from: &RefreshToken,
        access: AccessCredential,
        rotated_refresh: Option<RefreshToken>,
    ) -> Result<bool> {
        let mut credentials = self.credentials.write().await;
        let Some(set) = credentials.get_mut(account) else {
            return Ok(false);
        };
        if !set.holds_refresh(derived_from) {
            return Ok(false);
        }
        set.access = Some(access);
        if let Some(rotated) = rotated_refresh {
            set.refresh = Some(rotated);
        }
        set.updated_at = Timestamp::now();
        Ok(true)
    }
}

#[async_trait]
impl AccountDirectory for MemoryStore {
    async fn account(&self, id: &AccountId) -> Result<Option<Account>> {
        Ok(self.accounts.read().await.get(id).cloned())
    }
}
