//! Persistence seams of the pipeline.
//!
//! The pipeline never assumes a particular database. It talks to these traits, and every write
//! that could race is conditional: a status change names the status it expects to replace, and
//! an access-credential write names the refresh credential it was derived from.

use crate::error::Result;
use crate::model::{
    AccessCredential, Account, AccountId, CredentialSet, ExternalId, Video, VideoId, VideoStatus,
};
use async_trait::async_trait;
use oauth2::RefreshToken;

pub mod memory;

pub use memory::{MemoryStore, Snapshot, StateLock};

/// The target of a conditional status write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub status: VideoStatus,
    pub external_id: Option<ExternalId>,
}

impl StatusChange {
    pub fn approved() -> Self {
        Self {
            status: VideoStatus::Approved,
            external_id: None,
        }
    }

    pub fn rejected() -> Self {
        Self {
            status: VideoStatus::Rejected,
            external_id: None,
        }
    }

    pub fn uploaded(external_id: ExternalId) -> Self {
        Self {
            status: VideoStatus::Uploaded,
            external_id: Some(external_id),
        }
    }
}

/// Source of truth for video lifecycle state.
#[async_trait]
pub trait VideoStore: Send + Sync {
    async fn insert(&self, video: Video) -> Result<()>;

    async fn get(&self, id: &VideoId) -> Result<Option<Video>>;

    /// Videos in `status`, restricted to one creator when `creator` is given.
    async fn list(&self, status: VideoStatus, creator: Option<&AccountId>) -> Result<Vec<Video>>;

    /// Applies `change` only if the stored status is still `expected`.
    ///
    /// Fails with `NotFound` for an unknown id and `Conflict` when the stored status differs or
    /// the edge `expected -> change.status` is not part of the lifecycle. Implementations must
    /// refuse an `uploaded` write without a non-empty external id.
    async fn transition(
        &self,
        id: &VideoId,
        expected: VideoStatus,
        change: StatusChange,
    ) -> Result<Video>;
}

/// Per-account credential persistence.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, account: &AccountId) -> Result<Option<CredentialSet>>;

    /// Replaces the whole set; used when an account completes a new authorization.
    async fn put(&self, set: CredentialSet) -> Result<()>;

    /// Rewrites the access credential (and, if the authority rotated it, the refresh credential)
    /// without disturbing anything else.
    ///
    /// Returns `false` and writes nothing if the stored refresh credential is no longer
    /// `derived_from`, i.e. a newer grant replaced it since the exchange started.
    async fn replace_access(
        &self,
        account: &AccountId,
        derived_from: &RefreshToken,
        access: AccessCredential,
        rotated_refresh: Option<RefreshToken>,
    ) -> Result<bool>;
}

/// Account and role lookup, owned by the identity system.
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    async fn account(&self, id: &AccountId) -> Result<Option<Account>>;
}
