//! Records tracked by the approval-to-publish pipeline.
//!
//! A [`Video`] moves through a closed set of [`VideoStatus`] values:
//!
//! ```text
//! pending ──► approved ──► uploaded
//!    │
//!    └──────► rejected
//! ```
//!
//! `rejected` and `uploaded` are terminal. A [`CredentialSet`] holds the per-account OAuth
//! material used to publish on the account's behalf.

use crate::error::{Error, Result};
use jiff::Timestamp;
use oauth2::{AccessToken, RefreshToken};
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Opaque identifier of a submitted video.
    VideoId
);
string_id!(
    /// Identity of an account (creator, editor, or administrator).
    AccountId
);
string_id!(
    /// Identifier the publishing platform assigned to an uploaded video.
    ExternalId
);
string_id!(
    /// Opaque reference to the stored bytes of a submitted video.
    StorageLocator
);

impl VideoId {
    /// Generates a fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// Lifecycle status of a [`Video`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoStatus {
    Pending,
    Approved,
    Uploaded,
    Rejected,
}

impl VideoStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, VideoStatus::Uploaded | VideoStatus::Rejected)
    }

    /// Whether `self -> next` is one of the legal lifecycle edges.
    pub fn can_transition_to(self, next: VideoStatus) -> bool {
        matches!(
            (self, next),
            (VideoStatus::Pending, VideoStatus::Approved)
                | (VideoStatus::Pending, VideoStatus::Rejected)
                | (VideoStatus::Approved, VideoStatus::Uploaded)
        )
    }
}

impl fmt::Display for VideoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VideoStatus::Pending => "pending",
            VideoStatus::Approved => "approved",
            VideoStatus::Uploaded => "uploaded",
            VideoStatus::Rejected => "rejected",
        })
    }
}

/// A submitted video and its review state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Video {
    pub id: VideoId,
    pub title: String,
    pub description: String,
    pub locator: StorageLocator,
    pub status: VideoStatus,
    /// Set exactly when `status` is [`VideoStatus::Uploaded`].
    pub external_id: Option<ExternalId>,
    pub creator: AccountId,
    /// The editor who submitted the video.
    pub editor: AccountId,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// What submission intake hands over when an editor uploads a draft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewVideo {
    pub title: String,
    pub description: String,
    pub locator: StorageLocator,
    pub creator: AccountId,
    pub editor: AccountId,
}

impl NewVideo {
    pub(crate) fn into_video(self, id: VideoId, now: Timestamp) -> Video {
        Video {
            id,
            title: self.title,
            description: self.description,
            locator: self.locator,
            status: VideoStatus::Pending,
            external_id: None,
            creator: self.creator,
            editor: self.editor,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Permission class of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Creator,
    Editor,
    Admin,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Capability::Creator => "creator",
            Capability::Editor => "editor",
            Capability::Admin => "admin",
        })
    }
}

/// Operations on a video that need an authorization decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Approve a pending video, or retry the publish of an approved one.
    Publish,
    Reject,
}

/// An authenticated caller, as resolved by the session layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: AccountId,
    pub capability: Capability,
}

impl Actor {
    pub fn new(id: impl Into<AccountId>, capability: Capability) -> Self {
        Self {
            id: id.into(),
            capability,
        }
    }

    /// Decides whether this actor may perform `action` on `video`.
    ///
    /// Creators may only publish their own videos, admins may publish anything, and editors
    /// never publish. Rejection carries no ownership rule.
    pub fn authorize(&self, action: Action, video: &Video) -> Result<()> {
        let allowed = match (action, self.capability) {
            (Action::Reject, _) => true,
            (Action::Publish, Capability::Admin) => true,
            (Action::Publish, Capability::Creator) => video.creator == self.id,
            (Action::Publish, Capability::Editor) => false,
        };
        if allowed {
            Ok(())
        } else {
            Err(Error::Forbidden {
                actor: self.id.clone(),
                capability: self.capability,
                video: video.id.clone(),
            })
        }
    }
}

/// Directory record for an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub capability: Capability,
    /// For editors, the creator they work for.
    #[serde(default)]
    pub linked_creator: Option<AccountId>,
}

/// A short-lived credential for the publishing API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessCredential {
    pub token: AccessToken,
    /// When the authority said the credential stops working, if it said.
    #[serde(default)]
    pub expires_at: Option<Timestamp>,
}

impl AccessCredential {
    pub fn new(token: impl Into<String>, expires_at: Option<Timestamp>) -> Self {
        Self {
            token: AccessToken::new(token.into()),
            expires_at,
        }
    }

    pub fn secret(&self) -> &str {
        self.token.secret()
    }
}

/// Per-account OAuth material.
///
/// The access credential is only ever derived from the refresh credential stored alongside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialSet {
    pub account: AccountId,
    #[serde(default)]
    pub refresh: Option<RefreshToken>,
    #[serde(default)]
    pub access: Option<AccessCredential>,
    pub updated_at: Timestamp,
}

impl CredentialSet {
    /// The refresh credential, if present and non-empty.
    pub fn usable_refresh(&self) -> Option<&RefreshToken> {
        self.refresh
            .as_ref()
            .filter(|refresh| !refresh.secret().trim().is_empty())
    }

    /// Whether this set still holds the given refresh credential.
    pub fn holds_refresh(&self, refresh: &RefreshToken) -> bool {
        self.refresh
            .as_ref()
            .is_some_and(|current| current.secret() == refresh.secret())
    }
}

/// Visibility of a video on the publishing platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivacyStatus {
    #[default]
    Private,
    Unlisted,
    Public,
}

/// Metadata sent along with the bytes of a video being published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadMetadata {
    pub title: String,
    pub description: String,
    pub category_id: String,
    pub privacy: PrivacyStatus,
}
