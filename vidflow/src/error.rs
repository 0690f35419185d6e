//! Failure taxonomy shared by every pipeline component.

use crate::model::{AccountId, Capability, VideoId, VideoStatus};
use thiserror::Error;

/// Why an OAuth refresh exchange failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeFailure {
    /// The authority answered `invalid_grant`: the grant expired or the owner revoked it.
    RevokedGrant,
    /// Network trouble or an unexpected authority response.
    Transient,
}

/// What the presentation layer should suggest to the user after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remedy {
    /// The account owner has to authorize publishing again.
    Reconnect,
    /// Nothing is wrong with the request; try the publish again later.
    Retry,
    /// The submitter has to fix the video's metadata or content.
    FixMetadata,
    None,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("video {0} not found")]
    NotFound(VideoId),

    #[error("{capability} {actor} may not perform this action on video {video}")]
    Forbidden {
        actor: AccountId,
        capability: Capability,
        video: VideoId,
    },

    #[error("account {0} has no publishing credential; connect a YouTube channel first")]
    CredentialMissing(AccountId),

    #[error("refreshing the access credential of {account} failed ({kind:?}): {detail}")]
    AuthExchangeFailed {
        account: AccountId,
        kind: ExchangeFailure,
        detail: String,
    },

    #[error("publishing API rejected the access credential: {0}")]
    Unauthorized(String),

    #[error("publishing API quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("publishing API rejected the video: {0}")]
    Rejected(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("video {video} was {found}, expected {expected}")]
    Conflict {
        video: VideoId,
        expected: VideoStatus,
        found: VideoStatus,
    },

    /// Another publish of the same video is still running.
    #[error("video {0} is already being published")]
    PublishInProgress(VideoId),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl Error {
    pub fn remedy(&self) -> Remedy {
        match self {
            Error::CredentialMissing(_)
            | Error::AuthExchangeFailed { .. }
            | Error::Unauthorized(_) => Remedy::Reconnect,
            Error::Transport(_) | Error::QuotaExceeded(_) | Error::Storage(_) => Remedy::Retry,
            Error::Rejected(_) => Remedy::FixMetadata,
            Error::NotFound(_)
            | Error::Forbidden { .. }
            | Error::Conflict { .. }
            | Error::PublishInProgress(_) => Remedy::None,
        }
    }

    /// Whether re-running the same publish later may succeed without user action.
    pub fn is_retryable(&self) -> bool {
        self.remedy() == Remedy::Retry
    }

    pub(crate) fn deadline_exceeded(during: &str) -> Self {
        Error::Transport(format!("deadline exceeded while {during}"))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
