//! Approval-to-publish pipeline for creator videos.
//!
//! Editors submit drafts, creators and admins approve or reject them, and approved videos are
//! uploaded to YouTube with the approving account's delegated OAuth grant.
//!
//! The pieces, leaves first:
//!
//! - [`store`]: persistence traits with conditional writes, and an in-memory implementation.
//! - [`oauth`] and [`broker`]: the OAuth authority, and the broker that turns a stored refresh
//!   credential into a fresh access credential for every publish.
//! - [`source`] and [`upload`]: the video bytes, and the resumable YouTube upload.
//! - [`publish`]: one publish attempt, bounded by a deadline.
//! - [`workflow`]: the approval state machine that ties it all together.

pub mod broker;
pub mod config;
pub mod error;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod model;
pub mod oauth;
pub mod publish;
pub mod source;
pub mod store;
pub mod upload;
pub mod workflow;

pub use broker::TokenBroker;
pub use config::Config;
pub use error::{Error, ExchangeFailure, Remedy, Result};
pub use model::{
    Account, AccountId, Actor, Capability, ExternalId, NewVideo, StorageLocator, Video, VideoId,
    VideoStatus,
};
pub use oauth::GoogleOAuth;
pub use publish::PublishOrchestrator;
pub use source::FsVideoSource;
pub use store::MemoryStore;
pub use upload::YouTubeUploader;
pub use workflow::{ApprovalWorkflow, PublishOutcome};
