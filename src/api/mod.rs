//! REST collaborators: key directory, message history and group rosters
//!
//! Each service is a trait so the stores can run against the HTTP backend
//! ([`RestClient`]) or an in-process one ([`MemoryDirectory`]).

use async_trait::async_trait;
use thiserror::Error;

use crate::crypto::PublicKey;
use crate::protocol::{ChatRecord, GroupRecord};

pub mod memory;
pub mod rest;

pub use memory::MemoryDirectory;
pub use rest::RestClient;

/// REST errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// Request could not be sent or the response not read
    #[error("Request failed: {0}")]
    Request(String),

    /// Server answered with a non-success status
    #[error("{url} returned {status}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Request URL
        url: String,
    },

    /// Response body had an unexpected shape
    #[error("Unexpected response: {0}")]
    Decode(String),

    /// Base URL cannot be used to build endpoints
    #[error("Invalid base URL: {0}")]
    InvalidUrl(String),

    /// Service is not reachable
    #[error("Service unavailable")]
    Unavailable,
}

/// Result type for REST operations
pub type ApiResult<T> = Result<T, ApiError>;

/// Public key directory
#[async_trait]
pub trait KeyDirectory: Send + Sync {
    /// Public key of `user`; `None` if the user never published one
    async fn fetch_public_key(&self, user: &str) -> ApiResult<Option<PublicKey>>;

    /// Publish (or replace) the key of `user`
    async fn publish_public_key(&self, user: &str, key: &PublicKey) -> ApiResult<()>;
}

/// Stored message history
#[async_trait]
pub trait HistoryService: Send + Sync {
    /// Direct messages between `own` and `peer`, in both directions
    async fn direct_history(&self, own: &str, peer: &str) -> ApiResult<Vec<ChatRecord>>;

    /// Messages of `group`
    async fn group_history(&self, group: &str) -> ApiResult<Vec<GroupRecord>>;
}

/// Group membership
#[async_trait]
pub trait GroupDirectory: Send + Sync {
    /// Member ids of `group`
    async fn group_members(&self, group: &str) -> ApiResult<Vec<String>>;
}
