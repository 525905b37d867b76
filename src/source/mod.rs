//! Source client boundary.
//!
//! The normalizer walks an external block tree through the [`BlockSource`]
//! trait; everything protocol-specific stays in the implementations. The
//! HTTP client talks to a block-based document API, the in-memory source
//! backs tests.

mod http;
mod memory;

pub use http::HttpBlockSource;
pub use memory::MemoryBlockSource;

use std::sync::Arc;

use async_trait::async_trait;

/// Errors from the external document source.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("source rate limited the request")]
    RateLimited,
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("authorization rejected: {0}")]
    Auth(String),
    #[error("malformed source payload: {0}")]
    Malformed(String),
    #[error("source API error ({status}): {message}")]
    Api { status: u16, message: String },
}

impl SourceError {
    /// True if retrying the same request can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited | Self::Network(_) => true,
            Self::Api { status, .. } => *status >= 500,
            Self::NotFound(_) | Self::Auth(_) | Self::Malformed(_) => false,
        }
    }
}

/// Root information for a referenced document.
#[derive(Debug, Clone)]
pub struct RootInfo {
    pub url: String,
    pub title: String,
}

/// One block of the external document tree, with text already extracted.
#[derive(Debug, Clone)]
pub struct Block {
    pub id: String,
    pub block_type: String,
    pub has_children: bool,
    /// Concatenated plain text of the block.
    pub plain_text: String,
    /// Concatenated formatted text, if the block carries any.
    pub formatted_text: Option<String>,
}

/// Read access to an external block-based document source.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Resolve a reference id to its document root.
    async fn get_root(&self, reference_id: &str) -> Result<RootInfo, SourceError>;

    /// Ordered direct children of a block.
    async fn get_children(&self, block_id: &str) -> Result<Vec<Block>, SourceError>;

    /// A copy of this source authenticated with a caller-provided token,
    /// if the implementation supports per-request credentials.
    fn with_token(&self, token: &str) -> Option<Arc<dyn BlockSource>> {
        let _ = token;
        None
    }
}
