//! HTTP implementation of the block source protocol.
//!
//! Talks to a block-based document API: `pages/{id}` resolves a reference
//! to its root page, `blocks/{id}/children` lists direct children. Block
//! payloads carry their text under a per-type object as a `rich_text`
//! array whose items have a `plain_text` field and, for text runs, a
//! `text.content` field.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use super::{Block, BlockSource, RootInfo, SourceError};

/// Block source backed by an HTTP JSON API with bearer authentication.
#[derive(Clone)]
pub struct HttpBlockSource {
    client: Client,
    base_url: Url,
    token: String,
}

impl HttpBlockSource {
    /// Create a client for the given API base URL.
    pub fn new(base_url: Url, token: String, timeout: Duration) -> Result<Self, SourceError> {
        let client = Client::builder()
            .user_agent(concat!("strata/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .gzip(true)
            .build()?;
        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, SourceError> {
        self.base_url
            .join(path)
            .map_err(|e| SourceError::Malformed(format!("invalid endpoint {path}: {e}")))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T, SourceError> {
        debug!(%url, "source request");
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<ErrorBody>()
                .await
                .map(|b| b.message)
                .unwrap_or_else(|_| status.to_string());
            return Err(match status {
                StatusCode::NOT_FOUND => SourceError::NotFound(message),
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SourceError::Auth(message),
                StatusCode::TOO_MANY_REQUESTS => SourceError::RateLimited,
                _ => SourceError::Api {
                    status: status.as_u16(),
                    message,
                },
            });
        }

        response.json::<T>().await.map_err(Into::into)
    }
}

#[async_trait]
impl BlockSource for HttpBlockSource {
    async fn get_root(&self, reference_id: &str) -> Result<RootInfo, SourceError> {
        let url = self.endpoint(&format!("pages/{reference_id}"))?;
        let page: RawPage = self.get_json(url).await?;
        let title = page.title().ok_or_else(|| {
            SourceError::Malformed(format!("page {reference_id} has no title property"))
        })?;
        Ok(RootInfo {
            url: page.url,
            title,
        })
    }

    async fn get_children(&self, block_id: &str) -> Result<Vec<Block>, SourceError> {
        let mut blocks = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut url = self.endpoint(&format!("blocks/{block_id}/children"))?;
            if let Some(cursor) = &cursor {
                url.query_pairs_mut().append_pair("start_cursor", cursor);
            }
            let page: ChildrenResponse = self.get_json(url).await?;
            blocks.extend(page.results.into_iter().map(RawBlock::into_block));

            match (page.has_more, page.next_cursor) {
                (true, Some(next)) => cursor = Some(next),
                _ => break,
            }
        }

        Ok(blocks)
    }

    fn with_token(&self, token: &str) -> Option<Arc<dyn BlockSource>> {
        let mut source = self.clone();
        source.token = token.to_string();
        Some(Arc::new(source))
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

#[derive(Deserialize)]
struct RawPage {
    url: String,
    #[serde(default)]
    properties: serde_json::Value,
}

impl RawPage {
    fn title(&self) -> Option<String> {
        self.properties
            .get("title")?
            .get("title")?
            .get(0)?
            .get("plain_text")?
            .as_str()
            .map(str::to_string)
    }
}

#[derive(Deserialize)]
struct ChildrenResponse {
    results: Vec<RawBlock>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Deserialize)]
struct RawBlock {
    id: String,
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    has_children: bool,
    #[serde(flatten)]
    payload: serde_json::Map<String, serde_json::Value>,
}

#[derive(Deserialize, Default)]
struct RichTextItem {
    #[serde(default)]
    plain_text: String,
    #[serde(default)]
    text: Option<TextRun>,
}

#[derive(Deserialize)]
struct TextRun {
    #[serde(default)]
    content: String,
}

impl RawBlock {
    /// Extract plain and formatted text from the per-type payload.
    fn into_block(self) -> Block {
        let rich_text: Vec<RichTextItem> = self
            .payload
            .get(&self.block_type)
            .and_then(|content| content.get("rich_text"))
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or_default();

        let plain_text: String = rich_text.iter().map(|item| item.plain_text.as_str()).collect();
        let formatted: String = rich_text
            .iter()
            .filter_map(|item| item.text.as_ref().map(|t| t.content.as_str()))
            .collect();

        Block {
            id: self.id,
            block_type: self.block_type,
            has_children: self.has_children,
            plain_text,
            formatted_text: if formatted.is_empty() {
                None
            } else {
                Some(formatted)
            },
        }
    }
}
