//! In-memory block source for tests and local experiments.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{Block, BlockSource, RootInfo, SourceError};

/// Block source backed by in-memory maps. The tree can be mutated between
/// passes, which is how tests simulate edits to the external document.
pub struct MemoryBlockSource {
    root: Mutex<RootInfo>,
    children: Mutex<HashMap<String, Vec<Block>>>,
    children_failures: AtomicUsize,
}

impl MemoryBlockSource {
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            root: Mutex::new(RootInfo {
                url: url.into(),
                title: title.into(),
            }),
            children: Mutex::new(HashMap::new()),
            children_failures: AtomicUsize::new(0),
        }
    }

    /// Replace the direct children of a block.
    pub fn set_children(&self, block_id: &str, blocks: Vec<Block>) {
        self.children
            .lock()
            .unwrap()
            .insert(block_id.to_string(), blocks);
    }

    pub fn set_title(&self, title: &str) {
        self.root.lock().unwrap().title = title.to_string();
    }

    /// Make the next `n` child listings fail with a transient error.
    pub fn fail_children_times(&self, n: usize) {
        self.children_failures.store(n, Ordering::SeqCst);
    }

    /// Convenience constructor for a leaf text block.
    pub fn text_block(id: &str, text: &str) -> Block {
        Block {
            id: id.to_string(),
            block_type: "paragraph".to_string(),
            has_children: false,
            plain_text: text.to_string(),
            formatted_text: None,
        }
    }

    /// Convenience constructor for a block with children.
    pub fn parent_block(id: &str, text: &str) -> Block {
        Block {
            has_children: true,
            ..Self::text_block(id, text)
        }
    }
}

#[async_trait]
impl BlockSource for MemoryBlockSource {
    async fn get_root(&self, reference_id: &str) -> Result<RootInfo, SourceError> {
        let _ = reference_id;
        Ok(self.root.lock().unwrap().clone())
    }

    async fn get_children(&self, block_id: &str) -> Result<Vec<Block>, SourceError> {
        let remaining = self.children_failures.load(Ordering::SeqCst);
        if remaining > 0
            && self
                .children_failures
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(SourceError::RateLimited);
        }

        Ok(self
            .children
            .lock()
            .unwrap()
            .get(block_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_returns_configured_children() {
        let source = MemoryBlockSource::new("https://example.test/doc", "Doc");
        source.set_children(
            "root",
            vec![
                MemoryBlockSource::text_block("a", "first"),
                MemoryBlockSource::text_block("b", "second"),
            ],
        );

        let root = source.get_root("ref").await.unwrap();
        assert_eq!(root.title, "Doc");

        let children = source.get_children("root").await.unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].id, "a");

        assert!(source.get_children("unknown").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_injection_is_transient() {
        let source = MemoryBlockSource::new("https://example.test/doc", "Doc");
        source.set_children("root", vec![MemoryBlockSource::text_block("a", "x")]);
        source.fail_children_times(2);

        assert!(source.get_children("root").await.is_err());
        assert!(source.get_children("root").await.is_err());
        assert_eq!(source.get_children("root").await.unwrap().len(), 1);
    }
}
