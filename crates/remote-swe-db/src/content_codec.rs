use std::collections::HashMap;
use std::sync::Arc;

use remote_swe_common::{ContentBlock, ImageSource, Result};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::debug;

use crate::blob_store::BlobStore;

/// Moves image bytes out of message content and back.
///
/// `offload` runs on the write path: every inline image is written to the blob
/// store under `<conversation>/<sha256>.<format>` and replaced by a reference.
/// `rehydrate` runs when history is turned back into model input. Fetched
/// bytes are cached for the lifetime of the codec.
pub struct ContentCodec {
    blobs: Arc<dyn BlobStore>,
    cache: RwLock<HashMap<String, Arc<Vec<u8>>>>,
}

impl ContentCodec {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            blobs,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn blob_key(conversation_id: &str, format: &str, data: &[u8]) -> String {
        let digest = format!("{:x}", Sha256::digest(data));
        format!("{conversation_id}/{digest}.{format}")
    }

    pub async fn offload(
        &self,
        conversation_id: &str,
        content: Vec<ContentBlock>,
    ) -> Result<Vec<ContentBlock>> {
        let mut out = Vec::with_capacity(content.len());
        for block in content {
            let block = match block {
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                } => {
                    let mut inner = Vec::with_capacity(content.len());
                    for nested in content {
                        inner.push(self.offload_image(conversation_id, nested).await?);
                    }
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content: inner,
                    }
                }
                other => self.offload_image(conversation_id, other).await?,
            };
            out.push(block);
        }
        Ok(out)
    }

    async fn offload_image(&self, conversation_id: &str, block: ContentBlock) -> Result<ContentBlock> {
        let ContentBlock::Image {
            format,
            source: ImageSource::Bytes { data },
        } = block
        else {
            return Ok(block);
        };

        let key = Self::blob_key(conversation_id, &format, &data);
        self.blobs.put(&key, &data).await?;
        debug!("offloaded {} image bytes to {key}", data.len());
        self.cache.write().await.insert(key.clone(), Arc::new(data));

        Ok(ContentBlock::Image {
            format,
            source: ImageSource::Blob { key },
        })
    }

    pub async fn rehydrate(&self, content: &[ContentBlock]) -> Result<Vec<ContentBlock>> {
        let mut out = Vec::with_capacity(content.len());
        for block in content {
            let block = match block {
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                } => {
                    let mut inner = Vec::with_capacity(content.len());
                    for nested in content {
                        inner.push(self.rehydrate_image(nested).await?);
                    }
                    ContentBlock::ToolResult {
                        tool_use_id: tool_use_id.clone(),
                        content: inner,
                    }
                }
                other => self.rehydrate_image(other).await?,
            };
            out.push(block);
        }
        Ok(out)
    }

    async fn rehydrate_image(&self, block: &ContentBlock) -> Result<ContentBlock> {
        let ContentBlock::Image {
            format,
            source: ImageSource::Blob { key },
        } = block
        else {
            return Ok(block.clone());
        };

        let data = self.fetch(key).await?;
        Ok(ContentBlock::Image {
            format: format.clone(),
            source: ImageSource::Bytes {
                data: data.as_ref().clone(),
            },
        })
    }

    async fn fetch(&self, key: &str) -> Result<Arc<Vec<u8>>> {
        if let Some(hit) = self.cache.read().await.get(key) {
            return Ok(Arc::clone(hit));
        }
        let data = Arc::new(self.blobs.get(key).await?);
        self.cache
            .write()
            .await
            .insert(key.to_string(), Arc::clone(&data));
        Ok(data)
    }

    pub async fn cached_entries(&self) -> usize {
        self.cache.read().await.len()
    }

    pub async fn clear_cache(&self) {
        self.cache.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct CountingBlobs {
        data: Mutex<HashMap<String, Vec<u8>>>,
        gets: AtomicUsize,
    }

    #[async_trait]
    impl BlobStore for CountingBlobs {
        async fn put(&self, key: &str, data: &[u8]) -> Result<()> {
            self.data
                .lock()
                .expect("lock")
                .insert(key.to_string(), data.to_vec());
            Ok(())
        }

        async fn get(&self, key: &str) -> Result<Vec<u8>> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            self.data
                .lock()
                .expect("lock")
                .get(key)
                .cloned()
                .ok_or_else(|| remote_swe_common::Error::Blob(format!("missing {key}")))
        }
    }

    fn screenshot_result() -> Vec<ContentBlock> {
        vec![ContentBlock::ToolResult {
            tool_use_id: "t1".into(),
            content: vec![
                ContentBlock::text("captured"),
                ContentBlock::image_bytes("png", vec![9, 8, 7]),
            ],
        }]
    }

    #[tokio::test]
    async fn offload_replaces_bytes_with_hash_key() {
        let blobs = Arc::new(CountingBlobs::default());
        let codec = ContentCodec::new(blobs.clone());

        let stored = codec.offload("conv-1", screenshot_result()).await.expect("offload");
        assert!(!stored.iter().any(ContentBlock::has_inline_bytes));

        let expected_key = ContentCodec::blob_key("conv-1", "png", &[9, 8, 7]);
        assert!(expected_key.starts_with("conv-1/"));
        assert!(expected_key.ends_with(".png"));
        assert!(blobs.data.lock().expect("lock").contains_key(&expected_key));
    }

    #[tokio::test]
    async fn rehydrate_restores_bytes_and_caches() {
        let blobs = Arc::new(CountingBlobs::default());
        let writer = ContentCodec::new(blobs.clone());
        let stored = writer.offload("conv-1", screenshot_result()).await.expect("offload");

        // A fresh codec simulates another process with a cold cache.
        let reader = ContentCodec::new(blobs.clone());
        let first = reader.rehydrate(&stored).await.expect("rehydrate");
        let second = reader.rehydrate(&stored).await.expect("rehydrate again");

        assert_eq!(first, screenshot_result());
        assert_eq!(second, first);
        assert_eq!(blobs.gets.load(Ordering::SeqCst), 1);
        assert_eq!(reader.cached_entries().await, 1);
    }

    #[tokio::test]
    async fn text_passes_through_untouched() {
        let codec = ContentCodec::new(Arc::new(CountingBlobs::default()));
        let content = vec![ContentBlock::text("hello")];
        assert_eq!(codec.offload("c", content.clone()).await.expect("offload"), content);
        assert_eq!(codec.rehydrate(&content).await.expect("rehydrate"), content);
    }
}
