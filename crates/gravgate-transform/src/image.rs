//! Image storage is a single external capability the streaming engine and
//! adapter call into; base64 pass-through and S3-compatible backends are
//! left as extension points behind the same trait.

use async_trait::async_trait;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ImageSinkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait ImageSink: Send + Sync {
    async fn save_image(&self, bytes: &[u8], mime_type: &str) -> Result<String, ImageSinkError>;
}

/// Writes decoded inline-data images under `DATA_DIR/images` and returns a
/// `file://` URL, the simplest backend satisfying the `SaveImage` contract.
pub struct LocalFileImageSink {
    dir: std::path::PathBuf,
}

impl LocalFileImageSink {
    pub fn new(data_dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            dir: data_dir.into().join("images"),
        }
    }

    fn extension_for(mime_type: &str) -> &'static str {
        match mime_type {
            "image/png" => "png",
            "image/jpeg" | "image/jpg" => "jpg",
            "image/webp" => "webp",
            "image/gif" => "gif",
            _ => "bin",
        }
    }
}

#[async_trait]
impl ImageSink for LocalFileImageSink {
    async fn save_image(&self, bytes: &[u8], mime_type: &str) -> Result<String, ImageSinkError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let filename = format!("{}.{}", Uuid::new_v4(), Self::extension_for(mime_type));
        let path = self.dir.join(&filename);
        tokio::fs::write(&path, bytes).await?;
        Ok(format!("file://{}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn saves_bytes_and_returns_a_url_with_the_right_extension() {
        let dir = std::env::temp_dir().join(format!("gravgate-image-test-{}", Uuid::new_v4()));
        let sink = LocalFileImageSink::new(&dir);
        let url = sink.save_image(b"fake-png-bytes", "image/png").await.unwrap();
        assert!(url.ends_with(".png"));
        assert!(url.starts_with("file://"));
    }
}
