use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

/// Object storage holding original and processed clothing photos.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn upload(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError>;

    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Presigned GET URL valid for `expires_in`.
    async fn signed_url(&self, key: &str, expires_in: Duration) -> Result<String, StorageError>;

    /// Presigned PUT URL a client can upload `content_type` bytes to.
    async fn upload_url(&self, key: &str, content_type: &str, expires_in: Duration) -> Result<String, StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Client for Cloudflare R2 object storage (S3-compatible).
pub struct R2Client {
    bucket: Box<Bucket>,
}

impl R2Client {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?
            .with_path_style();

        Ok(Self { bucket })
    }
}

fn expiry_secs(expires_in: Duration) -> u32 {
    expires_in.as_secs().clamp(1, 7 * 24 * 3600) as u32
}

fn check_status(operation: &'static str, key: &str, status: u16) -> Result<(), StorageError> {
    match status {
        200..=299 => Ok(()),
        404 => Err(StorageError::NotFound(key.to_string())),
        other => Err(StorageError::operation(operation, key, format!("HTTP {other}"))),
    }
}

#[async_trait]
impl Storage for R2Client {
    async fn upload(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        let response = self
            .bucket
            .put_object_with_content_type(key, data, content_type)
            .await
            .map_err(|e| StorageError::operation("upload", key, e))?;
        check_status("upload", key, response.status_code())
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self
            .bucket
            .get_object(key)
            .await
            .map_err(|e| StorageError::operation("download", key, e))?;
        check_status("download", key, response.status_code())?;
        Ok(response.bytes().to_vec())
    }

    async fn signed_url(&self, key: &str, expires_in: Duration) -> Result<String, StorageError> {
        self.bucket
            .presign_get(key, expiry_secs(expires_in), None)
            .await
            .map_err(|e| StorageError::operation("signed_url", key, e))
    }

    async fn upload_url(&self, key: &str, content_type: &str, expires_in: Duration) -> Result<String, StorageError> {
        let mut queries = HashMap::new();
        queries.insert("content-type".to_string(), content_type.to_string());
        self.bucket
            .presign_put(key, expiry_secs(expires_in), None, Some(queries))
            .await
            .map_err(|e| StorageError::operation("upload_url", key, e))
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        match self.bucket.head_object(key).await {
            Ok((_, 404)) => Ok(false),
            Ok((_, status)) => {
                check_status("exists", key, status)?;
                Ok(true)
            }
            Err(s3::error::S3Error::HttpFailWithBody(404, _)) => Ok(false),
            Err(e) => Err(StorageError::operation("exists", key, e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let response = self
            .bucket
            .delete_object(key)
            .await
            .map_err(|e| StorageError::operation("delete", key, e))?;
        check_status("delete", key, response.status_code())
    }
}

/// In-memory storage for tests and local runs.
#[derive(Default)]
pub struct MemoryStorage {
    objects: RwLock<HashMap<String, (Vec<u8>, String)>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn upload(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        self.objects
            .write()
            .await
            .insert(key.to_string(), (data.to_vec(), content_type.to_string()));
        Ok(())
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .read()
            .await
            .get(key)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn signed_url(&self, key: &str, expires_in: Duration) -> Result<String, StorageError> {
        if !self.exists(key).await? {
            return Err(StorageError::NotFound(key.to_string()));
        }
        Ok(format!("memory://{key}?expires={}", expiry_secs(expires_in)))
    }

    async fn upload_url(&self, key: &str, content_type: &str, expires_in: Duration) -> Result<String, StorageError> {
        Ok(format!(
            "memory://{key}?content-type={content_type}&expires={}",
            expiry_secs(expires_in)
        ))
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.objects.read().await.contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.objects.write().await.remove(key);
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage {operation} failed for {key}: {message}")]
    Operation {
        operation: &'static str,
        key: String,
        message: String,
    },

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Storage configuration error: {0}")]
    Config(String),
}

impl StorageError {
    fn operation(operation: &'static str, key: &str, message: impl ToString) -> Self {
        StorageError::Operation {
            operation,
            key: key.to_string(),
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_roundtrip_and_delete() {
        let storage = MemoryStorage::new();
        storage.upload("a.jpg", b"bytes", "image/jpeg").await.unwrap();
        assert!(storage.exists("a.jpg").await.unwrap());
        assert_eq!(storage.download("a.jpg").await.unwrap(), b"bytes");

        storage.delete("a.jpg").await.unwrap();
        assert!(!storage.exists("a.jpg").await.unwrap());
        assert!(matches!(
            storage.download("a.jpg").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_signed_url_requires_object() {
        let storage = MemoryStorage::new();
        assert!(storage.signed_url("missing", Duration::from_secs(60)).await.is_err());

        storage.upload("k", b"x", "image/png").await.unwrap();
        let url = storage.signed_url("k", Duration::from_secs(60)).await.unwrap();
        assert!(url.contains("expires=60"));
    }

    #[test]
    fn test_expiry_clamped() {
        assert_eq!(expiry_secs(Duration::ZERO), 1);
        assert_eq!(expiry_secs(Duration::from_secs(30 * 24 * 3600)), 7 * 24 * 3600);
    }

    #[test]
    fn test_status_mapping() {
        assert!(check_status("download", "k", 200).is_ok());
        assert!(matches!(
            check_status("download", "k", 404),
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            check_status("download", "k", 500),
            Err(StorageError::Operation { operation: "download", .. })
        ));
    }
}
