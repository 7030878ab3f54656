use super::{BlobStore, BlobStoreError};
use async_trait::async_trait;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::Client;
use tracing::warn;

/// `BlobStore` backed by an S3-compatible object store — MinIO in
/// production, any real
/// S3 endpoint in principle.
pub struct S3BlobStore {
    client: Client,
    bucket: String,
}

impl S3BlobStore {
    pub async fn connect(
        endpoint: &str,
        access_key_id: &str,
        secret_access_key: &str,
        use_ssl: bool,
        bucket: String,
    ) -> Result<Self, BlobStoreError> {
        let scheme = if use_ssl { "https" } else { "http" };
        let credentials = Credentials::new(access_key_id, secret_access_key, None, None, "static");
        let config = aws_sdk_s3::Config::builder()
            .region(Region::new("us-east-1"))
            .endpoint_url(format!("{scheme}://{endpoint}"))
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();
        let client = Client::from_conf(config);

        client
            .head_bucket()
            .bucket(&bucket)
            .send()
            .await
            .map_err(|e| BlobStoreError::Connect(e.to_string()))?;

        Ok(Self { client, bucket })
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), BlobStoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(data.into())
            .send()
            .await
            .map_err(|e| BlobStoreError::Operation(e.to_string()))?;
        Ok(())
    }

    async fn remove_with_prefix(&self, prefix: &str) -> Result<(), BlobStoreError> {
        let mut continuation_token = None;
        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }
            let resp = request
                .send()
                .await
                .map_err(|e| BlobStoreError::Operation(e.to_string()))?;

            let keys: Vec<_> = resp
                .contents()
                .iter()
                .filter_map(|o| o.key().map(|k| k.to_string()))
                .collect();

            for key in keys {
                if let Err(err) = self
                    .client
                    .delete_object()
                    .bucket(&self.bucket)
                    .key(&key)
                    .send()
                    .await
                {
                    warn!(%key, %err, "failed to delete blob, will retry next recycle tick");
                    return Err(BlobStoreError::Operation(err.to_string()));
                }
            }

            if resp.is_truncated().unwrap_or(false) {
                continuation_token = resp.next_continuation_token().map(|s| s.to_string());
            } else {
                break;
            }
        }
        Ok(())
    }
}
