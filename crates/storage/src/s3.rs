//! S3-backed artifact storage.

use anyhow::{Result, anyhow};
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::constants::{S3_AVAILABILITY_MAX_RETRIES, S3_AVAILABILITY_RETRY_DELAY_MS};

pub struct S3Client {
    client: Client,
    bucket_name: String,
}

impl S3Client {
    /// Create a client for a specific bucket using the ambient AWS
    /// credential chain.
    pub async fn new(bucket_name: String) -> Result<Self> {
        let config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        let client = Client::new(&config);

        info!("S3 client initialized for bucket {}", bucket_name);
        Ok(Self {
            client,
            bucket_name,
        })
    }

    /// Write binary data and verify it landed.
    ///
    /// Returns the SHA256 hash of the stored object.
    pub async fn write_binary(
        &self,
        data: Vec<u8>,
        key: &str,
        mime_type: &str,
    ) -> Result<String> {
        debug!(
            "Writing binary to S3 bucket {} with key: {}, size: {} bytes",
            self.bucket_name,
            key,
            data.len()
        );

        let mut hasher = Sha256::new();
        hasher.update(&data);
        let calculated_hash = format!("{:x}", hasher.finalize());

        if let Err(e) = self
            .client
            .put_object()
            .bucket(&self.bucket_name)
            .key(key)
            .body(data.into())
            .content_type(mime_type)
            .metadata("sha256", calculated_hash.clone())
            .send()
            .await
        {
            error!(
                "S3 PUT failed - Bucket: {}, Key: {}, Error: {:?}",
                self.bucket_name, key, e
            );
            return Err(anyhow!("Failed to write to S3: {}", e));
        }

        // Wait for the object to be readable before reporting success.
        let retry_delay = Duration::from_millis(S3_AVAILABILITY_RETRY_DELAY_MS);
        for attempt in 1..=S3_AVAILABILITY_MAX_RETRIES {
            match self.exists(key).await {
                Ok(true) => break,
                Ok(false) if attempt < S3_AVAILABILITY_MAX_RETRIES => {
                    debug!("Object not yet available (attempt {}), retrying...", attempt);
                    sleep(retry_delay).await;
                }
                Ok(false) => {
                    return Err(anyhow!(
                        "Object not available after {} retries",
                        S3_AVAILABILITY_MAX_RETRIES
                    ));
                }
                Err(e) if attempt < S3_AVAILABILITY_MAX_RETRIES => {
                    warn!("Error checking object existence: {}, retrying...", e);
                    sleep(retry_delay).await;
                }
                Err(e) => {
                    return Err(anyhow!("Failed to verify object availability: {}", e));
                }
            }
        }

        info!(
            "Successfully wrote to S3 bucket {} with key: {}, SHA256: {}",
            self.bucket_name, key, calculated_hash
        );
        Ok(calculated_hash)
    }

    /// Read binary data and its SHA256 hash.
    pub async fn read_binary(&self, key: &str) -> Result<(Vec<u8>, String)> {
        debug!(
            "Reading binary from S3 bucket {} with key: {}",
            self.bucket_name, key
        );

        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket_name)
            .key(key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(e) => {
                error!(
                    "S3 GET failed - Bucket: {}, Key: {}, Error: {:?}",
                    self.bucket_name, key, e
                );
                return Err(anyhow!("Failed to read from S3: {}", e));
            }
        };

        let body = output
            .body
            .collect()
            .await
            .map_err(|e| anyhow!("Failed to collect body: {}", e))?;
        let data = body.to_vec();

        let mut hasher = Sha256::new();
        hasher.update(&data);
        let hash = format!("{:x}", hasher.finalize());

        info!(
            "Successfully read from S3 bucket {} with key: {}, size: {} bytes",
            self.bucket_name,
            key,
            data.len()
        );
        Ok((data, hash))
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket_name)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    Ok(false)
                } else {
                    Err(anyhow!(
                        "Failed to check existence in S3: {}",
                        service_error
                    ))
                }
            }
        }
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket_name)
            .key(key)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to delete from S3: {}", e))?;

        info!(
            "Deleted from S3 bucket {} with key: {}",
            self.bucket_name, key
        );
        Ok(())
    }
}
