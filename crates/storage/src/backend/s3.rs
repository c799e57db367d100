//! S3-compatible repository backend.
//!
//! Serves both the `s3` and `minio` backend kinds: MinIO (and other
//! self-hosted object stores) differ only in the endpoint URL, and
//! path-style addressing works everywhere.
//!
//! # Credentials
//!
//! Credentials come from the standard `AWS_ACCESS_KEY_ID` /
//! `AWS_SECRET_ACCESS_KEY` environment variables (plus optional
//! `AWS_REGION`). Missing credentials surface as
//! [`Auth`](crate::error::ErrorKind::Auth), which read paths treat as
//! "skip this repository".

use crate::error::{ErrorKind, Result};
use crate::{Backend, key};
use async_trait::async_trait;
use aws_sdk_s3::{
    Client,
    config::{BehaviorVersion, Credentials, Region, retry::RetryConfig},
    error::{ProvideErrorMetadata, SdkError},
    operation::{get_object::GetObjectError, head_object::HeadObjectError},
    primitives::ByteStream,
};
use exn::ResultExt;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Generous default for concurrent S3 requests.
const DEFAULT_CONCURRENT_REQUESTS: usize = 100;

/// Repository backend on an S3-compatible object store.
///
/// The repository name doubles as the bucket name; the host is the endpoint
/// URL (empty for AWS proper).
#[derive(Clone, Debug)]
pub struct S3Backend {
    name: String,
    client: Client,
    bucket: String,
    /// Rate limiter for concurrent S3 requests.
    rate_limiter: Arc<Semaphore>,
}

impl S3Backend {
    /// Create a new S3 backend.
    ///
    /// # Arguments
    /// * `name` - Repository name, also used as the bucket name
    /// * `endpoint` - Custom endpoint URL for S3-compatible services (MinIO)
    /// * `region` - Region identifier; object stores that ignore regions
    ///   still require one to sign requests
    /// * `key_id` / `key_secret` - Access credentials
    pub fn new(
        name: impl Into<String>,
        endpoint: Option<impl Into<String>>,
        region: impl Into<String>,
        key_id: impl Into<String>,
        key_secret: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let credentials = Credentials::new(key_id, key_secret, None, None, "audb-config");
        let mut config_builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new(region.into()))
            // Exponential backoff on throttling (1 initial + 3 retries)
            .retry_config(RetryConfig::standard().with_max_attempts(4))
            // Path-style addressing for compatibility with MinIO and friends
            .force_path_style(true);
        if let Some(endpoint_url) = endpoint {
            config_builder = config_builder.endpoint_url(endpoint_url);
        }
        let client = Client::from_conf(config_builder.build());
        Self {
            bucket: name.clone(),
            name,
            client,
            rate_limiter: Arc::new(Semaphore::new(DEFAULT_CONCURRENT_REQUESTS)),
        }
    }

    /// Build an S3 backend from the standard AWS environment variables.
    pub fn from_env(name: impl Into<String>, endpoint: Option<impl Into<String>>) -> Result<Self> {
        let key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .map_err(|_| ErrorKind::Auth("AWS_ACCESS_KEY_ID is not set".to_string()))?;
        let key_secret = std::env::var("AWS_SECRET_ACCESS_KEY")
            .map_err(|_| ErrorKind::Auth("AWS_SECRET_ACCESS_KEY is not set".to_string()))?;
        let region = std::env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string());
        Ok(Self::new(name, endpoint, region, key_id, key_secret))
    }

    /// Acquire a rate limiter permit before making an S3 API call.
    async fn acquire_permit(&self) -> OwnedSemaphorePermit {
        // unwrap is safe: semaphore is never closed
        self.rate_limiter.clone().acquire_owned().await.unwrap()
    }
}

#[async_trait]
impl Backend for S3Backend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn exists(&self, repo_key: &str) -> Result<bool> {
        key::validate(repo_key)?;
        let _permit = self.acquire_permit().await;
        match self.client.head_object().bucket(&self.bucket).key(repo_key).send().await {
            Ok(_) => Ok(true),
            Err(SdkError::ServiceError(e)) if matches!(e.err(), HeadObjectError::NotFound(_)) => Ok(false),
            Err(e) => Err(map_sdk_error(&e, repo_key).into()),
        }
    }

    async fn get(&self, repo_key: &str, dest: &Path) -> Result<()> {
        key::validate(repo_key)?;
        let _permit = self.acquire_permit().await;
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(repo_key)
            .send()
            .await
            .map_err(|e| map_get_error(&e, repo_key))?;
        let mut body = response.body.into_async_read();
        let mut file = tokio::fs::File::create(dest).await.map_err(ErrorKind::Io)?;
        tokio::io::copy(&mut body, &mut file)
            .await
            .or_raise(|| ErrorKind::Network(format!("interrupted download of {repo_key}")))?;
        Ok(())
    }

    async fn put(&self, src: &Path, repo_key: &str) -> Result<()> {
        key::validate(repo_key)?;
        let _permit = self.acquire_permit().await;
        let body = ByteStream::from_path(src).await.map_err(|e| ErrorKind::Io(std::io::Error::other(e)))?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(repo_key)
            .body(body)
            .send()
            .await
            .map_err(|e| map_sdk_error(&e, repo_key))?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| map_sdk_error(&e, prefix))?;
            for object in page.contents() {
                if let Some(object_key) = object.key() {
                    keys.push(object_key.to_string());
                }
            }
        }
        keys.sort_unstable();
        Ok(keys)
    }

    async fn delete(&self, repo_key: &str) -> Result<()> {
        // S3 DeleteObject succeeds even when the object doesn't exist, so
        // check first to match the trait's expected behaviour.
        if !self.exists(repo_key).await? {
            exn::bail!(ErrorKind::NotFound(repo_key.to_string()));
        }
        let _permit = self.acquire_permit().await;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(repo_key)
            .send()
            .await
            .map_err(|e| map_sdk_error(&e, repo_key))?;
        Ok(())
    }
}

const AUTH_CODES: [&str; 4] = ["AccessDenied", "InvalidAccessKeyId", "SignatureDoesNotMatch", "ExpiredToken"];

fn map_sdk_error<E>(e: &SdkError<E>, repo_key: &str) -> ErrorKind
where
    E: ProvideErrorMetadata + std::fmt::Debug,
{
    match e {
        SdkError::ServiceError(s) if s.err().code().is_some_and(|c| AUTH_CODES.contains(&c)) => {
            ErrorKind::Auth(format!("{repo_key}: {:?}", s.err().message()))
        },
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => ErrorKind::Network(format!("{e:?}")),
        _ => ErrorKind::BackendError(format!("{repo_key}: {e:?}")),
    }
}

fn map_get_error(e: &SdkError<GetObjectError>, repo_key: &str) -> ErrorKind {
    match e {
        SdkError::ServiceError(s) if matches!(s.err(), GetObjectError::NoSuchKey(_)) => {
            ErrorKind::NotFound(repo_key.to_string())
        },
        other => map_sdk_error(other, repo_key),
    }
}
