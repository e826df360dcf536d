use crate::config::StorageConfig;
use crate::error::{SigningError, UploadError};
use crate::models::{PhotoField, SignedPhotoView};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use aws_types::region::Region;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Reference to an uploaded photo
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredPhoto {
    /// Object path inside the bucket
    pub path: String,
    /// Stored (public-form) URL written to the container row
    pub url: String,
    pub size_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignedUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// Path-addressed blob store holding the inspection photos
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PhotoStore: Send + Sync {
    fn bucket(&self) -> String;

    /// Stored URL for an object path
    fn public_url(&self, path: &str) -> String;

    /// Upload a new object; an existing object at `path` is a conflict
    async fn upload_photo(
        &self,
        bytes: Vec<u8>,
        path: &str,
        content_type: &str,
    ) -> Result<StoredPhoto, UploadError>;

    /// Time-limited read URL for an object path
    async fn sign_url(&self, path: &str, ttl: Duration) -> Result<SignedUrl, SigningError>;

    async fn delete_photo(&self, path: &str) -> Result<(), UploadError>;
}

/// Object path for a submitted photo: `{userId}/{category}_{timestampMs}_{index}.jpg`
pub fn object_path(user_id: Uuid, field: PhotoField, timestamp_ms: i64, index: usize) -> String {
    format!(
        "{user}/{category}_{timestamp_ms}_{index}.jpg",
        user = sanitize_path_component(&user_id.to_string()),
        category = field.category(),
    )
}

/// Object path of a stored URL, if it points into `bucket`
pub fn path_in_bucket<'a>(bucket: &str, url: &'a str) -> Option<&'a str> {
    let marker = format!("/{bucket}/");
    let (_, path) = url.split_once(marker.as_str())?;
    if path.is_empty() {
        None
    } else {
        Some(path)
    }
}

/// Resolve a stored photo URL into a signed view.
///
/// A null field stays null. A URL outside the bucket or a failed signing
/// degrades to the stored URL unchanged.
pub async fn resolve_signed_url(
    store: &dyn PhotoStore,
    container_id: Uuid,
    field: PhotoField,
    stored_url: Option<&str>,
    ttl: Duration,
) -> Option<SignedPhotoView> {
    let stored_url = stored_url?;
    let unsigned = || SignedPhotoView {
        container_id,
        field,
        url: stored_url.to_string(),
        expires_at: None,
    };

    let bucket = store.bucket();
    let Some(path) = path_in_bucket(&bucket, stored_url) else {
        debug!(
            container_id = %container_id,
            error = %SigningError::OutsideBucket { url: stored_url.to_string(), bucket },
            "Serving stored photo URL unsigned"
        );
        metrics::counter!("inspection.photos.sign_fallback").increment(1);
        return Some(unsigned());
    };

    match store.sign_url(path, ttl).await {
        Ok(signed) => Some(SignedPhotoView {
            container_id,
            field,
            url: signed.url,
            expires_at: Some(signed.expires_at),
        }),
        Err(e) => {
            warn!(
                container_id = %container_id,
                field = ?field,
                error = %e,
                "Signing failed, using stored URL"
            );
            metrics::counter!("inspection.photos.sign_fallback").increment(1);
            Some(unsigned())
        }
    }
}

/// Photo store on S3-compatible object storage (Supabase storage, MinIO, AWS)
pub struct S3PhotoStore {
    client: S3Client,
    config: StorageConfig,
}

impl S3PhotoStore {
    pub async fn new(config: &StorageConfig) -> anyhow::Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "Photo store initialized"
        );

        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    /// Single-part upload for small photos; refused if the object exists
    async fn simple_upload(
        &self,
        bytes: Vec<u8>,
        path: &str,
        content_type: &str,
    ) -> Result<(), UploadError> {
        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(path)
            .body(ByteStream::from(bytes))
            .content_type(content_type)
            .if_none_match("*")
            .send()
            .await
            .map_err(|e| upload_failure(path, &e))?;

        Ok(())
    }

    /// Multipart upload for photos above the configured threshold.
    ///
    /// Any failure after the upload was created aborts it, so no incomplete
    /// parts stay behind in the bucket.
    async fn multipart_upload(
        &self,
        bytes: &[u8],
        path: &str,
        content_type: &str,
    ) -> Result<(), UploadError> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(&self.config.bucket)
            .key(path)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| upload_failure(path, &e))?;

        let upload_id = create_response.upload_id().ok_or_else(|| UploadError::Failed {
            path: path.to_string(),
            message: "no upload ID in response".to_string(),
        })?;

        let result = self.upload_parts(bytes, path, upload_id).await;
        if let Err(e) = &result {
            warn!(path = %path, error = %e, "Multipart upload failed, aborting");
            if let Err(abort) = self
                .client
                .abort_multipart_upload()
                .bucket(&self.config.bucket)
                .key(path)
                .upload_id(upload_id)
                .send()
                .await
            {
                warn!(
                    path = %path,
                    error = %DisplayErrorContext(&abort),
                    "Failed to abort multipart upload"
                );
            }
        }
        result
    }

    async fn upload_parts(
        &self,
        bytes: &[u8],
        path: &str,
        upload_id: &str,
    ) -> Result<(), UploadError> {
        let mut completed_parts = Vec::new();

        for (i, chunk) in bytes.chunks(self.config.part_size_bytes).enumerate() {
            let part_number = i as i32 + 1;

            let upload_part_response = self
                .client
                .upload_part()
                .bucket(&self.config.bucket)
                .key(path)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk.to_vec()))
                .send()
                .await
                .map_err(|e| upload_failure(path, &e))?;

            completed_parts.push(
                aws_sdk_s3::types::CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(upload_part_response.e_tag().unwrap_or_default())
                    .build(),
            );
        }

        let completed_upload = aws_sdk_s3::types::CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.config.bucket)
            .key(path)
            .upload_id(upload_id)
            .multipart_upload(completed_upload)
            .if_none_match("*")
            .send()
            .await
            .map_err(|e| upload_failure(path, &e))?;

        Ok(())
    }
}

fn upload_failure<E, R>(path: &str, err: &SdkError<E, R>) -> UploadError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    classify_upload_failure(path, err.code(), DisplayErrorContext(err).to_string())
}

#[async_trait]
impl PhotoStore for S3PhotoStore {
    fn bucket(&self) -> String {
        self.config.bucket.clone()
    }

    fn public_url(&self, path: &str) -> String {
        self.config.public_url(path)
    }

    #[instrument(skip(self, bytes), fields(size_bytes = bytes.len()))]
    async fn upload_photo(
        &self,
        bytes: Vec<u8>,
        path: &str,
        content_type: &str,
    ) -> Result<StoredPhoto, UploadError> {
        let size_bytes = bytes.len();
        if size_bytes > self.config.multipart_threshold_bytes {
            self.multipart_upload(&bytes, path, content_type).await?;
        } else {
            self.simple_upload(bytes, path, content_type).await?;
        }

        debug!(path = %path, size_bytes, "Photo uploaded");
        metrics::counter!("inspection.photos.uploaded").increment(1);

        Ok(StoredPhoto {
            path: path.to_string(),
            url: self.public_url(path),
            size_bytes,
        })
    }

    async fn sign_url(&self, path: &str, ttl: Duration) -> Result<SignedUrl, SigningError> {
        let failed = |message: String| SigningError::Failed {
            path: path.to_string(),
            message,
        };

        let presigning_config =
            PresigningConfig::expires_in(ttl).map_err(|e| failed(e.to_string()))?;
        let lifetime = chrono::Duration::from_std(ttl).map_err(|e| failed(e.to_string()))?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(path)
            .presigned(presigning_config)
            .await
            .map_err(|e| failed(DisplayErrorContext(&e).to_string()))?;

        Ok(SignedUrl {
            url: presigned.uri().to_string(),
            expires_at: Utc::now() + lifetime,
        })
    }

    #[instrument(skip(self))]
    async fn delete_photo(&self, path: &str) -> Result<(), UploadError> {
        self.client
            .delete_object()
            .bucket(&self.config.bucket)
            .key(path)
            .send()
            .await
            .map_err(|e| upload_failure(path, &e))?;

        debug!(path = %path, "Photo deleted");
        Ok(())
    }
}

fn classify_upload_failure(path: &str, code: Option<&str>, message: String) -> UploadError {
    let path = path.to_string();
    match code {
        Some("PreconditionFailed")
        | Some("ConditionalRequestConflict")
        | Some("Duplicate")
        | Some("ResourceAlreadyExists") => UploadError::Conflict { path },
        Some("QuotaExceeded") | Some("EntityTooLarge") | Some("InsufficientStorage") => {
            UploadError::QuotaExceeded { path }
        }
        _ => UploadError::Failed { path, message },
    }
}

/// Sanitize a path component to prevent path traversal
fn sanitize_path_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

/// Content type for a captured photo format
pub fn content_type_for(format: &str) -> &'static str {
    match format.to_lowercase().as_str() {
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}
