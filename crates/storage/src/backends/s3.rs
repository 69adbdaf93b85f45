//! S3-compatible storage backend using AWS SDK.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteStream, CacheObject, CacheStore};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::provider::ProvideCredentials;
use aws_credential_types::provider::error::CredentialsError;
use aws_credential_types::provider::future::ProvideCredentials as ProvideCredentialsFuture;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::retry::RetryConfig;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_smithy_http_client::Builder as SmithyHttpClientBuilder;
use bazel_cache_core::{CacheKey, StorageConfig};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::sync::OnceCell;
use tokio_util::io::ReaderStream;
use tracing::instrument;

/// Part size for S3 multipart uploads (5 MiB).
/// S3 requires all parts except the last to be at least 5 MB. Bodies that end
/// before one part is filled are sent with a single PutObject.
pub const PART_SIZE: usize = 5 * 1024 * 1024;

/// S3 rejects part numbers above this.
pub const MAX_PARTS: usize = 10_000;

/// Parts uploaded at each size before the part size doubles.
const PARTS_PER_SIZE_STEP: usize = 1_000;

/// Size of the next part after `completed` parts.
///
/// Starts at [`PART_SIZE`] and doubles every [`PARTS_PER_SIZE_STEP`] parts, so
/// [`MAX_PARTS`] parts reach S3's 5 TiB object limit.
pub fn part_size(completed: usize) -> usize {
    PART_SIZE << (completed / PARTS_PER_SIZE_STEP).min(9)
}

/// Provider name attached to statically configured credentials.
const STATIC_CREDENTIALS_PROVIDER: &str = "bazel-s3-cache-config";

/// Marker included in lazy-credentials initialization errors so we can map them
/// to actionable storage config errors instead of generic S3 transport failures.
const CREDENTIALS_INIT_ERROR_MARKER: &str = "bazel-cache-s3-lazy-credentials-init";
const CREDENTIALS_RESOLVE_ERROR_MARKER: &str = "bazel-cache-s3-lazy-credentials-resolve";

/// Lazily initializes the AWS default credentials chain on first signed request.
///
/// This avoids constructor-time side effects (notably TLS/native-root initialization)
/// in environments where no root certificates are available.
#[derive(Debug)]
struct LazyDefaultCredentialsProvider {
    region: String,
    chain: OnceCell<aws_config::default_provider::credentials::DefaultCredentialsChain>,
}

impl LazyDefaultCredentialsProvider {
    fn new(region: String) -> Self {
        Self {
            region,
            chain: OnceCell::new(),
        }
    }

    async fn build_chain(
        &self,
    ) -> Result<aws_config::default_provider::credentials::DefaultCredentialsChain, CredentialsError>
    {
        let region = aws_config::Region::new(self.region.clone());

        tokio::task::spawn(async move {
            aws_config::default_provider::credentials::DefaultCredentialsChain::builder()
                .region(region)
                .build()
                .await
        })
        .await
        .map_err(|join_err| {
            CredentialsError::provider_error(format!(
                "{CREDENTIALS_INIT_ERROR_MARKER}: failed to initialize AWS default credential chain: {join_err}"
            ))
        })
    }

    async fn chain(
        &self,
    ) -> Result<&aws_config::default_provider::credentials::DefaultCredentialsChain, CredentialsError>
    {
        self.chain
            .get_or_try_init(|| async { self.build_chain().await })
            .await
    }

    async fn credentials(&self) -> aws_credential_types::provider::Result {
        let chain = self.chain().await?;
        chain.provide_credentials().await.map_err(|err| {
            CredentialsError::provider_error(format!(
                "{CREDENTIALS_RESOLVE_ERROR_MARKER}: default AWS credentials resolution failed: {err}"
            ))
        })
    }
}

impl ProvideCredentials for LazyDefaultCredentialsProvider {
    fn provide_credentials<'a>(&'a self) -> ProvideCredentialsFuture<'a>
    where
        Self: 'a,
    {
        ProvideCredentialsFuture::new(self.credentials())
    }
}

fn map_s3_operation_error<E>(err: SdkError<E>) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let err_text = DisplayErrorContext(&err).to_string();
    if err_text.contains(CREDENTIALS_INIT_ERROR_MARKER)
        || err_text.contains(CREDENTIALS_RESOLVE_ERROR_MARKER)
    {
        return StorageError::Config(
            "S3 credential initialization failed. Configure AWS credentials explicitly or ensure ambient AWS credentials and trust roots are available."
                .to_string(),
        );
    }

    StorageError::S3(err_text.into())
}

fn map_get_error(err: SdkError<GetObjectError>, key: &str) -> StorageError {
    if let SdkError::ServiceError(ref service_err) = err
        && (service_err.err().is_no_such_key() || service_err.raw().status().as_u16() == 404)
    {
        return StorageError::NotFound(key.to_string());
    }
    map_s3_operation_error(err)
}

/// Bazel cache store backed by an S3 bucket.
///
/// Entries live at `<namespace>/<digest>` inside the bucket.
pub struct S3Backend {
    client: Client,
    bucket: String,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

impl S3Backend {
    /// Create a new S3 backend from storage configuration.
    ///
    /// Static credentials are used when configured. Otherwise the AWS default
    /// chain (environment, profile, IMDS/ECS, web identity) is resolved on the
    /// first signed request.
    pub async fn new(config: &StorageConfig) -> StorageResult<Self> {
        config.validate().map_err(StorageError::Config)?;

        let region = config.region.clone();
        let mut s3_config_builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_config::Region::new(region.clone()))
            .retry_config(RetryConfig::standard().with_max_attempts(config.max_attempts));

        if let (Some(key_id), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            let credentials = aws_sdk_s3::config::Credentials::new(
                key_id,
                secret,
                config.session_token.clone(),
                None, // expiration
                STATIC_CREDENTIALS_PROVIDER,
            );
            s3_config_builder = s3_config_builder.credentials_provider(credentials);
        } else {
            s3_config_builder = s3_config_builder
                .credentials_provider(LazyDefaultCredentialsProvider::new(region));
        }

        let normalized_endpoint = config.endpoint.as_deref().map(normalize_endpoint);

        if let Some(endpoint_url) = &normalized_endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);

            // Plain HTTP endpoints (e.g. local MinIO) get an HTTP-only client
            // so SDK initialization doesn't depend on native trust roots.
            if endpoint_url.to_ascii_lowercase().starts_with("http://") {
                s3_config_builder =
                    s3_config_builder.http_client(SmithyHttpClientBuilder::new().build_http());
            }
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = Client::from_conf(s3_config_builder.build());

        tracing::debug!(
            bucket = %config.bucket,
            endpoint = normalized_endpoint.as_deref().unwrap_or("aws"),
            max_attempts = config.max_attempts,
            static_credentials = config.has_static_credentials(),
            "Configured S3 backend"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
        })
    }

    /// Wrap an already configured client.
    pub fn from_client(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put_single(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_length(data.len() as i64)
            .body(data.into())
            .send()
            .await
            .map_err(map_s3_operation_error)?;
        Ok(())
    }
}

/// Prefix bare `host:port` endpoints with `http://`.
fn normalize_endpoint(endpoint: &str) -> String {
    let endpoint_lower = endpoint.to_lowercase();
    if endpoint_lower.starts_with("http://") || endpoint_lower.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("http://{endpoint}")
    }
}

#[async_trait]
impl CacheStore for S3Backend {
    #[instrument(skip(self), fields(backend = "s3"))]
    async fn get(&self, namespace: &str, digest: &str) -> StorageResult<CacheObject> {
        let key = CacheKey::parse(namespace, digest)?.object_key();
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| map_get_error(e, &key))?;

        let size = output
            .content_length()
            .and_then(|len| u64::try_from(len).ok());

        // AsyncRead over the SDK body, re-chunked as a stream
        let reader_stream = ReaderStream::new(output.body.into_async_read());
        let body = reader_stream.map(|result| result.map_err(StorageError::Io));

        Ok(CacheObject {
            size,
            body: Box::pin(body),
        })
    }

    #[instrument(skip(self, body), fields(backend = "s3"))]
    async fn put(&self, namespace: &str, digest: &str, mut body: ByteStream) -> StorageResult<u64> {
        let key = CacheKey::parse(namespace, digest)?.object_key();

        let mut buffer = BytesMut::new();
        let mut received = 0u64;
        while buffer.len() < PART_SIZE {
            match body.next().await {
                Some(chunk) => {
                    let chunk = chunk?;
                    received += chunk.len() as u64;
                    buffer.extend_from_slice(&chunk);
                }
                None => {
                    self.put_single(&key, buffer.freeze()).await?;
                    return Ok(received);
                }
            }
        }

        let mut upload = MultipartUpload::create(&self.client, &self.bucket, &key).await?;
        match upload.transfer(buffer, &mut body).await {
            Ok(remaining) => {
                let parts = upload.parts.len();
                upload.complete().await?;
                tracing::debug!(key = %key, parts, "Completed multipart upload");
                Ok(received + remaining)
            }
            Err(err) => {
                upload.abort().await;
                Err(err)
            }
        }
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }
}

/// An in-progress multipart upload.
///
/// Dropping it before `complete` or `abort` (e.g. when the request future is
/// cancelled) aborts the upload in the background so parts are not orphaned.
struct MultipartUpload {
    client: Client,
    bucket: String,
    key: String,
    upload_id: String,
    parts: Vec<CompletedPart>,
    finished: bool,
}

impl MultipartUpload {
    async fn create(client: &Client, bucket: &str, key: &str) -> StorageResult<Self> {
        let create_output = client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        let upload_id = create_output
            .upload_id()
            .ok_or_else(|| StorageError::S3("S3 did not return upload_id".into()))?
            .to_string();

        Ok(Self {
            client: client.clone(),
            bucket: bucket.to_string(),
            key: key.to_string(),
            upload_id,
            parts: Vec::new(),
            finished: false,
        })
    }

    /// Upload `buffer` followed by the rest of `body`, sized by [`part_size`].
    /// Returns the number of bytes read from `body`.
    async fn transfer(&mut self, mut buffer: BytesMut, body: &mut ByteStream) -> StorageResult<u64> {
        let mut received = 0u64;
        loop {
            while buffer.len() >= part_size(self.parts.len()) {
                let size = part_size(self.parts.len());
                self.upload_part(buffer.split_to(size).freeze()).await?;
            }
            match body.next().await {
                Some(chunk) => {
                    let chunk = chunk?;
                    received += chunk.len() as u64;
                    buffer.extend_from_slice(&chunk);
                }
                None => break,
            }
        }

        // The last part may be smaller than the part size.
        if !buffer.is_empty() {
            self.upload_part(buffer.freeze()).await?;
        }
        Ok(received)
    }

    async fn upload_part(&mut self, data: Bytes) -> StorageResult<()> {
        let part_number = i32::try_from(self.parts.len() + 1)
            .ok()
            .filter(|n| *n as usize <= MAX_PARTS)
            .ok_or_else(|| {
                StorageError::S3(format!("upload of {} exceeds {MAX_PARTS} parts", self.key).into())
            })?;
        let upload_output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .part_number(part_number)
            .content_length(data.len() as i64)
            .body(data.into())
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        self.parts.push(
            CompletedPart::builder()
                .e_tag(upload_output.e_tag().unwrap_or_default())
                .part_number(part_number)
                .build(),
        );
        Ok(())
    }

    async fn complete(mut self) -> StorageResult<()> {
        let completed_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(self.parts.clone()))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        self.finished = true;
        Ok(())
    }

    /// Best-effort abort. Failures are logged; the original error is what matters.
    async fn abort(mut self) {
        self.finished = true;
        if let Err(e) = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .send()
            .await
        {
            tracing::warn!(
                key = %self.key,
                upload_id = %self.upload_id,
                error = %DisplayErrorContext(&e),
                "Failed to abort multipart upload, orphaned parts may remain"
            );
        }
    }
}

impl Drop for MultipartUpload {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                key = %self.key,
                upload_id = %self.upload_id,
                "Multipart upload dropped outside a runtime, orphaned parts may remain"
            );
            return;
        };

        let client = self.client.clone();
        let bucket = std::mem::take(&mut self.bucket);
        let key = std::mem::take(&mut self.key);
        let upload_id = std::mem::take(&mut self.upload_id);
        runtime.spawn(async move {
            if let Err(e) = client
                .abort_multipart_upload()
                .bucket(&bucket)
                .key(&key)
                .upload_id(&upload_id)
                .send()
                .await
            {
                tracing::warn!(
                    key = %key,
                    upload_id = %upload_id,
                    error = %DisplayErrorContext(&e),
                    "Failed to abort cancelled multipart upload"
                );
            }
        });
    }
}
