use anyhow::{Context, Result};
use bytes::Bytes;
use platform_api::{PlatformError, StoredObject, AVATAR_BUCKET, MEDIA_BUCKET};
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncReadExt;
use url::Url;

const MIB: u64 = 1024 * 1024;
/// Bytes read from the head of an object to detect its type.
const SNIFF_BYTES: u64 = 8192;

/// Size limits of a bucket. `None` means the kind is not accepted.
#[derive(Debug, Clone, Copy)]
struct BucketPolicy {
    image_limit: Option<u64>,
    video_limit: Option<u64>,
}

fn policy(bucket: &str) -> Option<BucketPolicy> {
    match bucket {
        MEDIA_BUCKET => Some(BucketPolicy {
            image_limit: Some(5 * MIB),
            video_limit: Some(15 * MIB),
        }),
        AVATAR_BUCKET => Some(BucketPolicy {
            image_limit: Some(2 * MIB),
            video_limit: None,
        }),
        _ => None,
    }
}

/// Validate a relative object path, rejecting traversal and empty segments.
pub fn validate_path(path: &str) -> Result<PathBuf, PlatformError> {
    let invalid = || PlatformError::Invalid("invalid_path".into());
    if path.is_empty() || path.contains('\\') || path.split('/').any(|s| s.is_empty()) {
        return Err(invalid());
    }
    let p = Path::new(path);
    if !p.components().all(|c| matches!(c, Component::Normal(_))) {
        return Err(invalid());
    }
    Ok(p.to_path_buf())
}

/// Sniff the content type from the bytes, falling back to the extension.
pub fn content_type(path: &str, data: &[u8]) -> String {
    infer::get(data)
        .map(|kind| kind.mime_type().to_string())
        .or_else(|| mime_guess::from_path(path).first().map(|m| m.to_string()))
        .unwrap_or_else(|| "application/octet-stream".into())
}

/// Bucketed object store on the local filesystem.
#[derive(Clone)]
pub struct ObjectStore {
    root: PathBuf,
    public_base: Url,
}

impl ObjectStore {
    pub fn new<P: AsRef<Path>>(root: P, public_base: &str) -> Result<Self> {
        let mut public_base = Url::parse(public_base).context("invalid public url")?;
        if !public_base.path().ends_with('/') {
            let path = format!("{}/", public_base.path());
            public_base.set_path(&path);
        }
        Ok(Self {
            root: root.as_ref().to_path_buf(),
            public_base,
        })
    }

    fn object_path(&self, bucket: &str, path: &str) -> Result<PathBuf, PlatformError> {
        if policy(bucket).is_none() {
            return Err(PlatformError::NotFound(format!("bucket {bucket}")));
        }
        Ok(self.root.join(bucket).join(validate_path(path)?))
    }

    pub fn public_url(&self, bucket: &str, path: &str) -> String {
        self.public_base
            .join(&format!("storage/{bucket}/{path}"))
            .map(|u| u.to_string())
            .unwrap_or_else(|_| format!("{}storage/{bucket}/{path}", self.public_base))
    }

    /// Store an object after checking its type and size against the bucket.
    pub async fn upload(&self, bucket: &str, path: &str, data: Bytes) -> Result<StoredObject> {
        let target = self.object_path(bucket, path)?;
        let policy = policy(bucket).ok_or_else(|| PlatformError::NotFound(bucket.into()))?;
        let content_type = content_type(path, &data);
        let limit = if content_type.starts_with("image/") {
            policy.image_limit
        } else if content_type.starts_with("video/") {
            policy.video_limit
        } else {
            None
        };
        let Some(limit) = limit else {
            return Err(PlatformError::Invalid(format!("unsupported_type:{content_type}")).into());
        };
        let size = data.len() as u64;
        if size > limit {
            return Err(PlatformError::TooLarge { limit }.into());
        }
        if fs::try_exists(&target).await.unwrap_or(false) {
            return Err(PlatformError::Invalid("object_exists".into()).into());
        }
        let mut hasher = Sha256::new();
        hasher.update(&data);
        let etag = format!("{:x}", hasher.finalize());
        if let Some(dir) = target.parent() {
            fs::create_dir_all(dir).await?;
        }
        fs::write(&target, &data).await?;
        Ok(StoredObject {
            bucket: bucket.to_string(),
            path: path.to_string(),
            content_type,
            size,
            etag,
            public_url: self.public_url(bucket, path),
        })
    }

    /// Locate an object for download, returning its path and content type.
    pub async fn locate(&self, bucket: &str, path: &str) -> Result<(PathBuf, String)> {
        let target = self.object_path(bucket, path)?;
        if !fs::try_exists(&target).await.unwrap_or(false) {
            return Err(PlatformError::NotFound("object".into()).into());
        }
        let mut head = Vec::with_capacity(SNIFF_BYTES as usize);
        fs::File::open(&target)
            .await?
            .take(SNIFF_BYTES)
            .read_to_end(&mut head)
            .await?;
        Ok((target, content_type(path, &head)))
    }
}
