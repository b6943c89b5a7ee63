//! Resource registry for media exchanged with clients
//!
//! Large payloads (images, voice clips, video) never travel inside control
//! packets. They are registered here and referenced by a [`Rid`]; clients
//! resolve the id into a [`ResourceDescriptor`] carrying a retrieval URL and,
//! for small in-memory content, an inline `data:` URI.
//!
//! # Lifetime
//!
//! Every entry carries a reference count starting at one for the registering
//! party. Storage is reclaimed by [`ResourceManager::sweep`] only once the
//! count is zero and either the grace period since the last release or the
//! TTL since registration has elapsed. A reclaimed id resolves to
//! [`ResourceError::NotFound`]; sequence numbers are never reused, so a stale
//! id can never alias new content.
//!
//! # Uploads
//!
//! Content too large for a control packet can be uploaded out of band.
//! [`ResourceManager::prepare`] reserves an id with the declared size and
//! returns an [`UploadTarget`]; the byte server writes the upload to its
//! path, and [`ResourceManager::commit`] verifies it and makes it
//! retrievable. A pending entry that is not committed within `pending_ttl`
//! is reclaimed by the next sweep even while referenced.
//!
//! # Storage
//!
//! - Content at or under the memory threshold stays in memory
//! - Larger byte payloads spill to `storage_dir/<rid>.bin`
//! - Larger path-backed content is read in place and never deleted
//!
//! # Quota
//!
//! After each registration the total byte and entry quotas are enforced by
//! first sweeping expired entries, then evicting the oldest unreferenced
//! entries. Referenced entries are never evicted, so the store may stay over
//! quota until references drop.

mod descriptor;

pub use descriptor::{ResourceDescriptor, ResourceKind, ResourceSource, ResourceStatus, Rid};

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use dashmap::DashMap;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::error::ErrorCode;
use crate::manager::ClientId;
use crate::protocol::now_ms;

/// Default inline threshold: 256 KiB
pub const DEFAULT_MAX_INLINE_BYTES: u64 = 256 * 1024;
/// Default in-memory threshold: 1 MiB
pub const DEFAULT_MEMORY_THRESHOLD_BYTES: u64 = 1024 * 1024;
/// Default per-resource limit: 16 MiB
pub const DEFAULT_MAX_RESOURCE_BYTES: u64 = 16 * 1024 * 1024;
/// Default store-wide limit: 1 GiB
pub const DEFAULT_MAX_TOTAL_BYTES: u64 = 1024 * 1024 * 1024;
/// Default entry limit
pub const DEFAULT_MAX_ENTRIES: usize = 2000;
/// Smallest permitted cleanup interval
pub const MIN_CLEANUP_INTERVAL: Duration = Duration::from_secs(10);

/// Resource store configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Directory for spilled content
    pub storage_dir: PathBuf,
    /// Base URL of the resource byte server
    pub base_url: String,
    /// Path prefix appended to the base URL
    pub path: String,
    /// Optional access token appended to retrieval URLs
    pub token: Option<String>,
    /// Largest size advertised inline as a `data:` URI
    pub max_inline_bytes: u64,
    /// Largest size kept in memory
    pub memory_threshold_bytes: u64,
    /// Largest single resource
    pub max_resource_bytes: u64,
    /// Total bytes across all entries
    pub max_total_bytes: u64,
    /// Total entry count
    pub max_entries: usize,
    /// Maximum age of an unreferenced entry
    #[serde(with = "secs")]
    pub ttl: Duration,
    /// Delay between the last release and reclamation
    #[serde(with = "secs")]
    pub grace: Duration,
    /// How long a prepared upload may stay uncommitted
    #[serde(with = "secs")]
    pub pending_ttl: Duration,
    /// Interval between background sweeps
    #[serde(with = "secs")]
    pub cleanup_interval: Duration,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            base_url: "http://127.0.0.1:9091".into(),
            path: "/resources".into(),
            token: None,
            max_inline_bytes: DEFAULT_MAX_INLINE_BYTES,
            memory_threshold_bytes: DEFAULT_MEMORY_THRESHOLD_BYTES,
            max_resource_bytes: DEFAULT_MAX_RESOURCE_BYTES,
            max_total_bytes: DEFAULT_MAX_TOTAL_BYTES,
            max_entries: DEFAULT_MAX_ENTRIES,
            ttl: Duration::from_secs(7 * 24 * 60 * 60),
            grace: Duration::from_secs(30),
            pending_ttl: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(600),
        }
    }
}

impl ResourceConfig {
    /// Configuration rooted at `storage_dir` with immediate reclamation
    #[must_use]
    pub fn for_testing(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            grace: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Set the spill directory
    #[must_use]
    pub fn with_storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = dir.into();
        self
    }

    /// Set the retrieval token
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Set the per-resource limit
    #[must_use]
    pub fn with_max_resource_bytes(mut self, max: u64) -> Self {
        self.max_resource_bytes = max;
        self
    }

    /// Set the in-memory threshold
    #[must_use]
    pub fn with_memory_threshold(mut self, bytes: u64) -> Self {
        self.memory_threshold_bytes = bytes;
        self
    }

    /// Set the entry limit
    #[must_use]
    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max;
        self
    }

    /// Set the TTL
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the grace period
    #[must_use]
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Set the uncommitted-upload lifetime
    #[must_use]
    pub fn with_pending_ttl(mut self, ttl: Duration) -> Self {
        self.pending_ttl = ttl;
        self
    }

    /// Cleanup interval clamped to the permitted minimum
    #[must_use]
    pub fn effective_cleanup_interval(&self) -> Duration {
        self.cleanup_interval.max(MIN_CLEANUP_INTERVAL)
    }
}

fn default_storage_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("avatar-bridge")
        .join("resources")
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Resource store errors
#[derive(Debug, Error)]
pub enum ResourceError {
    /// No entry with this id exists (never did, or was reclaimed)
    #[error("resource not found: {0}")]
    NotFound(Rid),

    /// Content exceeds the per-resource limit
    #[error("resource too large: {size} bytes (max {max})")]
    TooLarge {
        /// Content size
        size: u64,
        /// Configured limit
        max: u64,
    },

    /// Entry still exists but its lifetime has ended
    #[error("resource expired: {0}")]
    ExpiredReference(Rid),

    /// Upload reserved but not committed yet
    #[error("resource upload not committed: {0}")]
    NotCommitted(Rid),

    /// Commit for an entry that is not a pending upload
    #[error("resource is not a pending upload: {0}")]
    NotPending(Rid),

    /// Uploaded content does not match the digest declared at prepare time
    #[error("resource digest mismatch for {rid}: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Resource id
        rid: Rid,
        /// Declared hex SHA-256
        expected: String,
        /// Hex SHA-256 of the uploaded bytes
        actual: String,
    },

    /// Filesystem failure while storing or reading content
    #[error("resource I/O failed for {path}: {source}")]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

impl ResourceError {
    /// Wire error code
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) | Self::NotCommitted(_) => ErrorCode::ResourceNotFound,
            Self::TooLarge { .. } => ErrorCode::ResourceTooLarge,
            Self::NotPending(_) | Self::DigestMismatch { .. } => ErrorCode::InvalidPayload,
            Self::ExpiredReference(_) => ErrorCode::ResourceExpired,
            Self::Io { .. } => ErrorCode::Internal,
        }
    }

    fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }
}

#[derive(Debug, Clone)]
enum Content {
    Memory(Arc<Vec<u8>>),
    Spilled(PathBuf),
    External(PathBuf),
    Upload(PathBuf),
}

impl Content {
    fn location(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            Self::Spilled(_) => "spilled",
            Self::External(_) => "external",
            Self::Upload(_) => "pending",
        }
    }
}

#[derive(Debug)]
struct Entry {
    seq: u64,
    kind: ResourceKind,
    mime: String,
    size: u64,
    sha256: String,
    content: Content,
    owner: Option<ClientId>,
    created_at: Instant,
    created_at_ms: i64,
    refs: u32,
    unreferenced_since: Option<Instant>,
    upload: Option<PendingUpload>,
}

#[derive(Debug)]
struct PendingUpload {
    expected_sha256: Option<String>,
    prepared_at: Instant,
}

impl Entry {
    fn expired(&self, config: &ResourceConfig, now: Instant) -> bool {
        let stale_upload = self
            .upload
            .as_ref()
            .is_some_and(|u| now.saturating_duration_since(u.prepared_at) >= config.pending_ttl);
        if stale_upload {
            return true;
        }
        if self.refs > 0 {
            return false;
        }
        let past_ttl = now.saturating_duration_since(self.created_at) >= config.ttl;
        let past_grace = self
            .unreferenced_since
            .is_some_and(|since| now.saturating_duration_since(since) >= config.grace);
        past_ttl || past_grace
    }
}

/// One row of [`ResourceManager::list`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSummary {
    /// Resource id
    pub rid: Rid,
    /// Media kind
    pub kind: ResourceKind,
    /// MIME type
    pub mime: String,
    /// Size in bytes
    pub size: u64,
    /// Outstanding references
    pub refs: u32,
    /// Registering session, if any
    pub owner: Option<ClientId>,
    /// Storage location: memory, spilled, external, or pending
    pub location: &'static str,
    /// Seconds since registration
    pub age_secs: u64,
}

/// Aggregate store figures
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceStats {
    /// Live entries
    pub entries: usize,
    /// Entries with at least one reference
    pub referenced: usize,
    /// Bytes across all entries
    pub total_bytes: u64,
}

/// Reservation returned by [`ResourceManager::prepare`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    /// Reserved id
    pub rid: Rid,
    /// File the byte server writes the upload to
    pub path: PathBuf,
    /// URL the client uploads to
    pub url: String,
}

/// Result of a sweep or quota pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Entries reclaimed
    pub removed: usize,
    /// Bytes reclaimed
    pub reclaimed_bytes: u64,
}

impl SweepReport {
    fn absorb(&mut self, other: Self) {
        self.removed += other.removed;
        self.reclaimed_bytes += other.reclaimed_bytes;
    }
}

struct Inner {
    config: ResourceConfig,
    entries: DashMap<Rid, Entry>,
    next_seq: AtomicU64,
    prefix: String,
    total_bytes: AtomicU64,
}

/// Shared, thread-safe resource registry
///
/// Cloning is cheap; all clones address the same store.
#[derive(Clone)]
pub struct ResourceManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("prefix", &self.inner.prefix)
            .field("entries", &self.inner.entries.len())
            .field("total_bytes", &self.inner.total_bytes.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ResourceManager {
    /// Create an empty store
    #[must_use]
    pub fn new(config: ResourceConfig) -> Self {
        let prefix = hex::encode(rand::random::<[u8; 4]>());
        Self {
            inner: Arc::new(Inner {
                config,
                entries: DashMap::new(),
                next_seq: AtomicU64::new(1),
                prefix,
                total_bytes: AtomicU64::new(0),
            }),
        }
    }

    /// Store configuration
    #[must_use]
    pub fn config(&self) -> &ResourceConfig {
        &self.inner.config
    }

    /// Register content and return its id with one reference held
    ///
    /// The size limit is checked before anything is stored, so an oversized
    /// registration leaves no entry and no file behind.
    ///
    /// # Errors
    ///
    /// Returns `ResourceError::TooLarge` past the per-resource limit and
    /// `ResourceError::Io` when a path cannot be read or spilled content
    /// cannot be written.
    pub async fn register(
        &self,
        source: ResourceSource,
        kind: ResourceKind,
        mime: Option<String>,
        owner: Option<ClientId>,
    ) -> Result<Rid, ResourceError> {
        let config = &self.inner.config;
        let max = config.max_resource_bytes;

        let (data, external, size) = match source {
            ResourceSource::Bytes(data) => {
                let size = data.len() as u64;
                if size > max {
                    return Err(ResourceError::TooLarge { size, max });
                }
                (data, None, size)
            }
            ResourceSource::Path(path) => {
                let metadata = tokio::fs::metadata(&path)
                    .await
                    .map_err(ResourceError::io(&path))?;
                if !metadata.is_file() {
                    return Err(ResourceError::Io {
                        path,
                        source: std::io::Error::new(
                            std::io::ErrorKind::InvalidInput,
                            "not a regular file",
                        ),
                    });
                }
                let size = metadata.len();
                if size > max {
                    return Err(ResourceError::TooLarge { size, max });
                }
                let data = tokio::fs::read(&path)
                    .await
                    .map_err(ResourceError::io(&path))?;
                (data, Some(path), size)
            }
        };

        let sha256 = hex::encode(Sha256::digest(&data));
        let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);
        let rid = Rid::allocate(&self.inner.prefix, seq);

        let content = if size <= config.memory_threshold_bytes {
            Content::Memory(Arc::new(data))
        } else if let Some(path) = external {
            Content::External(path)
        } else {
            Content::Spilled(self.spill(&rid, &data).await?)
        };

        tracing::debug!(
            rid = %rid,
            kind = %kind,
            size,
            location = content.location(),
            "Resource registered"
        );

        let now = Instant::now();
        self.inner.entries.insert(
            rid.clone(),
            Entry {
                seq,
                kind,
                mime: mime.unwrap_or_else(|| kind.default_mime().to_string()),
                size,
                sha256,
                content,
                owner,
                created_at: now,
                created_at_ms: now_ms(),
                refs: 1,
                unreferenced_since: None,
                upload: None,
            },
        );
        self.inner.total_bytes.fetch_add(size, Ordering::SeqCst);

        self.enforce_quota().await;
        Ok(rid)
    }

    /// Reserve an id for an out-of-band upload of `size` bytes
    ///
    /// The entry counts against the quotas with its declared size and holds
    /// one reference for the caller. `sha256`, when given, is checked at
    /// commit.
    ///
    /// # Errors
    ///
    /// `TooLarge` past the per-resource limit, `Io` when the storage
    /// directory cannot be created.
    pub async fn prepare(
        &self,
        kind: ResourceKind,
        mime: Option<String>,
        size: u64,
        sha256: Option<String>,
        owner: Option<ClientId>,
    ) -> Result<UploadTarget, ResourceError> {
        let config = &self.inner.config;
        let max = config.max_resource_bytes;
        if size > max {
            return Err(ResourceError::TooLarge { size, max });
        }

        let dir = &config.storage_dir;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(ResourceError::io(dir))?;

        let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);
        let rid = Rid::allocate(&self.inner.prefix, seq);
        let path = dir.join(format!("{rid}.upload"));
        let expected_sha256 = sha256.map(|digest| digest.to_ascii_lowercase());

        tracing::debug!(rid = %rid, kind = %kind, size, "Upload prepared");

        let now = Instant::now();
        self.inner.entries.insert(
            rid.clone(),
            Entry {
                seq,
                kind,
                mime: mime.unwrap_or_else(|| kind.default_mime().to_string()),
                size,
                sha256: expected_sha256.clone().unwrap_or_default(),
                content: Content::Upload(path.clone()),
                owner,
                created_at: now,
                created_at_ms: now_ms(),
                refs: 1,
                unreferenced_since: None,
                upload: Some(PendingUpload {
                    expected_sha256,
                    prepared_at: now,
                }),
            },
        );
        self.inner.total_bytes.fetch_add(size, Ordering::SeqCst);

        self.enforce_quota().await;
        let url = self.url_for(&rid);
        Ok(UploadTarget { rid, path, url })
    }

    /// File a pending upload should be written to
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown ids, `NotPending` once committed,
    /// `ExpiredReference` past `pending_ttl`.
    pub fn upload_path(&self, rid: &Rid) -> Result<PathBuf, ResourceError> {
        let entry = self
            .inner
            .entries
            .get(rid)
            .ok_or_else(|| ResourceError::NotFound(rid.clone()))?;
        if entry.expired(&self.inner.config, Instant::now()) {
            return Err(ResourceError::ExpiredReference(rid.clone()));
        }
        match &entry.content {
            Content::Upload(path) => Ok(path.clone()),
            _ => Err(ResourceError::NotPending(rid.clone())),
        }
    }

    /// Promote a pending upload to a ready resource
    ///
    /// `data` carries the content in band; without it the file at the
    /// upload path is read. The entry keeps its id and references.
    ///
    /// # Errors
    ///
    /// - `NotFound` for unknown or reclaimed ids
    /// - `NotPending` for entries that were never prepared or are committed
    /// - `ExpiredReference` past `pending_ttl`
    /// - `TooLarge` when the content exceeds the per-resource limit
    /// - `DigestMismatch` when a declared digest does not match
    /// - `Io` when the upload cannot be read or spilled
    pub async fn commit(
        &self,
        rid: &Rid,
        data: Option<Vec<u8>>,
    ) -> Result<ResourceDescriptor, ResourceError> {
        let config = &self.inner.config;
        let (upload_path, expected) = {
            let entry = self
                .inner
                .entries
                .get(rid)
                .ok_or_else(|| ResourceError::NotFound(rid.clone()))?;
            let (Content::Upload(path), Some(upload)) = (&entry.content, &entry.upload) else {
                return Err(ResourceError::NotPending(rid.clone()));
            };
            if entry.expired(config, Instant::now()) {
                return Err(ResourceError::ExpiredReference(rid.clone()));
            }
            (path.clone(), upload.expected_sha256.clone())
        };

        let data = match data {
            Some(data) => data,
            None => tokio::fs::read(&upload_path)
                .await
                .map_err(ResourceError::io(&upload_path))?,
        };
        let size = data.len() as u64;
        if size > config.max_resource_bytes {
            return Err(ResourceError::TooLarge {
                size,
                max: config.max_resource_bytes,
            });
        }
        let sha256 = hex::encode(Sha256::digest(&data));
        if let Some(expected) = expected {
            if expected != sha256 {
                return Err(ResourceError::DigestMismatch {
                    rid: rid.clone(),
                    expected,
                    actual: sha256,
                });
            }
        }

        let content = if size <= config.memory_threshold_bytes {
            Content::Memory(Arc::new(data))
        } else {
            Content::Spilled(self.spill(rid, &data).await?)
        };

        let committed = match self.inner.entries.get_mut(rid) {
            Some(mut entry) if entry.upload.is_some() => {
                let declared = entry.size;
                entry.size = size;
                entry.sha256 = sha256;
                entry.content = content;
                entry.upload = None;
                self.inner.total_bytes.fetch_add(size, Ordering::SeqCst);
                self.inner.total_bytes.fetch_sub(declared, Ordering::SeqCst);
                Ok(self.describe(rid, &entry))
            }
            Some(_) => Err((ResourceError::NotPending(rid.clone()), content)),
            None => Err((ResourceError::NotFound(rid.clone()), content)),
        };

        remove_if_present(&upload_path).await;
        match committed {
            Ok(descriptor) => {
                tracing::debug!(rid = %rid, size, "Upload committed");
                self.enforce_quota().await;
                Ok(descriptor)
            }
            Err((err, content)) => {
                // lost a race with another commit or a sweep
                if let Content::Spilled(path) = content {
                    remove_if_present(&path).await;
                }
                Err(err)
            }
        }
    }

    async fn spill(&self, rid: &Rid, data: &[u8]) -> Result<PathBuf, ResourceError> {
        let dir = &self.inner.config.storage_dir;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(ResourceError::io(dir))?;

        let path = dir.join(format!("{rid}.bin"));
        if let Err(source) = tokio::fs::write(&path, data).await {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(ResourceError::Io { path, source });
        }
        Ok(path)
    }

    /// Resolve an id into its descriptor
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown or reclaimed ids, `ExpiredReference` for
    /// entries awaiting reclamation.
    pub fn resolve(&self, rid: &Rid) -> Result<ResourceDescriptor, ResourceError> {
        let entry = self
            .inner
            .entries
            .get(rid)
            .ok_or_else(|| ResourceError::NotFound(rid.clone()))?;
        if entry.expired(&self.inner.config, Instant::now()) {
            return Err(ResourceError::ExpiredReference(rid.clone()));
        }
        Ok(self.describe(rid, &entry))
    }

    fn url_for(&self, rid: &Rid) -> String {
        let config = &self.inner.config;
        let mut url = format!(
            "{}{}/{}",
            config.base_url.trim_end_matches('/'),
            config.path,
            rid
        );
        if let Some(token) = &config.token {
            url.push_str("?token=");
            url.extend(utf8_percent_encode(token, NON_ALPHANUMERIC));
        }
        url
    }

    fn describe(&self, rid: &Rid, entry: &Entry) -> ResourceDescriptor {
        let config = &self.inner.config;
        let url = self.url_for(rid);

        let inline = match &entry.content {
            Content::Memory(data) if entry.size <= config.max_inline_bytes => Some(format!(
                "data:{};base64,{}",
                entry.mime,
                BASE64.encode(data.as_slice())
            )),
            _ => None,
        };

        ResourceDescriptor {
            rid: rid.clone(),
            kind: entry.kind,
            mime: entry.mime.clone(),
            size: entry.size,
            status: if entry.upload.is_some() {
                ResourceStatus::Pending
            } else {
                ResourceStatus::Ready
            },
            sha256: entry.sha256.clone(),
            url,
            inline,
            created_at: entry.created_at_ms,
        }
    }

    /// Read the full content of a resource
    ///
    /// # Errors
    ///
    /// Same as [`resolve`](Self::resolve), plus `Io` when backing storage
    /// cannot be read.
    pub async fn read(&self, rid: &Rid) -> Result<Vec<u8>, ResourceError> {
        let content = {
            let entry = self
                .inner
                .entries
                .get(rid)
                .ok_or_else(|| ResourceError::NotFound(rid.clone()))?;
            if entry.expired(&self.inner.config, Instant::now()) {
                return Err(ResourceError::ExpiredReference(rid.clone()));
            }
            entry.content.clone()
        };

        match content {
            Content::Memory(data) => Ok(data.as_ref().clone()),
            Content::Spilled(path) | Content::External(path) => tokio::fs::read(&path)
                .await
                .map_err(ResourceError::io(path)),
            Content::Upload(_) => Err(ResourceError::NotCommitted(rid.clone())),
        }
    }

    /// Take an additional reference
    ///
    /// # Errors
    ///
    /// `NotFound` or `ExpiredReference`; an expired entry cannot be revived.
    pub fn retain(&self, rid: &Rid) -> Result<u32, ResourceError> {
        let mut entry = self
            .inner
            .entries
            .get_mut(rid)
            .ok_or_else(|| ResourceError::NotFound(rid.clone()))?;
        if entry.expired(&self.inner.config, Instant::now()) {
            return Err(ResourceError::ExpiredReference(rid.clone()));
        }
        entry.refs += 1;
        entry.unreferenced_since = None;
        Ok(entry.refs)
    }

    /// Drop one reference; returns the remaining count
    ///
    /// Releasing at zero is a no-op.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown or reclaimed ids.
    pub fn release(&self, rid: &Rid) -> Result<u32, ResourceError> {
        let mut entry = self
            .inner
            .entries
            .get_mut(rid)
            .ok_or_else(|| ResourceError::NotFound(rid.clone()))?;
        if entry.refs > 0 {
            entry.refs -= 1;
            if entry.refs == 0 {
                entry.unreferenced_since = Some(Instant::now());
                tracing::trace!(rid = %rid, "Resource unreferenced");
            }
        }
        Ok(entry.refs)
    }

    /// Release every id in `rids`, ignoring ones already reclaimed
    pub fn release_all<'a>(&self, rids: impl IntoIterator<Item = &'a Rid>) -> usize {
        rids.into_iter()
            .filter(|rid| self.release(rid).is_ok())
            .count()
    }

    /// Whether an entry exists for `rid`
    #[must_use]
    pub fn contains(&self, rid: &Rid) -> bool {
        self.inner.entries.contains_key(rid)
    }

    /// Reclaim every expired, unreferenced entry
    pub async fn sweep(&self) -> SweepReport {
        let config = &self.inner.config;
        let now = Instant::now();
        let candidates: Vec<Rid> = self
            .inner
            .entries
            .iter()
            .filter(|e| e.value().expired(config, now))
            .map(|e| e.key().clone())
            .collect();

        let mut report = SweepReport::default();
        for rid in candidates {
            let removed = self
                .inner
                .entries
                .remove_if(&rid, |_, entry| entry.expired(config, now));
            if let Some((rid, entry)) = removed {
                report.absorb(self.reclaim(&rid, entry).await);
            }
        }

        if report.removed > 0 {
            tracing::info!(
                removed = report.removed,
                bytes = report.reclaimed_bytes,
                "Resource sweep reclaimed entries"
            );
        }
        report
    }

    fn within_quota(&self) -> bool {
        let config = &self.inner.config;
        self.inner.total_bytes.load(Ordering::SeqCst) <= config.max_total_bytes
            && self.inner.entries.len() <= config.max_entries
    }

    /// Bring the store back under quota, oldest unreferenced first
    pub async fn enforce_quota(&self) -> SweepReport {
        if self.within_quota() {
            return SweepReport::default();
        }

        let mut report = self.sweep().await;
        if self.within_quota() {
            return report;
        }

        let mut victims: Vec<(u64, Rid)> = self
            .inner
            .entries
            .iter()
            .filter(|e| e.value().refs == 0)
            .map(|e| (e.value().seq, e.key().clone()))
            .collect();
        victims.sort_unstable_by_key(|(seq, _)| *seq);

        for (_, rid) in victims {
            if self.within_quota() {
                break;
            }
            if let Some((rid, entry)) = self.inner.entries.remove_if(&rid, |_, e| e.refs == 0) {
                tracing::debug!(rid = %rid, "Resource evicted for quota");
                report.absorb(self.reclaim(&rid, entry).await);
            }
        }

        if !self.within_quota() {
            tracing::warn!(
                entries = self.inner.entries.len(),
                total_bytes = self.inner.total_bytes.load(Ordering::SeqCst),
                "Resource store over quota with only referenced entries left"
            );
        }
        report
    }

    async fn reclaim(&self, rid: &Rid, entry: Entry) -> SweepReport {
        self.inner
            .total_bytes
            .fetch_sub(entry.size, Ordering::SeqCst);
        match &entry.content {
            Content::Spilled(path) => {
                if let Err(e) = tokio::fs::remove_file(path).await {
                    tracing::warn!(rid = %rid, path = %path.display(), error = %e, "Failed to delete spilled resource");
                }
            }
            Content::Upload(path) => remove_if_present(path).await,
            Content::Memory(_) | Content::External(_) => {}
        }
        SweepReport {
            removed: 1,
            reclaimed_bytes: entry.size,
        }
    }

    /// Live entries in registration order
    #[must_use]
    pub fn list(&self) -> Vec<ResourceSummary> {
        let now = Instant::now();
        let mut rows: Vec<(u64, ResourceSummary)> = self
            .inner
            .entries
            .iter()
            .map(|e| {
                let entry = e.value();
                (
                    entry.seq,
                    ResourceSummary {
                        rid: e.key().clone(),
                        kind: entry.kind,
                        mime: entry.mime.clone(),
                        size: entry.size,
                        refs: entry.refs,
                        owner: entry.owner.clone(),
                        location: entry.content.location(),
                        age_secs: now.saturating_duration_since(entry.created_at).as_secs(),
                    },
                )
            })
            .collect();
        rows.sort_unstable_by_key(|(seq, _)| *seq);
        rows.into_iter().map(|(_, row)| row).collect()
    }

    /// Aggregate figures
    #[must_use]
    pub fn stats(&self) -> ResourceStats {
        let referenced = self
            .inner
            .entries
            .iter()
            .filter(|e| e.value().refs > 0)
            .count();
        ResourceStats {
            entries: self.inner.entries.len(),
            referenced,
            total_bytes: self.inner.total_bytes.load(Ordering::SeqCst),
        }
    }
}

async fn remove_if_present(path: &std::path::Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to delete upload file"),
    }
}
