//! StorageService — versioned object storage backed by SQLite for metadata
//! and local disk for payloads. Payloads live beneath
//! `root/{bucket}/{shard}/{shard}/{key}/v{n}`, one file per committed
//! version, so overwriting a key never touches prior versions' bytes.
//!
//! Every committed write emits exactly one `Created` event through the
//! [`EventSender`]; emission is fire-and-forget and cannot fail the write.

use crate::config::TeardownPolicy;
use crate::events::{EventSender, ObjectEvent, ObjectEventKind};
use crate::models::object::{ObjectVersion, parse_version_id};
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt, pin_mut};
use md5::Context;
use sqlx::SqlitePool;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("empty payload")]
    EmptyPayload,
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error("invalid version id `{0}`")]
    InvalidVersionId(String),
    #[error("object `{key}` not found")]
    ObjectNotFound { key: String },
    #[error("version `{version_id}` of object `{key}` not found")]
    VersionNotFound { key: String, version_id: String },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Immutable storage configuration, fixed at construction time.
#[derive(Clone, Debug)]
pub struct StorageConfig {
    /// Logical bucket all objects belong to.
    pub bucket: String,
    /// Base directory on disk where payloads are stored.
    pub root: PathBuf,
    /// When disabled, a successful write removes the key's prior versions.
    pub versioning_enabled: bool,
    /// What `teardown` does with stored data.
    pub teardown_policy: TeardownPolicy,
}

/// StorageService provides the store side of the pipeline:
/// - Put an object (streams bytes to disk, inserts a new version row,
///   emits a creation event)
/// - Get latest version / specific version (metadata + open file handle)
/// - List versions of a key
///
/// Concurrent writes to the same key are serialized by SQLite's writer
/// lock; each one commits its own version and the latest pointer is simply
/// the highest version number.
#[derive(Clone)]
pub struct StorageService {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,
    config: StorageConfig,
    events: EventSender,
}

const MAX_OBJECT_KEY_LEN: usize = 1024;

const SELECT_COLUMNS: &str =
    "id, bucket, key, version_no, size_bytes, etag, content_type, created_at";

impl StorageService {
    pub fn new(db: Arc<SqlitePool>, config: StorageConfig, events: EventSender) -> Self {
        Self { db, config, events }
    }

    /// Base directory payloads are stored under.
    pub fn root(&self) -> &Path {
        &self.config.root
    }

    /// Basic key validation to avoid trivial path traversal vectors.
    ///
    /// Rejects keys that begin with `/` or contain `..`, control characters,
    /// backslashes, or NUL.
    fn ensure_key_safe(&self, key: &str) -> StorageResult<()> {
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(StorageError::InvalidObjectKey);
        }
        if key.starts_with('/') || key.contains("..") {
            return Err(StorageError::InvalidObjectKey);
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(StorageError::InvalidObjectKey);
        }
        Ok(())
    }

    /// Generate two-level shard identifiers for an object key.
    ///
    /// Uses MD5(bucket/key) and returns the first two bytes as lowercase
    /// hexadecimal strings (00–ff). Reduces file count per directory.
    fn object_shards(bucket: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// Directory holding all version payloads for a key:
    /// `root/bucket/{shard}/{shard}/{key}`.
    fn object_dir(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(&self.config.bucket, key);
        let mut path = self.config.root.clone();
        path.push(&self.config.bucket);
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    /// Payload file for one specific version.
    fn version_path(&self, key: &str, version_no: i64) -> PathBuf {
        self.object_dir(key).join(format!("v{}", version_no))
    }

    /// Stream-upload a new object version.
    ///
    /// - Writes bytes incrementally to a temporary file, computing MD5 and
    ///   size along the way.
    /// - Rejects zero-length payloads before any metadata is written.
    /// - Assigns the next per-key version number and renames the temp file
    ///   into place inside one metadata transaction, so readers see either
    ///   the complete previous version or the complete new one.
    /// - Emits one `Created` event after commit.
    pub async fn put<S>(
        &self,
        key: &str,
        content_type: Option<String>,
        stream: S,
    ) -> StorageResult<ObjectVersion>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        self.ensure_key_safe(key)?;

        let dir = self.object_dir(key);
        fs::create_dir_all(&dir).await?;
        let tmp_path = dir.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: i64 = 0;
        let mut digest = Context::new();
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(StorageError::Io(err));
                }
            };
            size_bytes += chunk.len() as i64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
        }
        if size_bytes == 0 {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::EmptyPayload);
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }

        let etag = format!("{:x}", digest.compute());
        let created_at = Utc::now();

        // The INSERT…SELECT assigns max(version_no)+1 atomically under
        // SQLite's writer lock; the rename happens before commit so a
        // failed rename rolls the row back.
        let mut tx = self.db.begin().await?;
        let insert_result = sqlx::query_as::<_, ObjectVersion>(
            r#"
            INSERT INTO object_versions (
                id, bucket, key, version_no, size_bytes, etag, content_type, created_at
            )
            SELECT ?, ?, ?, COALESCE(MAX(version_no), 0) + 1, ?, ?, ?, ?
            FROM object_versions WHERE bucket = ? AND key = ?
            RETURNING id, bucket, key, version_no, size_bytes, etag, content_type, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&self.config.bucket)
        .bind(key)
        .bind(size_bytes)
        .bind(&etag)
        .bind(content_type)
        .bind(created_at)
        .bind(&self.config.bucket)
        .bind(key)
        .fetch_one(&mut *tx)
        .await;

        let object = match insert_result {
            Ok(object) => object,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Sqlx(err));
            }
        };

        let final_path = self.version_path(key, object.version_no);
        if let Err(err) = fs::rename(&tmp_path, &final_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        if let Err(err) = tx.commit().await {
            let _ = fs::remove_file(&final_path).await;
            return Err(StorageError::Sqlx(err));
        }

        debug!(
            key = %object.key,
            version = %object.version_id(),
            size_bytes,
            "object version committed"
        );

        if !self.config.versioning_enabled {
            self.prune_prior_versions(key, object.version_no).await;
        }

        self.events.emit(ObjectEvent {
            bucket: self.config.bucket.clone(),
            key: object.key.clone(),
            version_id: object.version_id(),
            kind: ObjectEventKind::Created,
            event_time: created_at,
        });

        Ok(object)
    }

    /// Fetch the latest version of a key for reading.
    ///
    /// Returns metadata and an opened File handle ready for streaming out.
    pub async fn get_latest(&self, key: &str) -> StorageResult<(ObjectVersion, File)> {
        self.ensure_key_safe(key)?;
        let object = sqlx::query_as::<_, ObjectVersion>(&format!(
            "SELECT {SELECT_COLUMNS} FROM object_versions
             WHERE bucket = ? AND key = ?
             ORDER BY version_no DESC LIMIT 1"
        ))
        .bind(&self.config.bucket)
        .bind(key)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::ObjectNotFound {
                key: key.to_string(),
            },
            other => StorageError::Sqlx(other),
        })?;

        let file = self.open_payload(&object).await?;
        Ok((object, file))
    }

    /// Fetch one specific version of a key for reading.
    pub async fn get_version(
        &self,
        key: &str,
        version_id: &str,
    ) -> StorageResult<(ObjectVersion, File)> {
        self.ensure_key_safe(key)?;
        let version_no = parse_version_id(version_id)
            .ok_or_else(|| StorageError::InvalidVersionId(version_id.to_string()))?;

        let object = sqlx::query_as::<_, ObjectVersion>(&format!(
            "SELECT {SELECT_COLUMNS} FROM object_versions
             WHERE bucket = ? AND key = ? AND version_no = ?"
        ))
        .bind(&self.config.bucket)
        .bind(key)
        .bind(version_no)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::VersionNotFound {
                key: key.to_string(),
                version_id: version_id.to_string(),
            },
            other => StorageError::Sqlx(other),
        })?;

        let file = self.open_payload(&object).await?;
        Ok((object, file))
    }

    /// List all versions of a key, oldest first.
    pub async fn list_versions(&self, key: &str) -> StorageResult<Vec<ObjectVersion>> {
        self.ensure_key_safe(key)?;
        let versions = sqlx::query_as::<_, ObjectVersion>(&format!(
            "SELECT {SELECT_COLUMNS} FROM object_versions
             WHERE bucket = ? AND key = ?
             ORDER BY version_no ASC"
        ))
        .bind(&self.config.bucket)
        .bind(key)
        .fetch_all(&*self.db)
        .await?;

        if versions.is_empty() {
            return Err(StorageError::ObjectNotFound {
                key: key.to_string(),
            });
        }
        Ok(versions)
    }

    async fn open_payload(&self, object: &ObjectVersion) -> StorageResult<File> {
        let path = self.version_path(&object.key, object.version_no);
        File::open(&path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StorageError::VersionNotFound {
                    key: object.key.clone(),
                    version_id: object.version_id(),
                }
            } else {
                StorageError::Io(err)
            }
        })
    }

    /// Remove all versions of a key older than `keep_no`.
    ///
    /// Used only when versioning is disabled. Best-effort on the
    /// filesystem side; emits one `Deleted` event per removed version so
    /// downstream observers can tell pruning apart from creation.
    async fn prune_prior_versions(&self, key: &str, keep_no: i64) {
        let stale = sqlx::query_as::<_, ObjectVersion>(&format!(
            "SELECT {SELECT_COLUMNS} FROM object_versions
             WHERE bucket = ? AND key = ? AND version_no < ?"
        ))
        .bind(&self.config.bucket)
        .bind(key)
        .bind(keep_no)
        .fetch_all(&*self.db)
        .await;

        let stale = match stale {
            Ok(rows) => rows,
            Err(err) => {
                debug!(key, "failed to list stale versions for pruning: {}", err);
                return;
            }
        };

        for version in stale {
            let delete = sqlx::query(
                "DELETE FROM object_versions WHERE bucket = ? AND key = ? AND version_no = ?",
            )
            .bind(&self.config.bucket)
            .bind(key)
            .bind(version.version_no)
            .execute(&*self.db)
            .await;
            if let Err(err) = delete {
                debug!(key, version = version.version_no, "failed to prune version row: {}", err);
                continue;
            }

            let path = self.version_path(key, version.version_no);
            match fs::remove_file(&path).await {
                Ok(_) => debug!("removed pruned payload {}", path.display()),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => debug!("failed to remove pruned payload {}: {}", path.display(), err),
            }

            self.events.emit(ObjectEvent {
                bucket: self.config.bucket.clone(),
                key: key.to_string(),
                version_id: version.version_id(),
                kind: ObjectEventKind::Deleted,
                event_time: Utc::now(),
            });
        }
    }

    /// Apply the configured teardown policy.
    ///
    /// `Destroy` drops all object metadata and deletes the bucket's payload
    /// tree; `Retain` leaves everything in place.
    pub async fn teardown(&self) -> StorageResult<u64> {
        match self.config.teardown_policy {
            TeardownPolicy::Retain => {
                tracing::info!(bucket = %self.config.bucket, "teardown policy is retain, keeping all objects");
                Ok(0)
            }
            TeardownPolicy::Destroy => {
                let result = sqlx::query("DELETE FROM object_versions WHERE bucket = ?")
                    .bind(&self.config.bucket)
                    .execute(&*self.db)
                    .await?;

                let bucket_root = self.config.root.join(&self.config.bucket);
                if let Err(err) = fs::remove_dir_all(&bucket_root).await {
                    if err.kind() != ErrorKind::NotFound {
                        return Err(StorageError::Io(err));
                    }
                }
                tracing::info!(
                    bucket = %self.config.bucket,
                    versions = result.rows_affected(),
                    "teardown destroyed stored objects"
                );
                Ok(result.rows_affected())
            }
        }
    }
}

/// Write-only handle over the store, handed to the upload gateway.
///
/// The gateway can commit new versions but cannot read, list, or delete
/// through this handle.
#[derive(Clone)]
pub struct UploadStore(StorageService);

impl UploadStore {
    pub fn new(service: StorageService) -> Self {
        Self(service)
    }

    pub async fn put<S>(
        &self,
        key: &str,
        content_type: Option<String>,
        stream: S,
    ) -> StorageResult<ObjectVersion>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        self.0.put(key, content_type, stream).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn service(
        versioning: bool,
    ) -> (StorageService, UnboundedReceiver<ObjectEvent>, TempDir) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let db = Arc::new(pool);
        crate::run_migrations(&db).await.unwrap();

        let dir = TempDir::new().unwrap();
        let (events, rx) = EventSender::channel();
        let config = StorageConfig {
            bucket: "images".into(),
            root: dir.path().to_path_buf(),
            versioning_enabled: versioning,
            teardown_policy: TeardownPolicy::Destroy,
        };
        (StorageService::new(db, config, events), rx, dir)
    }

    fn bytes_stream(
        data: &'static [u8],
    ) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
        futures::stream::iter(vec![Ok(Bytes::from_static(data))])
    }

    async fn read_all(mut file: File) -> Vec<u8> {
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn upload_round_trip() {
        let (service, mut events, _dir) = service(true).await;

        let payload: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10];
        let object = service
            .put("img.png", Some("image/png".into()), bytes_stream(payload))
            .await
            .unwrap();
        assert_eq!(object.version_id(), "v1");
        assert_eq!(object.size_bytes, payload.len() as i64);
        assert_eq!(object.etag, format!("{:x}", md5::compute(payload)));

        let (meta, file) = service.get_latest("img.png").await.unwrap();
        assert_eq!(meta.version_no, 1);
        assert_eq!(read_all(file).await, payload);

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, ObjectEventKind::Created);
        assert_eq!(event.key, "img.png");
        assert_eq!(event.version_id, "v1");
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn overwrite_creates_new_version_and_keeps_old() {
        let (service, _events, _dir) = service(true).await;

        service
            .put("a/b.jpg", None, bytes_stream(b"first"))
            .await
            .unwrap();
        let second = service
            .put("a/b.jpg", None, bytes_stream(b"second"))
            .await
            .unwrap();
        assert_eq!(second.version_id(), "v2");

        let (_, v1) = service.get_version("a/b.jpg", "v1").await.unwrap();
        let (_, v2) = service.get_version("a/b.jpg", "v2").await.unwrap();
        assert_eq!(read_all(v1).await, b"first");
        assert_eq!(read_all(v2).await, b"second");

        let (latest, _) = service.get_latest("a/b.jpg").await.unwrap();
        assert_eq!(latest.version_no, 2);
        assert_eq!(service.list_versions("a/b.jpg").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn concurrent_puts_to_same_key_commit_independent_versions() {
        let (service, _events, _dir) = service(true).await;

        let (a, b) = tokio::join!(
            service.put("race.png", None, bytes_stream(b"aaaaaaaa")),
            service.put("race.png", None, bytes_stream(b"bbbbbbbb")),
        );
        let a = a.unwrap();
        let b = b.unwrap();
        assert_ne!(a.version_no, b.version_no);

        let (_, fa) = service
            .get_version("race.png", &a.version_id())
            .await
            .unwrap();
        let (_, fb) = service
            .get_version("race.png", &b.version_id())
            .await
            .unwrap();
        assert_eq!(read_all(fa).await, b"aaaaaaaa");
        assert_eq!(read_all(fb).await, b"bbbbbbbb");
    }

    #[tokio::test]
    async fn empty_payload_rejected_without_side_effects() {
        let (service, mut events, _dir) = service(true).await;

        let err = service
            .put("empty.png", None, bytes_stream(b""))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::EmptyPayload));

        assert!(matches!(
            service.get_latest("empty.png").await.unwrap_err(),
            StorageError::ObjectNotFound { .. }
        ));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsafe_keys_rejected() {
        let (service, _events, _dir) = service(true).await;
        for key in ["", "/abs", "a/../b", "nul\0byte"] {
            let err = service.put(key, None, bytes_stream(b"x")).await.unwrap_err();
            assert!(matches!(err, StorageError::InvalidObjectKey), "key {:?}", key);
        }
    }

    #[tokio::test]
    async fn versioning_disabled_keeps_single_version() {
        let (service, mut events, _dir) = service(false).await;

        service.put("one.png", None, bytes_stream(b"old")).await.unwrap();
        service.put("one.png", None, bytes_stream(b"new")).await.unwrap();

        let versions = service.list_versions("one.png").await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].version_no, 2);
        assert!(matches!(
            service.get_version("one.png", "v1").await.unwrap_err(),
            StorageError::VersionNotFound { .. }
        ));

        // created v1, created v2, deleted v1
        let kinds: Vec<ObjectEventKind> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                ObjectEventKind::Created,
                ObjectEventKind::Deleted,
                ObjectEventKind::Created,
            ]
        );
    }

    #[tokio::test]
    async fn teardown_destroy_removes_everything() {
        let (service, _events, _dir) = service(true).await;

        service.put("gone.png", None, bytes_stream(b"bytes")).await.unwrap();
        let removed = service.teardown().await.unwrap();
        assert_eq!(removed, 1);
        assert!(matches!(
            service.get_latest("gone.png").await.unwrap_err(),
            StorageError::ObjectNotFound { .. }
        ));
        assert!(!service.root().join("images").exists());
    }
}
