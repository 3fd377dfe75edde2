//! Local-disk object backend.
//!
//! Finished objects are sharded beneath
//! `base_path/objects/{shard}/{shard}/{key}`; multipart uploads stage one
//! file per part under `base_path/multipart/{upload_id}/` until
//! `finish_multipart` stitches them together.

use super::backend::{BackendError, BackendResult, ObjectBackend, ObjectRef, UploadTarget};
use async_trait::async_trait;
use bytes::Bytes;
use std::{
    io::{self, ErrorKind, SeekFrom},
    ops::Range,
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use tracing::debug;
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const TOKEN_FILE: &str = ".token";
const NAME_FILE: &str = ".name";

#[derive(Clone, Debug)]
pub struct FilesystemBackend {
    /// Base directory on disk where object payloads are stored.
    base_path: PathBuf,
}

impl FilesystemBackend {
    pub async fn new(base_path: impl Into<PathBuf>) -> BackendResult<Self> {
        let backend = Self {
            base_path: base_path.into(),
        };
        fs::create_dir_all(backend.objects_root()).await?;
        fs::create_dir_all(backend.multipart_root()).await?;
        Ok(backend)
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Rejects keys that could escape the object root.
    fn ensure_key_safe(key: &str) -> BackendResult<()> {
        let invalid = key.is_empty()
            || key.len() > MAX_OBJECT_KEY_LEN
            || key.contains('/')
            || key.contains("..")
            || key
                .bytes()
                .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0');
        if invalid {
            return Err(BackendError::InvalidTarget(format!(
                "unsafe object key `{}`",
                key.escape_default()
            )));
        }
        Ok(())
    }

    fn objects_root(&self) -> PathBuf {
        self.base_path.join("objects")
    }

    fn multipart_root(&self) -> PathBuf {
        self.base_path.join("multipart")
    }

    /// Two-level shard identifiers from MD5(key), as lowercase hex.
    fn object_shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(key);
        let mut path = self.objects_root();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    fn part_path(staging: &Path, index: usize) -> PathBuf {
        staging.join(format!("part-{:05}", index))
    }

    /// Resolve and authorize the staging directory of a multipart target.
    async fn staging_dir(&self, target: &UploadTarget) -> BackendResult<PathBuf> {
        if !target.multipart {
            return Err(BackendError::InvalidTarget(
                "single-shot target used for a multipart call".into(),
            ));
        }
        Self::ensure_key_safe(&target.upload_value)?;
        let staging = self.multipart_root().join(&target.upload_value);
        let token = match fs::read_to_string(staging.join(TOKEN_FILE)).await {
            Ok(token) => token,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(BackendError::NotFound(target.upload_value.clone()));
            }
            Err(err) => return Err(err.into()),
        };
        if token != target.auth_token {
            return Err(BackendError::InvalidTarget(
                "auth token does not match upload".into(),
            ));
        }
        Ok(staging)
    }

    /// Recursively remove empty directories up to (not including) `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

/// Write `data` to a temp file beside `path`, fsync, then rename into place.
async fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::other("object path missing parent directory"))?;
    fs::create_dir_all(parent).await?;
    let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

    let result = async {
        let mut file = File::create(&tmp_path).await?;
        file.write_all(data).await?;
        file.flush().await?;
        file.sync_all().await?;
        rename_replacing(&tmp_path, path).await
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path).await;
    }
    result
}

async fn rename_replacing(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to).await {
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            fs::remove_file(to).await?;
            fs::rename(from, to).await
        }
        other => other,
    }
}

#[async_trait]
impl ObjectBackend for FilesystemBackend {
    async fn init_upload(&self) -> BackendResult<UploadTarget> {
        Ok(UploadTarget {
            upload_url: format!("file://{}", self.objects_root().display()),
            auth_token: Uuid::new_v4().simple().to_string(),
            upload_value: "local".into(),
            multipart: false,
        })
    }

    async fn init_multipart(&self, name: &str) -> BackendResult<UploadTarget> {
        Self::ensure_key_safe(name)?;
        let upload_id = Uuid::new_v4().simple().to_string();
        let token = Uuid::new_v4().simple().to_string();
        let staging = self.multipart_root().join(&upload_id);

        fs::create_dir_all(&staging).await?;
        write_atomic(&staging.join(NAME_FILE), name.as_bytes()).await?;
        write_atomic(&staging.join(TOKEN_FILE), token.as_bytes()).await?;

        debug!(%upload_id, name, "started multipart upload");
        Ok(UploadTarget {
            upload_url: format!("file://{}", staging.display()),
            auth_token: token,
            upload_value: upload_id,
            multipart: true,
        })
    }

    async fn upload_single(
        &self,
        target: &UploadTarget,
        name: &str,
        data: Bytes,
    ) -> BackendResult<ObjectRef> {
        if target.multipart {
            return Err(BackendError::InvalidTarget(
                "multipart target used for a single-shot upload".into(),
            ));
        }
        Self::ensure_key_safe(name)?;
        write_atomic(&self.object_path(name), &data).await?;
        Ok(ObjectRef::new(name))
    }

    async fn upload_part(
        &self,
        target: &UploadTarget,
        index: u32,
        data: Bytes,
    ) -> BackendResult<String> {
        let staging = self.staging_dir(target).await?;
        write_atomic(&Self::part_path(&staging, index as usize), &data).await?;
        Ok(format!("{:x}", md5::compute(&data)))
    }

    async fn finish_multipart(
        &self,
        target: &UploadTarget,
        part_ids: &[String],
    ) -> BackendResult<ObjectRef> {
        let staging = self.staging_dir(target).await?;
        let name = fs::read_to_string(staging.join(NAME_FILE)).await?;
        Self::ensure_key_safe(&name)?;

        let final_path = self.object_path(&name);
        let parent = final_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| io::Error::other("object path missing parent directory"))?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let stitched = async {
            let mut out = File::create(&tmp_path).await?;
            for (index, expected) in part_ids.iter().enumerate() {
                let part = match fs::read(Self::part_path(&staging, index)).await {
                    Ok(part) => part,
                    Err(err) if err.kind() == ErrorKind::NotFound => {
                        return Err(BackendError::InvalidTarget(format!(
                            "part {} was never uploaded",
                            index
                        )));
                    }
                    Err(err) => return Err(err.into()),
                };
                let actual = format!("{:x}", md5::compute(&part));
                if &actual != expected {
                    return Err(BackendError::InvalidTarget(format!(
                        "part {} checksum {} does not match {}",
                        index, actual, expected
                    )));
                }
                out.write_all(&part).await?;
            }
            out.flush().await?;
            out.sync_all().await?;
            rename_replacing(&tmp_path, &final_path).await?;
            Ok(())
        }
        .await;

        if let Err(err) = stitched {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        if let Err(err) = fs::remove_dir_all(&staging).await {
            debug!("failed to remove staging {}: {}", staging.display(), err);
        }
        Ok(ObjectRef::new(name))
    }

    async fn abort_multipart(&self, target: &UploadTarget) -> BackendResult<()> {
        let staging = match self.staging_dir(target).await {
            Ok(staging) => staging,
            Err(BackendError::NotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
        };
        match fs::remove_dir_all(&staging).await {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn read_range(&self, object: &ObjectRef, range: Range<u64>) -> BackendResult<Bytes> {
        Self::ensure_key_safe(&object.key)?;
        let mut file = File::open(self.object_path(&object.key))
            .await
            .map_err(|err| {
                if err.kind() == ErrorKind::NotFound {
                    BackendError::NotFound(object.key.clone())
                } else {
                    BackendError::Io(err)
                }
            })?;

        let len = file.metadata().await?.len();
        if range.start > range.end || range.end > len {
            return Err(BackendError::InvalidRange {
                start: range.start,
                end: range.end,
                len,
            });
        }

        file.seek(SeekFrom::Start(range.start)).await?;
        let mut buf = vec![0u8; (range.end - range.start) as usize];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn delete(&self, object: &ObjectRef) -> BackendResult<()> {
        Self::ensure_key_safe(&object.key)?;
        let file_path = self.object_path(&object.key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(err.into()),
        }

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent, &self.objects_root()).await;
        }
        Ok(())
    }

    async fn probe(&self) -> BackendResult<()> {
        let tmp_path = self
            .base_path
            .join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&tmp_path, b"readyz").await?;
        let read = fs::read(&tmp_path).await;
        let _ = fs::remove_file(&tmp_path).await;
        if read? != b"readyz" {
            return Err(BackendError::Unavailable("file content mismatch".into()));
        }
        Ok(())
    }
}
