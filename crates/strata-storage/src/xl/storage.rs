use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use strata_common::error::{Result, StrataError};
use tokio::fs;
use tokio::io::AsyncSeekExt;

use crate::datatypes::{FileInfo, VolInfo};
use crate::naming::{is_valid_path, is_valid_volname};
use crate::traits::{ReadStream, StorageAPI, WriteSink};

/// A disk backed by a local directory: one sub-directory per volume.
#[derive(Debug, Clone)]
pub struct XlStorage {
    root_dir: PathBuf,
}

impl XlStorage {
    pub async fn new(root_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root_dir).await?;
        Ok(Self { root_dir })
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn volume_dir(&self, volume: &str) -> Result<PathBuf> {
        if !is_valid_volname(volume) {
            return Err(StrataError::InvalidArgument(format!(
                "invalid volume name: {volume}"
            )));
        }
        Ok(self.root_dir.join(volume))
    }

    async fn existing_volume_dir(&self, volume: &str) -> Result<PathBuf> {
        let volume_dir = self.volume_dir(volume)?;
        match fs::metadata(&volume_dir).await {
            Ok(metadata) if metadata.is_dir() => Ok(volume_dir),
            Ok(_) => Err(StrataError::VolumeNotFound(volume.to_string())),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(StrataError::VolumeNotFound(volume.to_string()))
            }
            Err(err) => Err(StrataError::Io(err)),
        }
    }

    /// Removes now-empty directories between `path` and the volume root.
    async fn prune_empty_parents(volume_dir: &Path, path: &Path) {
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir == volume_dir || !dir.starts_with(volume_dir) {
                break;
            }
            if fs::remove_dir(dir).await.is_err() {
                break;
            }
            current = dir.parent();
        }
    }
}

#[async_trait]
impl StorageAPI for XlStorage {
    fn endpoint(&self) -> String {
        self.root_dir.display().to_string()
    }

    async fn make_vol(&self, volume: &str) -> Result<()> {
        let volume_dir = self.volume_dir(volume)?;
        if is_existing_directory(&volume_dir).await? {
            return Err(StrataError::VolumeExists(volume.to_string()));
        }
        fs::create_dir_all(&volume_dir).await?;
        Ok(())
    }

    async fn list_vols(&self) -> Result<Vec<VolInfo>> {
        let mut entries = fs::read_dir(&self.root_dir).await?;
        let mut volumes = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_dir() {
                continue;
            }
            volumes.push(VolInfo {
                name: entry.file_name().to_string_lossy().to_string(),
                created: created_time(&metadata),
            });
        }

        volumes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(volumes)
    }

    async fn stat_vol(&self, volume: &str) -> Result<VolInfo> {
        let volume_dir = self.existing_volume_dir(volume).await?;
        let metadata = fs::metadata(&volume_dir).await?;
        Ok(VolInfo {
            name: volume.to_string(),
            created: created_time(&metadata),
        })
    }

    async fn delete_vol(&self, volume: &str) -> Result<()> {
        let volume_dir = self.volume_dir(volume)?;
        match fs::remove_dir(&volume_dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(StrataError::VolumeNotFound(volume.to_string()))
            }
            Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => {
                Err(StrataError::VolumeNotEmpty(volume.to_string()))
            }
            Err(err) => Err(StrataError::Io(err)),
        }
    }

    async fn list_dir(&self, volume: &str, dir_path: &str) -> Result<Vec<String>> {
        let volume_dir = self.existing_volume_dir(volume).await?;
        let dir = if dir_path.is_empty() {
            volume_dir
        } else {
            file_path(&volume_dir, dir_path)?
        };

        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|err| map_file_error(dir_path, err))?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                names.push(format!("{name}/"));
            } else if file_type.is_file() {
                names.push(name);
            }
        }

        names.sort();
        Ok(names)
    }

    async fn read_file(&self, volume: &str, path: &str, offset: u64) -> Result<ReadStream> {
        let volume_dir = self.existing_volume_dir(volume).await?;
        let target = file_path(&volume_dir, path)?;
        let metadata = fs::metadata(&target)
            .await
            .map_err(|err| map_file_error(path, err))?;
        if !metadata.is_file() {
            return Err(StrataError::IsNotRegular(path.to_string()));
        }

        let mut file = fs::File::open(&target)
            .await
            .map_err(|err| map_file_error(path, err))?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).await?;
        }
        Ok(Box::new(file))
    }

    async fn create_file(&self, volume: &str, path: &str) -> Result<WriteSink> {
        let volume_dir = self.existing_volume_dir(volume).await?;
        let target = file_path(&volume_dir, path)?;
        if is_existing_directory(&target).await? {
            return Err(StrataError::IsNotRegular(path.to_string()));
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| map_file_error(path, err))?;
        }

        let file = fs::File::create(&target)
            .await
            .map_err(|err| map_file_error(path, err))?;
        Ok(Box::new(file))
    }

    async fn read_all(&self, volume: &str, path: &str) -> Result<Vec<u8>> {
        let volume_dir = self.existing_volume_dir(volume).await?;
        let target = file_path(&volume_dir, path)?;
        fs::read(&target)
            .await
            .map_err(|err| map_file_error(path, err))
    }

    async fn stat_file(&self, volume: &str, path: &str) -> Result<FileInfo> {
        let volume_dir = self.existing_volume_dir(volume).await?;
        let target = file_path(&volume_dir, path)?;
        let metadata = fs::metadata(&target)
            .await
            .map_err(|err| map_file_error(path, err))?;
        if metadata.is_dir() {
            return Err(StrataError::FileNotFound(path.to_string()));
        }

        let size = i64::try_from(metadata.len())
            .map_err(|_| StrataError::InternalError(format!("file too large: {path}")))?;
        let mod_time = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        Ok(FileInfo {
            volume: volume.to_string(),
            name: path.to_string(),
            size,
            mod_time,
        })
    }

    async fn delete_file(&self, volume: &str, path: &str) -> Result<()> {
        let volume_dir = self.existing_volume_dir(volume).await?;
        let target = file_path(&volume_dir, path)?;
        let metadata = fs::symlink_metadata(&target)
            .await
            .map_err(|err| map_file_error(path, err))?;

        let removed = if metadata.is_dir() {
            fs::remove_dir_all(&target).await
        } else {
            fs::remove_file(&target).await
        };
        removed.map_err(|err| map_file_error(path, err))?;

        Self::prune_empty_parents(&volume_dir, &target).await;
        Ok(())
    }

    async fn rename_file(
        &self,
        src_volume: &str,
        src_path: &str,
        dst_volume: &str,
        dst_path: &str,
    ) -> Result<()> {
        let src_volume_dir = self.existing_volume_dir(src_volume).await?;
        let dst_volume_dir = self.existing_volume_dir(dst_volume).await?;

        let src_is_dir = src_path.ends_with('/');
        if src_is_dir != dst_path.ends_with('/') {
            return Err(StrataError::FileAccessDenied(dst_path.to_string()));
        }

        let src = file_path(&src_volume_dir, src_path)?;
        let dst = file_path(&dst_volume_dir, dst_path)?;

        // Directory renames never merge into an existing destination.
        if src_is_dir {
            match fs::metadata(&dst).await {
                Ok(_) => return Err(StrataError::FileAccessDenied(dst_path.to_string())),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(map_file_error(dst_path, err)),
            }
        }

        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| map_file_error(dst_path, err))?;
        }
        fs::rename(&src, &dst)
            .await
            .map_err(|err| map_file_error(src_path, err))?;

        Self::prune_empty_parents(&src_volume_dir, &src).await;
        Ok(())
    }
}

fn file_path(volume_dir: &Path, path: &str) -> Result<PathBuf> {
    if !is_valid_path(path) {
        return Err(StrataError::InvalidArgument(format!("invalid path: {path}")));
    }
    Ok(volume_dir.join(path.trim_end_matches('/')))
}

async fn is_existing_directory(path: &Path) -> Result<bool> {
    match fs::metadata(path).await {
        Ok(metadata) => Ok(metadata.is_dir()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(StrataError::Io(err)),
    }
}

fn map_file_error(path: &str, err: std::io::Error) -> StrataError {
    match err.kind() {
        ErrorKind::NotFound | ErrorKind::NotADirectory => StrataError::FileNotFound(path.to_string()),
        ErrorKind::PermissionDenied | ErrorKind::AlreadyExists => {
            StrataError::FileAccessDenied(path.to_string())
        }
        ErrorKind::IsADirectory => StrataError::IsNotRegular(path.to_string()),
        _ => StrataError::Io(err),
    }
}

fn created_time(metadata: &std::fs::Metadata) -> DateTime<Utc> {
    metadata
        .created()
        .or_else(|_| metadata.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    async fn disk_with_volume() -> (tempfile::TempDir, XlStorage) {
        let temp_dir = tempfile::tempdir().unwrap();
        let disk = XlStorage::new(temp_dir.path().join("disk1")).await.unwrap();
        disk.make_vol("bucket").await.unwrap();
        (temp_dir, disk)
    }

    async fn write_file(disk: &XlStorage, volume: &str, path: &str, data: &[u8]) {
        let mut sink = disk.create_file(volume, path).await.unwrap();
        sink.write_all(data).await.unwrap();
        sink.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn read_file_honours_offset() {
        let (_temp_dir, disk) = disk_with_volume().await;
        write_file(&disk, "bucket", "dir/object", b"hello world").await;

        let mut reader = disk.read_file("bucket", "dir/object", 6).await.unwrap();
        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "world");

        let info = disk.stat_file("bucket", "dir/object").await.unwrap();
        assert_eq!(info.size, 11);
    }

    #[tokio::test]
    async fn missing_volume_and_file_use_disk_errors() {
        let (_temp_dir, disk) = disk_with_volume().await;

        assert!(matches!(
            disk.read_all("nobucket", "a").await,
            Err(StrataError::VolumeNotFound(_))
        ));
        assert!(matches!(
            disk.read_all("bucket", "missing").await,
            Err(StrataError::FileNotFound(_))
        ));
        assert!(matches!(
            disk.make_vol("bucket").await,
            Err(StrataError::VolumeExists(_))
        ));
        assert!(matches!(
            disk.stat_file("bucket", "../escape").await,
            Err(StrataError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn list_dir_marks_directories() {
        let (_temp_dir, disk) = disk_with_volume().await;
        write_file(&disk, "bucket", "a/b/file", b"x").await;
        write_file(&disk, "bucket", "a/c", b"y").await;

        let entries = disk.list_dir("bucket", "a").await.unwrap();
        assert_eq!(entries, vec!["b/".to_string(), "c".to_string()]);
        assert_eq!(disk.list_dir("bucket", "").await.unwrap(), vec!["a/".to_string()]);
    }

    #[tokio::test]
    async fn directory_rename_refuses_existing_destination() {
        let (_temp_dir, disk) = disk_with_volume().await;
        write_file(&disk, "bucket", "src/part", b"1").await;
        write_file(&disk, "bucket", "dst/part", b"2").await;

        assert!(matches!(
            disk.rename_file("bucket", "src/", "bucket", "dst/").await,
            Err(StrataError::FileAccessDenied(_))
        ));
        assert!(matches!(
            disk.rename_file("bucket", "src/", "bucket", "dst").await,
            Err(StrataError::FileAccessDenied(_))
        ));

        disk.rename_file("bucket", "src/", "bucket", "moved/deep/").await.unwrap();
        assert_eq!(disk.read_all("bucket", "moved/deep/part").await.unwrap(), b"1");
        assert!(matches!(
            disk.list_dir("bucket", "src").await,
            Err(StrataError::FileNotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_prunes_empty_parents() {
        let (_temp_dir, disk) = disk_with_volume().await;
        write_file(&disk, "bucket", "x/y/z/file", b"data").await;
        write_file(&disk, "bucket", "x/keep", b"data").await;

        disk.delete_file("bucket", "x/y/z/file").await.unwrap();
        assert_eq!(disk.list_dir("bucket", "x").await.unwrap(), vec!["keep".to_string()]);

        disk.delete_file("bucket", "x/").await.unwrap();
        assert!(disk.list_dir("bucket", "").await.unwrap().is_empty());
        assert!(matches!(
            disk.delete_file("bucket", "x").await,
            Err(StrataError::FileNotFound(_))
        ));
    }
}
