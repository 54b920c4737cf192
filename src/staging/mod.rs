//! Local-filesystem staging tier.
//!
//! Files written through staging are acknowledged once the bytes hit the
//! local store; the writeback worker later runs the normal write pipeline
//! against the backend. Pinned entries are protected from autocleaning
//! until their writeback completes.

use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Context, Error};
use log::{debug, info, warn};
use url::Url;
use walkdir::WalkDir;

use ecs_api_types::FileKey;

pub struct Staging {
    root: PathBuf,
}

impl Staging {
    /// Open the staging area named by a `file://` url, creating the
    /// directory tree as needed.
    pub fn open(url: &str) -> Result<Self, Error> {
        let parsed = Url::parse(url).with_context(|| format!("invalid staging url '{url}'"))?;
        if parsed.scheme() != "file" {
            bail!("unsupported staging url scheme '{}'", parsed.scheme());
        }
        let root = parsed
            .to_file_path()
            .map_err(|_| format_err!("staging url '{url}' has no usable path"))?;
        std::fs::create_dir_all(&root)
            .with_context(|| format!("unable to create staging directory {root:?}"))?;
        info!("staging enabled at {root:?}");
        Ok(Self { root })
    }

    fn file_path(&self, key: &FileKey) -> Result<PathBuf, Error> {
        // reject names that would escape the staging root
        if Path::new(&key.name)
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir | std::path::Component::RootDir))
        {
            bail!("invalid staged file name '{}'", key.name);
        }
        let mut path = self.root.join(key.namespace_id.to_string());
        path.push(&key.name);
        Ok(path)
    }

    fn pin_path(path: &Path) -> PathBuf {
        let mut pin = path.as_os_str().to_owned();
        pin.push(".pin");
        PathBuf::from(pin)
    }

    /// Write (a range of) a staged file, extending it as needed.
    pub fn write_file(&self, key: &FileKey, offset: u64, data: &[u8]) -> Result<(), Error> {
        use std::io::{Seek, SeekFrom, Write};

        let path = self.file_path(key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("unable to open staged file {path:?}"))?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        debug!("staged {} bytes of {key} at offset {offset}", data.len());
        Ok(())
    }

    /// Replace a staged file with exactly `data`.
    pub fn overwrite_file(&self, key: &FileKey, data: &[u8]) -> Result<(), Error> {
        let path = self.file_path(key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, data)
            .with_context(|| format!("unable to write staged file {path:?}"))?;
        Ok(())
    }

    pub fn read_file(&self, key: &FileKey) -> Result<Vec<u8>, Error> {
        let path = self.file_path(key)?;
        std::fs::read(&path).with_context(|| format!("unable to read staged file {path:?}"))
    }

    pub fn read_file_range(&self, key: &FileKey, offset: u64, length: u64) -> Result<Vec<u8>, Error> {
        use std::io::{Read, Seek, SeekFrom};

        let path = self.file_path(key)?;
        let mut file = std::fs::File::open(&path)
            .with_context(|| format!("unable to open staged file {path:?}"))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut data = vec![0u8; length as usize];
        let mut read = 0;
        while read < data.len() {
            match file.read(&mut data[read..])? {
                0 => break,
                n => read += n,
            }
        }
        data.truncate(read);
        Ok(data)
    }

    pub fn delete_file(&self, key: &FileKey) -> Result<bool, Error> {
        let path = self.file_path(key)?;
        let _ = std::fs::remove_file(Self::pin_path(&path));
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    pub fn rename_file(&self, from: &FileKey, to: &FileKey) -> Result<(), Error> {
        let from_path = self.file_path(from)?;
        let to_path = self.file_path(to)?;
        if let Some(parent) = to_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(from_path, to_path)?;
        Ok(())
    }

    pub fn exists(&self, key: &FileKey) -> bool {
        self.file_path(key).map(|p| p.is_file()).unwrap_or(false)
    }

    pub fn size(&self, key: &FileKey) -> Result<u64, Error> {
        let path = self.file_path(key)?;
        Ok(std::fs::metadata(&path)?.len())
    }

    pub fn mtime(&self, key: &FileKey) -> Result<i64, Error> {
        let path = self.file_path(key)?;
        let mtime = std::fs::metadata(&path)?
            .modified()?
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Ok(mtime)
    }

    /// Pin a staged file, protecting it from autocleaning.
    pub fn pin(&self, key: &FileKey) -> Result<(), Error> {
        let path = self.file_path(key)?;
        std::fs::write(Self::pin_path(&path), b"")?;
        Ok(())
    }

    pub fn unpin(&self, key: &FileKey) -> Result<(), Error> {
        let path = self.file_path(key)?;
        let _ = std::fs::remove_file(Self::pin_path(&path));
        Ok(())
    }

    pub fn is_pinned(&self, key: &FileKey) -> bool {
        self.file_path(key)
            .map(|p| Self::pin_path(&p).is_file())
            .unwrap_or(false)
    }

    /// Remove unpinned staged files untouched for more than `expire_days`.
    /// Returns the number of files removed.
    pub fn autoclean(&self, expire_days: u64) -> usize {
        let cutoff = std::time::SystemTime::now()
            - std::time::Duration::from_secs(expire_days * 24 * 3600);
        let mut removed = 0;
        for entry in WalkDir::new(&self.root).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().map(|e| e == "pin").unwrap_or(false) {
                continue;
            }
            if Self::pin_path(path).is_file() {
                continue;
            }
            let old_enough = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .map(|mtime| mtime < cutoff)
                .unwrap_or(false);
            if old_enough {
                if let Err(err) = std::fs::remove_file(path) {
                    warn!("autoclean of {path:?} failed - {err}");
                } else {
                    removed += 1;
                }
            }
        }
        removed
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn staging() -> (tempfile::TempDir, Staging) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("file://{}", dir.path().display());
        let staging = Staging::open(&url).unwrap();
        (dir, staging)
    }

    #[test]
    fn write_read_delete_cycle() {
        let (_dir, staging) = staging();
        let key = FileKey::new(1, "dir/file.bin");

        staging.write_file(&key, 0, b"hello ").unwrap();
        staging.write_file(&key, 6, b"world").unwrap();
        assert!(staging.exists(&key));
        assert_eq!(staging.size(&key).unwrap(), 11);
        assert_eq!(staging.read_file(&key).unwrap(), b"hello world");
        assert_eq!(staging.read_file_range(&key, 6, 5).unwrap(), b"world");

        assert!(staging.delete_file(&key).unwrap());
        assert!(!staging.exists(&key));
        assert!(!staging.delete_file(&key).unwrap());
    }

    #[test]
    fn traversal_is_rejected() {
        let (_dir, staging) = staging();
        let key = FileKey::new(1, "../escape");
        assert!(staging.write_file(&key, 0, b"x").is_err());
    }

    #[test]
    fn pins_protect_from_autoclean() {
        let (_dir, staging) = staging();
        let pinned = FileKey::new(0, "pinned");
        let loose = FileKey::new(0, "loose");
        staging.overwrite_file(&pinned, b"a").unwrap();
        staging.overwrite_file(&loose, b"b").unwrap();
        staging.pin(&pinned).unwrap();
        assert!(staging.is_pinned(&pinned));

        // cutoff in the future relative to the files' mtime
        let removed = staging.autoclean(0);
        assert_eq!(removed, 1);
        assert!(staging.exists(&pinned));
        assert!(!staging.exists(&loose));

        staging.unpin(&pinned).unwrap();
        assert!(!staging.is_pinned(&pinned));
    }
}
