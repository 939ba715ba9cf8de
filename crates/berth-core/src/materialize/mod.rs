//! File materializer: idempotent directory creation and atomic file writes.
//!
//! Writes are staged into a temporary file in the destination directory,
//! given their final mode and ownership, and only then renamed over the
//! destination. The destination never holds a partial file, and a new file
//! is never readable by anyone but the owner before its mode is applied
//! (temp files start at `0600`).

mod accounts;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::debug;

pub use accounts::AccountDb;

use crate::error::FilesystemError;
use crate::step::{FileMode, OverwritePolicy};

pub type Result<T> = std::result::Result<T, FilesystemError>;

/// Target of a file write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSpec {
    pub path: PathBuf,
    pub mode: FileMode,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub overwrite: OverwritePolicy,
}

impl FileSpec {
    pub fn new(path: impl Into<PathBuf>, mode: FileMode) -> Self {
        Self {
            path: path.into(),
            mode,
            owner: None,
            group: None,
            overwrite: OverwritePolicy::Always,
        }
    }

    pub fn with_owner(mut self, owner: Option<String>, group: Option<String>) -> Self {
        self.owner = owner;
        self.group = group;
        self
    }

    pub fn with_overwrite(mut self, overwrite: OverwritePolicy) -> Self {
        self.overwrite = overwrite;
        self
    }
}

/// Result of [`Materializer::write_file`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// New content was renamed into place.
    Written,
    /// Content was already identical; only mode and ownership were converged.
    Unchanged,
    /// `never_if_exists` and the file exists; nothing was touched.
    Preserved,
}

/// Resolved uid/gid pair; `None` leaves that id as is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Ownership {
    uid: Option<u32>,
    gid: Option<u32>,
}

impl Ownership {
    fn is_empty(&self) -> bool {
        self.uid.is_none() && self.gid.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Materializer {
    accounts: AccountDb,
}

impl Materializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_accounts(accounts: AccountDb) -> Self {
        Self { accounts }
    }

    /// Create `path` (and parents) if missing, then enforce mode and ownership
    /// when given. Returns whether anything changed.
    pub fn ensure_directory(
        &self,
        path: &Path,
        mode: Option<FileMode>,
        owner: Option<&str>,
        group: Option<&str>,
    ) -> Result<bool> {
        let ownership = self.resolve(owner, group)?;
        let mut changed = false;

        match fs::metadata(path) {
            Ok(meta) if !meta.is_dir() => {
                return Err(FilesystemError::NotADirectory {
                    path: path.to_path_buf(),
                })
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                fs::create_dir_all(path).map_err(|e| FilesystemError::io(path, e))?;
                debug!(path = %path.display(), "directory created");
                changed = true;
            }
            Err(e) => return Err(FilesystemError::io(path, e)),
        }

        // chown clears setuid and setgid, so ownership goes first.
        changed |= converge_owner(path, ownership)?;
        if let Some(mode) = mode {
            changed |= converge_mode(path, mode)?;
        }
        Ok(changed)
    }

    /// Write `bytes` to `spec.path` according to its overwrite policy.
    pub fn write_file(&self, spec: &FileSpec, bytes: &[u8]) -> Result<WriteOutcome> {
        let existing = existing_file(&spec.path)?;

        if existing && spec.overwrite == OverwritePolicy::NeverIfExists {
            debug!(path = %spec.path.display(), "existing file preserved");
            return Ok(WriteOutcome::Preserved);
        }

        if existing {
            let current = fs::read(&spec.path).map_err(|e| FilesystemError::io(&spec.path, e))?;
            if current == bytes {
                let ownership = self.resolve(spec.owner.as_deref(), spec.group.as_deref())?;
                converge_owner(&spec.path, ownership)?;
                converge_mode(&spec.path, spec.mode)?;
                return Ok(WriteOutcome::Unchanged);
            }
        }

        self.stage(spec, bytes)?.commit()?;
        Ok(WriteOutcome::Written)
    }

    /// Stage `bytes` next to `spec.path` without touching the destination.
    ///
    /// The staged file already carries its final ownership and mode. Dropping
    /// the returned value without calling [`StagedWrite::commit`] discards it.
    pub fn stage(&self, spec: &FileSpec, bytes: &[u8]) -> Result<StagedWrite> {
        let ownership = self.resolve(spec.owner.as_deref(), spec.group.as_deref())?;
        let parent = parent_dir(&spec.path);

        let mut tmp = NamedTempFile::new_in(parent).map_err(|e| FilesystemError::io(parent, e))?;
        let tmp_path = tmp.path().to_path_buf();
        tmp.write_all(bytes)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| FilesystemError::io(&tmp_path, e))?;
        apply_owner_to_file(tmp.as_file(), ownership)
            .and_then(|_| apply_mode_to_file(tmp.as_file(), spec.mode))
            .map_err(|e| FilesystemError::io(&tmp_path, e))?;

        Ok(StagedWrite {
            tmp,
            dest: spec.path.clone(),
        })
    }

    /// Read a template or static source file.
    pub fn read_source(&self, path: &Path) -> Result<Vec<u8>> {
        if !existing_file(path)? {
            return Err(FilesystemError::io(
                path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "source file not found"),
            ));
        }
        fs::read(path).map_err(|e| FilesystemError::io(path, e))
    }

    fn resolve(&self, owner: Option<&str>, group: Option<&str>) -> Result<Ownership> {
        Ok(Ownership {
            uid: owner.map(|o| self.accounts.resolve_user(o)).transpose()?,
            gid: group.map(|g| self.accounts.resolve_group(g)).transpose()?,
        })
    }
}

/// A fully written temp file waiting to be renamed into place.
#[derive(Debug)]
pub struct StagedWrite {
    tmp: NamedTempFile,
    dest: PathBuf,
}

impl StagedWrite {
    pub fn temp_path(&self) -> &Path {
        self.tmp.path()
    }

    /// Atomically rename the staged file over the destination.
    pub fn commit(self) -> Result<()> {
        let dest = self.dest;
        self.tmp
            .persist(&dest)
            .map_err(|e| FilesystemError::io(&dest, e.error))?;
        debug!(path = %dest.display(), "file written");
        Ok(())
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

/// `Ok(true)` for an existing regular file, `Ok(false)` when absent.
fn existing_file(path: &Path) -> Result<bool> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() => Ok(true),
        Ok(_) => Err(FilesystemError::NotAFile {
            path: path.to_path_buf(),
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(FilesystemError::io(path, e)),
    }
}

#[cfg(unix)]
fn apply_mode_to_file(file: &fs::File, mode: FileMode) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(mode.bits()))
}

#[cfg(unix)]
fn apply_owner_to_file(file: &fs::File, ownership: Ownership) -> std::io::Result<()> {
    if ownership.is_empty() {
        return Ok(());
    }
    std::os::unix::fs::fchown(file, ownership.uid, ownership.gid)
}

#[cfg(unix)]
fn converge_mode(path: &Path, mode: FileMode) -> Result<bool> {
    use std::os::unix::fs::PermissionsExt;
    let meta = fs::metadata(path).map_err(|e| FilesystemError::io(path, e))?;
    if meta.permissions().mode() & 0o7777 == mode.bits() {
        return Ok(false);
    }
    fs::set_permissions(path, fs::Permissions::from_mode(mode.bits()))
        .map_err(|e| FilesystemError::io(path, e))?;
    Ok(true)
}

#[cfg(unix)]
fn converge_owner(path: &Path, ownership: Ownership) -> Result<bool> {
    use std::os::unix::fs::MetadataExt;
    if ownership.is_empty() {
        return Ok(false);
    }
    let meta = fs::metadata(path).map_err(|e| FilesystemError::io(path, e))?;
    let uid_ok = ownership.uid.map_or(true, |uid| meta.uid() == uid);
    let gid_ok = ownership.gid.map_or(true, |gid| meta.gid() == gid);
    if uid_ok && gid_ok {
        return Ok(false);
    }
    std::os::unix::fs::chown(path, ownership.uid, ownership.gid)
        .map_err(|e| FilesystemError::io(path, e))?;
    Ok(true)
}

#[cfg(not(unix))]
fn apply_mode_to_file(_file: &fs::File, _mode: FileMode) -> std::io::Result<()> {
    Ok(())
}

#[cfg(not(unix))]
fn apply_owner_to_file(_file: &fs::File, _ownership: Ownership) -> std::io::Result<()> {
    Ok(())
}

#[cfg(not(unix))]
fn converge_mode(_path: &Path, _mode: FileMode) -> Result<bool> {
    Ok(false)
}

#[cfg(not(unix))]
fn converge_owner(_path: &Path, _ownership: Ownership) -> Result<bool> {
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::DEFAULT_FILE_MODE;

    fn spec(path: &Path) -> FileSpec {
        FileSpec::new(path, DEFAULT_FILE_MODE)
    }

    #[test]
    fn test_write_then_rewrite_same_bytes_is_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let m = Materializer::new();
        let target = spec(&dir.path().join(".env"));

        assert_eq!(m.write_file(&target, b"A=1\n").unwrap(), WriteOutcome::Written);
        assert_eq!(m.write_file(&target, b"A=1\n").unwrap(), WriteOutcome::Unchanged);
        assert_eq!(m.write_file(&target, b"A=2\n").unwrap(), WriteOutcome::Written);
        assert_eq!(fs::read(&target.path).unwrap(), b"A=2\n");
    }

    #[test]
    fn test_directory_in_place_of_file() {
        let dir = tempfile::tempdir().unwrap();
        let m = Materializer::new();
        let err = m.write_file(&spec(dir.path()), b"x").unwrap_err();
        assert!(matches!(err, FilesystemError::NotAFile { .. }));
    }

    #[test]
    fn test_missing_parent_fails() {
        let dir = tempfile::tempdir().unwrap();
        let m = Materializer::new();
        let err = m
            .write_file(&spec(&dir.path().join("nope/.env")), b"x")
            .unwrap_err();
        assert!(matches!(err, FilesystemError::Io { .. }));
    }

    #[test]
    fn test_ensure_directory_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let m = Materializer::new();
        let path = dir.path().join("a/b/c");
        assert!(m.ensure_directory(&path, None, None, None).unwrap());
        assert!(!m.ensure_directory(&path, None, None, None).unwrap());
        assert!(path.is_dir());
    }

    #[test]
    fn test_ensure_directory_over_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("occupied");
        fs::write(&path, b"x").unwrap();
        let err = Materializer::new()
            .ensure_directory(&path, None, None, None)
            .unwrap_err();
        assert!(matches!(err, FilesystemError::NotADirectory { .. }));
    }

    #[test]
    fn test_unknown_owner_fails_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let db_dir = tempfile::tempdir().unwrap();
        fs::write(db_dir.path().join("passwd"), "root:x:0:0::/root:/bin/sh\n").unwrap();
        fs::write(db_dir.path().join("group"), "root:x:0:\n").unwrap();
        let m = Materializer::with_accounts(AccountDb::new(
            db_dir.path().join("passwd"),
            db_dir.path().join("group"),
        ));

        let target = spec(&dir.path().join(".env")).with_owner(Some("ghost".to_string()), None);
        let err = m.write_file(&target, b"x").unwrap_err();
        assert!(matches!(err, FilesystemError::UnknownUser(_)));
        assert!(!target.path.exists());
    }

    #[test]
    fn test_read_source_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = Materializer::new()
            .read_source(&dir.path().join("env.tmpl"))
            .unwrap_err();
        assert!(err.to_string().contains("env.tmpl"));
    }
}
