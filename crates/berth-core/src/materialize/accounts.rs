//! Owner and group resolution against the host account databases.

use std::path::{Path, PathBuf};

use crate::error::FilesystemError;

/// Reads `passwd(5)` and `group(5)` style files.
#[derive(Debug, Clone)]
pub struct AccountDb {
    passwd: PathBuf,
    group: PathBuf,
}

impl Default for AccountDb {
    fn default() -> Self {
        Self::system()
    }
}

impl AccountDb {
    /// The host databases at `/etc/passwd` and `/etc/group`.
    pub fn system() -> Self {
        Self::new("/etc/passwd", "/etc/group")
    }

    pub fn new(passwd: impl Into<PathBuf>, group: impl Into<PathBuf>) -> Self {
        Self {
            passwd: passwd.into(),
            group: group.into(),
        }
    }

    /// Resolve a user name or numeric uid.
    pub fn resolve_user(&self, user: &str) -> Result<u32, FilesystemError> {
        if let Ok(uid) = user.parse::<u32>() {
            return Ok(uid);
        }
        lookup(&self.passwd, user)?.ok_or_else(|| FilesystemError::UnknownUser(user.to_string()))
    }

    /// Resolve a group name or numeric gid.
    pub fn resolve_group(&self, group: &str) -> Result<u32, FilesystemError> {
        if let Ok(gid) = group.parse::<u32>() {
            return Ok(gid);
        }
        lookup(&self.group, group)?.ok_or_else(|| FilesystemError::UnknownGroup(group.to_string()))
    }
}

/// Both formats keep the name in field 0 and the numeric id in field 2.
fn lookup(db: &Path, name: &str) -> Result<Option<u32>, FilesystemError> {
    let text = std::fs::read_to_string(db).map_err(|e| FilesystemError::io(db, e))?;
    Ok(text
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .filter_map(|line| {
            let mut fields = line.split(':');
            let entry = fields.next()?;
            let id = fields.nth(1)?;
            (entry == name).then(|| id.parse::<u32>().ok()).flatten()
        })
        .next())
}
