/// Filesystem capabilities (C4) — the small surface the shadowing engine
/// depends on, abstracted behind [`ShadowFs`] so tests can run against a
/// portable double instead of live directory-change notifications.
///
/// [`WindowsFs`] is the production implementation, backed by the `windows`
/// crate. [`StdFs`] is a `std::fs`-only test double: it implements every
/// method except [`ShadowFs::open_directory_for_change_notify`], which has
/// no portable equivalent and is only ever exercised through
/// [`WindowsFs`] in production.
use crate::error::{Result, ShadowError};
use std::path::{Path, PathBuf};

/// A capability interface over path existence, directory creation, and
/// hard-link creation -- the only filesystem operations the engine issues
/// outside of directory-change notification itself.
pub trait ShadowFs: Send + Sync {
    fn dir_exists(&self, path: &Path) -> bool;
    fn file_exists(&self, path: &Path) -> bool;

    /// Creates every missing ancestor of `path`. Already-existing
    /// directories are success, not error.
    fn create_dir_recursive(&self, path: &Path) -> Result<()>;

    /// Creates `dest` as an additional hard link to `src`. If `dest`
    /// already exists, fails with [`ShadowError::LinkExists`] rather than
    /// replacing it -- callers that want replace-on-race semantics use
    /// [`ShadowFs::hardlink_replace`] instead.
    fn hardlink_from_existing(&self, dest: &Path, src: &Path) -> Result<()>;

    /// Like [`ShadowFs::hardlink_from_existing`], but if `dest` exists and
    /// is a regular file, removes it first and retries once. Used by the
    /// staging-name generator to re-point a name that raced with another
    /// thread.
    fn hardlink_replace(&self, dest: &Path, src: &Path) -> Result<()>;

    fn remove_file(&self, path: &Path) -> Result<()>;
}

/// Production filesystem capability, backed by Win32 calls.
pub struct WindowsFs;

impl WindowsFs {
    pub fn new() -> Self {
        WindowsFs
    }
}

impl Default for WindowsFs {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(windows)]
impl ShadowFs for WindowsFs {
    fn dir_exists(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn file_exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn create_dir_recursive(&self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(path).map_err(|e| os_error(&e))
    }

    fn hardlink_from_existing(&self, dest: &Path, src: &Path) -> Result<()> {
        win_create_hard_link(dest, src)
    }

    fn hardlink_replace(&self, dest: &Path, src: &Path) -> Result<()> {
        match win_create_hard_link(dest, src) {
            Err(ShadowError::LinkExists) if dest.is_file() => {
                std::fs::remove_file(dest).map_err(|e| os_error(&e))?;
                win_create_hard_link(dest, src)
            }
            other => other,
        }
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        std::fs::remove_file(path).map_err(|e| os_error(&e))
    }
}

#[cfg(windows)]
fn win_create_hard_link(dest: &Path, src: &Path) -> Result<()> {
    use windows::core::PCWSTR;
    use windows::Win32::Storage::FileSystem::CreateHardLinkW;

    let dest_wide = to_wide(dest)?;
    let src_wide = to_wide(src)?;
    unsafe {
        CreateHardLinkW(
            PCWSTR::from_raw(dest_wide.as_ptr()),
            PCWSTR::from_raw(src_wide.as_ptr()),
            None,
        )
        .map_err(|e| {
            let code = e.code().0 as u32;
            // ERROR_ALREADY_EXISTS / ERROR_FILE_EXISTS
            if code == 183 || code == 80 {
                ShadowError::LinkExists
            } else if !src.exists() {
                ShadowError::SourceDisappeared(src.display().to_string())
            } else {
                ShadowError::Transient { code }
            }
        })
    }
}

#[cfg(windows)]
fn to_wide(path: &Path) -> Result<Vec<u16>> {
    use std::os::windows::ffi::OsStrExt;
    if path.to_str().is_none() {
        return Err(ShadowError::PathConversion(path.display().to_string()));
    }
    Ok(path
        .as_os_str()
        .encode_wide()
        .chain(std::iter::once(0))
        .collect())
}

#[cfg(windows)]
#[allow(dead_code)]
fn os_error(e: &std::io::Error) -> ShadowError {
    ShadowError::Transient {
        code: e.raw_os_error().unwrap_or(0) as u32,
    }
}

/// Portable test double over `std::fs`. Hard links are created with
/// `std::fs::hard_link`, which has identical same-volume semantics to the
/// Win32 call on every platform that supports hard links at all.
pub struct StdFs;

impl StdFs {
    pub fn new() -> Self {
        StdFs
    }
}

impl Default for StdFs {
    fn default() -> Self {
        Self::new()
    }
}

impl ShadowFs for StdFs {
    fn dir_exists(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn file_exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn create_dir_recursive(&self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(path).map_err(|e| std_os_error(&e))
    }

    fn hardlink_from_existing(&self, dest: &Path, src: &Path) -> Result<()> {
        std_hard_link(dest, src)
    }

    fn hardlink_replace(&self, dest: &Path, src: &Path) -> Result<()> {
        match std_hard_link(dest, src) {
            Err(ShadowError::LinkExists) if dest.is_file() => {
                std::fs::remove_file(dest).map_err(|e| std_os_error(&e))?;
                std_hard_link(dest, src)
            }
            other => other,
        }
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        std::fs::remove_file(path).map_err(|e| std_os_error(&e))
    }
}

fn std_hard_link(dest: &Path, src: &Path) -> Result<()> {
    if !src.exists() {
        return Err(ShadowError::SourceDisappeared(src.display().to_string()));
    }
    match std::fs::hard_link(src, dest) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(ShadowError::LinkExists),
        Err(e) => Err(std_os_error(&e)),
    }
}

fn std_os_error(e: &std::io::Error) -> ShadowError {
    ShadowError::Transient {
        code: e.raw_os_error().unwrap_or(0) as u32,
    }
}

/// Returns the lowercase, forward-slash-normalized relative path used as
/// an index key, and the volume-relative display path used for backup
/// reconstruction. Both are derived from `base` (the watched root) and
/// `absolute` (the raw path carried by a change record).
pub fn relative_paths(base: &Path, absolute: &Path) -> Result<(String, String)> {
    let relative = absolute
        .strip_prefix(base)
        .map_err(|_| ShadowError::PathConversion(absolute.display().to_string()))?;
    let display = relative
        .to_str()
        .ok_or_else(|| ShadowError::PathConversion(absolute.display().to_string()))?
        .replace('\\', "/");
    let key = display.to_lowercase();
    Ok((key, display))
}

/// Checks whether `key` (already lowercased) falls under `exclusion_prefix`
/// (also lowercased), on a path-component boundary. Used to implement I3.
pub fn is_excluded(key: &str, exclusion_prefix: Option<&str>) -> bool {
    match exclusion_prefix {
        None => false,
        Some(prefix) if prefix.is_empty() => false,
        Some(prefix) => key == prefix || key.starts_with(&format!("{prefix}/")),
    }
}

/// Joins `backup_dir/backup` with a display path, returning the candidate
/// and its parent directory (to be created recursively before linking).
pub fn backup_destination(backup_root: &Path, display_path: &str) -> PathBuf {
    backup_root.join(display_path.replace('/', std::path::MAIN_SEPARATOR_STR))
}

/// Produces `path`, `path.1`, `path.2`, ... `path.9999`.
pub fn suffixed_candidates(path: &Path) -> impl Iterator<Item = PathBuf> + '_ {
    std::iter::once(path.to_path_buf()).chain((1..=9999u32).map(move |n| {
        let mut name = path.as_os_str().to_os_string();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_dir_recursive_creates_nested_and_is_idempotent() {
        let dir = tempdir().unwrap();
        let fs = StdFs::new();
        let nested = dir.path().join("a/b/c");
        assert!(fs.create_dir_recursive(&nested).is_ok());
        assert!(fs.dir_exists(&nested));
        // Existing directory: still success.
        assert!(fs.create_dir_recursive(&nested).is_ok());
    }

    #[test]
    fn hardlink_from_existing_fails_on_missing_source() {
        let dir = tempdir().unwrap();
        let fs = StdFs::new();
        let src = dir.path().join("missing.txt");
        let dest = dir.path().join("dest.txt");
        let err = fs.hardlink_from_existing(&dest, &src).unwrap_err();
        assert!(matches!(err, ShadowError::SourceDisappeared(_)));
    }

    #[test]
    fn hardlink_from_existing_rejects_when_dest_present() {
        let dir = tempdir().unwrap();
        let fs = StdFs::new();
        let src = dir.path().join("src.txt");
        std::fs::write(&src, b"hi").unwrap();
        let dest = dir.path().join("dest.txt");
        std::fs::write(&dest, b"already here").unwrap();
        let err = fs.hardlink_from_existing(&dest, &src).unwrap_err();
        assert!(matches!(err, ShadowError::LinkExists));
    }

    #[test]
    fn hardlink_replace_overwrites_existing_regular_file() {
        let dir = tempdir().unwrap();
        let fs = StdFs::new();
        let src = dir.path().join("src.txt");
        std::fs::write(&src, b"new content").unwrap();
        let dest = dir.path().join("dest.txt");
        std::fs::write(&dest, b"old content").unwrap();
        fs.hardlink_replace(&dest, &src).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"new content");
    }

    #[test]
    fn relative_paths_lowercases_key_but_preserves_display_case() {
        let base = Path::new("/watch");
        let absolute = Path::new("/watch/Sub/File.TXT");
        let (key, display) = relative_paths(base, absolute).unwrap();
        assert_eq!(key, "sub/file.txt");
        assert_eq!(display, "Sub/File.TXT");
    }

    #[test]
    fn is_excluded_matches_on_component_boundary_only() {
        assert!(is_excluded("backup/temp/x", Some("backup")));
        assert!(is_excluded("backup", Some("backup")));
        assert!(!is_excluded("backupother/x", Some("backup")));
        assert!(!is_excluded("anything", None));
    }

    #[test]
    fn suffixed_candidates_enumerates_base_then_numbered() {
        let path = Path::new("/x/c.txt");
        let mut it = suffixed_candidates(path);
        assert_eq!(it.next().unwrap(), PathBuf::from("/x/c.txt"));
        assert_eq!(it.next().unwrap(), PathBuf::from("/x/c.txt.1"));
        assert_eq!(it.next().unwrap(), PathBuf::from("/x/c.txt.2"));
    }
}
