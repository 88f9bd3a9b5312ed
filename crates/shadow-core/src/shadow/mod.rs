/// Shadowing engine (C5) — consumes directory-change notifications,
/// maintains the shadow index (C1) under a mutex, and issues hard-link
/// operations through the [`ShadowFs`] capability (C4).
///
/// `CreateShadow`/`PromoteShadow` are plain methods on [`ShadowEngine`] and
/// take no dependency on the notification source, so they're exercised
/// directly in tests against [`crate::fs::StdFs`] and a `tempfile`
/// directory tree -- the IOCP worker pool (`worker.rs`, Windows-only) is
/// just one caller of them.
pub mod entry;
pub mod worker;

use crate::console::{log_colored, ConsoleColor};
use crate::error::{Result, ShadowError};
use crate::fs::{backup_destination, is_excluded, relative_paths, suffixed_candidates, ShadowFs};
use crate::index::AvlTree;
use entry::ShadowEntry;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Name of the staging-area subdirectory under `backup_dir`.
pub const STAGING_DIR_NAME: &str = "temp";
/// Name of the promoted-output subdirectory under `backup_dir`.
pub const BACKUP_DIR_NAME: &str = "backup";
/// Upper bound of the promotion collision-suffix retry loop (`.1` .. `.9999`).
pub const PROMOTION_SUFFIX_MAX: u32 = 9999;

type ShadowIndex = Mutex<AvlTree<String, ShadowEntry>>;

/// Process-wide state for one monitored source tree.
pub struct ShadowEngine {
    source_dir: PathBuf,
    staging_dir: PathBuf,
    backup_dir: PathBuf,
    exclusion_prefix: Option<String>,
    index: ShadowIndex,
    fs: Arc<dyn ShadowFs>,
    next_staging_id: AtomicU64,
    #[cfg(windows)]
    io: Mutex<Option<worker::WorkerPool>>,
}

impl ShadowEngine {
    /// Builds an engine with directories prepared and the exclusion prefix
    /// computed, but starts no worker threads. Used directly by tests that
    /// drive `create_shadow`/`promote_shadow` without a live notification
    /// stream, and internally by [`ShadowEngine::start`].
    pub fn new_with_fs(
        fs: Arc<dyn ShadowFs>,
        source_dir: impl Into<PathBuf>,
        backup_dir: impl Into<PathBuf>,
    ) -> Result<Arc<ShadowEngine>> {
        let source_dir = source_dir.into();
        let backup_dir = backup_dir.into();
        let staging_dir = backup_dir.join(STAGING_DIR_NAME);
        let promoted_dir = backup_dir.join(BACKUP_DIR_NAME);

        fs.create_dir_recursive(&backup_dir)?;
        fs.create_dir_recursive(&staging_dir)?;
        fs.create_dir_recursive(&promoted_dir)?;

        let exclusion_prefix = compute_exclusion_prefix(&source_dir, &backup_dir);

        Ok(Arc::new(ShadowEngine {
            source_dir,
            staging_dir,
            backup_dir,
            exclusion_prefix,
            index: Mutex::new(AvlTree::new()),
            fs,
            next_staging_id: AtomicU64::new(1),
            #[cfg(windows)]
            io: Mutex::new(None),
        }))
    }

    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    pub fn len(&self) -> usize {
        self.index.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.lock().is_empty()
    }

    /// Absolute path a source-relative `display_path` resolves to.
    pub fn absolute_source_path(&self, display_path: &str) -> PathBuf {
        self.source_dir.join(display_path)
    }

    /// Relative key/display path pair for a raw absolute path carried by a
    /// change record.
    pub fn relative_of(&self, absolute: &Path) -> Result<(String, String)> {
        relative_paths(&self.source_dir, absolute)
    }

    fn is_excluded_key(&self, key: &str) -> bool {
        is_excluded(key, self.exclusion_prefix.as_deref())
    }

    /// §4.4.3 — pins the content of the file at `display_path` by creating
    /// a hard link into the staging area and recording it in the index.
    pub fn create_shadow(&self, display_path: &str) -> Result<()> {
        let key = display_path.to_lowercase();
        if self.is_excluded_key(&key) {
            return Ok(());
        }

        let absolute_source = self.absolute_source_path(display_path);
        let staging_name = self.generate_staging_name()?;

        self.fs
            .hardlink_from_existing(&staging_name, &absolute_source)
            .map_err(|e| match e {
                ShadowError::LinkExists => ShadowError::NameGeneration,
                other => other,
            })?;

        let entry = self.open_shadow_entry(display_path, staging_name.clone())?;

        let mut index = self.index.lock();
        if !index.insert(key, entry) {
            // IndexCollision: tear down the just-created shadow, prior wins.
            drop(index);
            let _ = self.fs.remove_file(&staging_name);
            warn!(path = display_path, "shadow already tracked, discarding duplicate");
            return Err(ShadowError::IndexCollision);
        }
        drop(index);

        log_colored(ConsoleColor::Green, format!("shadowed {display_path}"));
        info!(path = display_path, "shadow created");
        Ok(())
    }

    /// §4.4.4 — looks up the tracked shadow for `display_path` and, if
    /// present, promotes it into the backup tree, retrying with numeric
    /// suffixes on collision.
    pub fn promote_shadow(&self, display_path: &str) -> Result<()> {
        let key = display_path.to_lowercase();
        if self.is_excluded_key(&key) {
            return Ok(());
        }

        let temp_path = {
            let index = self.index.lock();
            match index.get(&key) {
                Some(entry) => entry.temp_path.clone(),
                None => return Ok(()),
            }
        };

        let restored_base = backup_destination(&self.promoted_dir(), display_path);
        if let Some(parent) = restored_base.parent() {
            self.fs.create_dir_recursive(parent)?;
        }

        let mut promoted_path = None;
        for candidate in suffixed_candidates(&restored_base) {
            match self.fs.hardlink_from_existing(&candidate, &temp_path) {
                Ok(()) => {
                    promoted_path = Some(candidate);
                    break;
                }
                Err(ShadowError::LinkExists) => continue,
                Err(other) => return Err(other),
            }
        }

        let Some(promoted_path) = promoted_path else {
            warn!(path = display_path, "promotion exhausted suffix range");
            return Err(ShadowError::LinkExists);
        };

        // Removing the entry drops it, which closes the handle and
        // unlinks the staging file.
        let mut index = self.index.lock();
        index.remove(&key);
        drop(index);

        log_colored(
            ConsoleColor::Yellow,
            format!("backuped {display_path} -> {}", promoted_path.display()),
        );
        info!(path = display_path, dest = %promoted_path.display(), "shadow promoted");
        Ok(())
    }

    fn promoted_dir(&self) -> PathBuf {
        self.backup_dir.join(BACKUP_DIR_NAME)
    }

    fn generate_staging_name(&self) -> Result<PathBuf> {
        for _ in 0..64 {
            let id = self.next_staging_id.fetch_add(1, Ordering::Relaxed);
            let candidate = self.staging_dir.join(format!("db_{id:08x}"));
            if !self.fs.file_exists(&candidate) {
                return Ok(candidate);
            }
        }
        Err(ShadowError::NameGeneration)
    }

    #[cfg(windows)]
    fn open_shadow_entry(&self, display_path: &str, temp_path: PathBuf) -> Result<ShadowEntry> {
        use windows::core::PCWSTR;
        use windows::Win32::Foundation::GENERIC_READ;
        use windows::Win32::Storage::FileSystem::{
            CreateFileW, FILE_FLAGS_AND_ATTRIBUTES, FILE_SHARE_DELETE, FILE_SHARE_READ,
            FILE_SHARE_WRITE, OPEN_EXISTING,
        };
        use windows::Win32::System::Threading::SYNCHRONIZE;

        let wide: Vec<u16> = temp_path
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();
        let handle = unsafe {
            CreateFileW(
                PCWSTR::from_raw(wide.as_ptr()),
                (GENERIC_READ.0 | SYNCHRONIZE.0) as u32,
                FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
                None,
                OPEN_EXISTING,
                FILE_FLAGS_AND_ATTRIBUTES(0),
                None,
            )
        }
        .map_err(|e| ShadowError::Transient {
            code: e.code().0 as u32,
        })?;

        Ok(ShadowEntry::new(
            display_path,
            temp_path,
            handle,
            Arc::clone(&self.fs),
        ))
    }

    #[cfg(not(windows))]
    fn open_shadow_entry(&self, display_path: &str, temp_path: PathBuf) -> Result<ShadowEntry> {
        Ok(ShadowEntry::new(display_path, temp_path, Arc::clone(&self.fs)))
    }
}

#[cfg(windows)]
use std::os::windows::ffi::OsStrExt;

/// §4.4.1 step 4 — if `source_dir` or `backup_dir` is a prefix of the
/// other on a path-component boundary, returns the nested side's relative
/// suffix (lowercased) so events originating under it can be ignored (I3).
fn compute_exclusion_prefix(source_dir: &Path, backup_dir: &Path) -> Option<String> {
    let source = source_dir.canonicalize().unwrap_or_else(|_| source_dir.to_path_buf());
    let backup = backup_dir.canonicalize().unwrap_or_else(|_| backup_dir.to_path_buf());

    if let Ok(suffix) = backup.strip_prefix(&source) {
        let suffix = suffix.to_string_lossy().replace('\\', "/").to_lowercase();
        if suffix.is_empty() {
            return None;
        }
        return Some(suffix);
    }
    None
}

#[cfg(windows)]
impl ShadowEngine {
    /// §4.4.1 steps 1-4 — acquires the link-creation capability and
    /// prepares the backup tree (staging + promoted directories, exclusion
    /// prefix), but starts no worker threads and opens no directory handle
    /// yet. A failure here is an *initialization* failure (spec.md §6 exit
    /// code 1): the capability couldn't be acquired, or the directory tree
    /// couldn't be prepared.
    pub fn init(
        source_dir: impl Into<PathBuf>,
        backup_dir: impl Into<PathBuf>,
    ) -> Result<Arc<ShadowEngine>> {
        acquire_link_capability()?;
        Self::new_with_fs(Arc::new(crate::fs::WindowsFs::new()), source_dir, backup_dir)
    }

    /// §4.4.1 step 5 — opens the source directory for overlapped change
    /// reads, binds it to a completion port, and spawns `2 * cpu_count`
    /// worker threads. A failure here is a *monitor start* failure
    /// (spec.md §6 exit code 2): initialization already succeeded, but the
    /// directory couldn't be opened for change notifications.
    pub fn spawn_workers(self: &Arc<Self>) -> Result<()> {
        let pool = worker::WorkerPool::start(Arc::clone(self))?;
        *self.io.lock() = Some(pool);
        Ok(())
    }

    /// Convenience combining [`ShadowEngine::init`] and
    /// [`ShadowEngine::spawn_workers`] for callers that don't need to
    /// distinguish the two failure classes.
    pub fn start(
        source_dir: impl Into<PathBuf>,
        backup_dir: impl Into<PathBuf>,
    ) -> Result<Arc<ShadowEngine>> {
        let engine = Self::init(source_dir, backup_dir)?;
        engine.spawn_workers()?;
        Ok(engine)
    }

    /// §4.4.6 — posts synthetic stop completions, joins every worker, and
    /// drops every remaining tracked shadow (closing handles, unlinking
    /// staging files).
    pub fn stop(&self) {
        if let Some(pool) = self.io.lock().take() {
            pool.stop();
        }
        let remaining = self.index.lock().drain_all();
        drop(remaining);
    }
}

/// §4.4.1 step 1 — acquires `SeBackupPrivilege`/`SeRestorePrivilege` on the
/// process token, required to hard-link across ACL boundaries that a
/// regular user token cannot otherwise traverse. Mirrors the teacher's
/// `is_elevated` token-query pattern, but adjusts rather than merely reads
/// the token's privilege set.
#[cfg(windows)]
fn acquire_link_capability() -> Result<()> {
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::{CloseHandle, HANDLE, LUID};
    use windows::Win32::Security::{
        AdjustTokenPrivileges, LookupPrivilegeValueW, LUID_AND_ATTRIBUTES, SE_PRIVILEGE_ENABLED,
        TOKEN_ADJUST_PRIVILEGES, TOKEN_PRIVILEGES, TOKEN_QUERY,
    };
    use windows::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

    unsafe {
        let mut token_handle = HANDLE::default();
        let process = GetCurrentProcess();
        OpenProcessToken(
            process,
            TOKEN_ADJUST_PRIVILEGES | TOKEN_QUERY,
            &mut token_handle,
        )
        .map_err(|_| ShadowError::CapabilityDenied)?;

        let mut ok = true;
        for name in ["SeBackupPrivilege", "SeRestorePrivilege"] {
            let wide: Vec<u16> = name.encode_utf16().chain(std::iter::once(0)).collect();
            let mut luid = LUID::default();
            if LookupPrivilegeValueW(PCWSTR::null(), PCWSTR::from_raw(wide.as_ptr()), &mut luid)
                .is_err()
            {
                ok = false;
                continue;
            }
            let privileges = TOKEN_PRIVILEGES {
                PrivilegeCount: 1,
                Privileges: [LUID_AND_ATTRIBUTES {
                    Luid: luid,
                    Attributes: SE_PRIVILEGE_ENABLED,
                }],
            };
            if AdjustTokenPrivileges(token_handle, false, Some(&privileges), 0, None, None)
                .is_err()
            {
                ok = false;
            }
        }

        let _ = CloseHandle(token_handle);
        if ok {
            Ok(())
        } else {
            Err(ShadowError::CapabilityDenied)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::StdFs;

    fn engine(source: &Path, backup: &Path) -> Arc<ShadowEngine> {
        ShadowEngine::new_with_fs(Arc::new(StdFs::new()), source, backup).unwrap()
    }

    /// Scenario 1: delete-then-verify.
    #[test]
    fn create_then_promote_preserves_content() {
        let src = tempfile::tempdir().unwrap();
        let backup = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("a")).unwrap();
        std::fs::write(src.path().join("a/b.txt"), b"hello").unwrap();

        let engine = engine(src.path(), backup.path());
        engine.create_shadow("a/b.txt").unwrap();
        assert_eq!(engine.len(), 1);

        std::fs::remove_file(src.path().join("a/b.txt")).unwrap();
        engine.promote_shadow("a/b.txt").unwrap();
        assert_eq!(engine.len(), 0);

        let restored = backup.path().join(BACKUP_DIR_NAME).join("a/b.txt");
        assert_eq!(std::fs::read(restored).unwrap(), b"hello");
    }

    /// Scenario 2: rename creates a fresh shadow under the new name; the
    /// old name promotes independently.
    #[test]
    fn rename_promotes_old_name_only() {
        let src = tempfile::tempdir().unwrap();
        let backup = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("x.dat"), [1, 2, 3, 4, 5, 6, 7, 8]).unwrap();

        let engine = engine(src.path(), backup.path());
        engine.create_shadow("x.dat").unwrap();

        std::fs::rename(src.path().join("x.dat"), src.path().join("y.dat")).unwrap();
        engine.create_shadow("y.dat").unwrap();
        engine.promote_shadow("x.dat").unwrap();

        let restored_x = backup.path().join(BACKUP_DIR_NAME).join("x.dat");
        let restored_y = backup.path().join(BACKUP_DIR_NAME).join("y.dat");
        assert_eq!(std::fs::read(restored_x).unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(!restored_y.exists());
    }

    /// Scenario 3: collision produces a `.1` suffix, original untouched.
    #[test]
    fn promotion_collision_uses_numeric_suffix() {
        let src = tempfile::tempdir().unwrap();
        let backup = tempfile::tempdir().unwrap();
        let promoted_dir = backup.path().join(BACKUP_DIR_NAME);
        std::fs::create_dir_all(&promoted_dir).unwrap();
        std::fs::write(promoted_dir.join("c.txt"), b"old").unwrap();
        std::fs::write(src.path().join("c.txt"), b"new").unwrap();

        let engine = engine(src.path(), backup.path());
        engine.create_shadow("c.txt").unwrap();
        std::fs::remove_file(src.path().join("c.txt")).unwrap();
        engine.promote_shadow("c.txt").unwrap();

        assert_eq!(std::fs::read(promoted_dir.join("c.txt")).unwrap(), b"old");
        assert_eq!(std::fs::read(promoted_dir.join("c.txt.1")).unwrap(), b"new");
    }

    /// Scenario 4: backup nested in source, events under it are excluded (I3).
    #[test]
    fn nested_backup_dir_is_excluded() {
        let src = tempfile::tempdir().unwrap();
        let backup = src.path().join("backup_area");
        std::fs::create_dir_all(&backup).unwrap();

        let engine = engine(src.path(), &backup);
        std::fs::write(backup.join("temp/db_1"), b"whatever").unwrap_or(());
        // The path under the exclusion prefix is a no-op regardless of
        // whether the underlying file actually exists.
        engine.create_shadow("backup_area/temp/db_1").unwrap();
        assert_eq!(engine.len(), 0);
    }

    #[test]
    fn create_shadow_on_missing_source_reports_disappeared() {
        let src = tempfile::tempdir().unwrap();
        let backup = tempfile::tempdir().unwrap();
        let engine = engine(src.path(), backup.path());

        let err = engine.create_shadow("ghost.txt").unwrap_err();
        assert!(matches!(err, ShadowError::SourceDisappeared(_)));
        assert_eq!(engine.len(), 0);
    }

    #[test]
    fn promote_without_tracked_shadow_is_noop() {
        let src = tempfile::tempdir().unwrap();
        let backup = tempfile::tempdir().unwrap();
        let engine = engine(src.path(), backup.path());
        engine.promote_shadow("never/seen.txt").unwrap();
    }

    #[test]
    fn duplicate_create_shadow_is_index_collision() {
        let src = tempfile::tempdir().unwrap();
        let backup = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("dup.txt"), b"content").unwrap();

        let engine = engine(src.path(), backup.path());
        engine.create_shadow("dup.txt").unwrap();
        let err = engine.create_shadow("dup.txt").unwrap_err();
        assert!(matches!(err, ShadowError::IndexCollision));
        assert_eq!(engine.len(), 1);
    }
}
