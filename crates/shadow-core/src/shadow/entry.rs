/// `ShadowEntry` — the value type stored in the shadow index (C1), keyed by
/// lowercased relative path.
///
/// Grounded in `original_source/src/BackupDeleted/BackupDeleted.cpp`'s
/// `FileContext { Key, BackupFileName, TempFileName, TempFile }`: the
/// handle that pins the shadow's content lives inside the entry and is
/// released (closed, then the staging file unlinked) by `Drop`, mirroring
/// the original's free-callback invoked by the tree on remove.
use crate::fs::ShadowFs;
use compact_str::CompactString;
use std::path::PathBuf;

#[cfg(windows)]
use windows::Win32::Foundation::{CloseHandle, HANDLE};

/// A pinned, in-flight shadow of a file that was seen in the source tree
/// but not yet known to have been deleted or renamed away.
pub struct ShadowEntry {
    /// Original-case relative path, preserved for backup-tree reconstruction.
    pub display_path: CompactString,
    /// Absolute path of the shadow link inside the staging area.
    pub temp_path: PathBuf,
    #[cfg(windows)]
    handle: HANDLE,
    /// Filesystem capability used to unlink the staging file on drop.
    fs: std::sync::Arc<dyn ShadowFs>,
}

impl ShadowEntry {
    #[cfg(windows)]
    pub(crate) fn new(
        display_path: impl Into<CompactString>,
        temp_path: PathBuf,
        handle: HANDLE,
        fs: std::sync::Arc<dyn ShadowFs>,
    ) -> Self {
        ShadowEntry {
            display_path: display_path.into(),
            temp_path,
            handle,
            fs,
        }
    }

    #[cfg(not(windows))]
    pub(crate) fn new(
        display_path: impl Into<CompactString>,
        temp_path: PathBuf,
        fs: std::sync::Arc<dyn ShadowFs>,
    ) -> Self {
        ShadowEntry {
            display_path: display_path.into(),
            temp_path,
            fs,
        }
    }
}

impl Drop for ShadowEntry {
    fn drop(&mut self) {
        #[cfg(windows)]
        unsafe {
            let _ = CloseHandle(self.handle);
        }
        let _ = self.fs.remove_file(&self.temp_path);
    }
}
