/// §4.4.2 — the IOCP worker pool. Each of `2 * cpu_count` worker threads
/// waits on a shared completion port, decodes the `FILE_NOTIFY_INFORMATION`
/// chain delivered into its own scratch buffer, dispatches each record to
/// [`ShadowEngine::create_shadow`]/[`ShadowEngine::promote_shadow`], and
/// re-arms its own overlapped read.
///
/// Slot demultiplexing follows the standard completion-port technique:
/// each slot's `OVERLAPPED` is the first field of a `#[repr(C)]` wrapper
/// that also carries the slot's index, so the pointer `GetQueuedCompletionStatus`
/// hands back can be cast straight back to the wrapper.
use super::ShadowEngine;
use crate::console::{log_colored, ConsoleColor};
use crate::error::{Result, ShadowError};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{error, warn};

use windows::core::PCWSTR;
use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::Storage::FileSystem::{
    CreateFileW, ReadDirectoryChangesW, FILE_ACTION_ADDED, FILE_ACTION_MODIFIED,
    FILE_ACTION_REMOVED, FILE_ACTION_RENAMED_NEW_NAME, FILE_ACTION_RENAMED_OLD_NAME,
    FILE_FLAGS_AND_ATTRIBUTES, FILE_FLAG_BACKUP_SEMANTICS, FILE_FLAG_OVERLAPPED,
    FILE_LIST_DIRECTORY, FILE_NOTIFY_CHANGE_DIR_NAME, FILE_NOTIFY_CHANGE_FILE_NAME,
    FILE_NOTIFY_INFORMATION, FILE_SHARE_DELETE, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows::Win32::System::IO::{CreateIoCompletionPort, PostQueuedCompletionStatus, OVERLAPPED};

/// Per-worker scratch buffer size for a single change-notification batch.
pub const WORKER_SCRATCH_BUFFER_SIZE: usize = 4096;

/// A worker's overlapped state, with the slot index carried alongside so
/// the completion port's returned `OVERLAPPED*` can be cast back to find
/// out which slot completed.
#[repr(C)]
struct SlotOverlapped {
    overlapped: OVERLAPPED,
    slot_index: usize,
}

struct WorkerSlot {
    scratch: Box<[u8; WORKER_SCRATCH_BUFFER_SIZE]>,
    state: Box<SlotOverlapped>,
}

pub struct WorkerPool {
    source_handle: HANDLE,
    completion_port: HANDLE,
    workers: Vec<JoinHandle<()>>,
}

// SAFETY: HANDLE is a plain kernel handle value; the pool only ever reads
// it across threads, never mutates the HANDLE itself.
unsafe impl Send for WorkerPool {}

impl WorkerPool {
    pub fn start(engine: Arc<ShadowEngine>) -> Result<WorkerPool> {
        let wide_path: Vec<u16> = engine
            .source_dir()
            .as_os_str()
            .to_string_lossy()
            .encode_utf16()
            .chain(std::iter::once(0u16))
            .collect();

        let source_handle = unsafe {
            CreateFileW(
                PCWSTR::from_raw(wide_path.as_ptr()),
                FILE_LIST_DIRECTORY.0,
                FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
                None,
                OPEN_EXISTING,
                FILE_FLAGS_AND_ATTRIBUTES(FILE_FLAG_BACKUP_SEMANTICS.0 | FILE_FLAG_OVERLAPPED.0),
                None,
            )
        }
        .map_err(|_| ShadowError::ReadDirectoryFailed)?;

        let completion_port = unsafe { CreateIoCompletionPort(source_handle, None, 0, 0) }
            .map_err(|_| ShadowError::ReadDirectoryFailed)?;

        let worker_count = (2 * num_cpus::get()).max(2);
        let mut workers = Vec::with_capacity(worker_count);

        for slot_index in 0..worker_count {
            let mut slot = WorkerSlot {
                scratch: Box::new([0u8; WORKER_SCRATCH_BUFFER_SIZE]),
                state: Box::new(SlotOverlapped {
                    overlapped: OVERLAPPED::default(),
                    slot_index,
                }),
            };
            arm_read(source_handle, &mut slot)?;

            let engine = Arc::clone(&engine);
            let handle = std::thread::Builder::new()
                .name(format!("shadow-worker-{slot_index}"))
                .spawn(move || worker_loop(engine, source_handle, completion_port, slot))
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }

        Ok(WorkerPool {
            source_handle,
            completion_port,
            workers,
        })
    }

    /// §4.4.6 — posts one zero-byte synthetic completion per worker, waits
    /// for each to exit, then closes the source handle and completion port.
    pub fn stop(mut self) {
        for _ in &self.workers {
            unsafe {
                let _ = PostQueuedCompletionStatus(self.completion_port, 0, 0, None);
            }
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        unsafe {
            let _ = CloseHandle(self.source_handle);
            let _ = CloseHandle(self.completion_port);
        }
    }
}

fn arm_read(source_handle: HANDLE, slot: &mut WorkerSlot) -> Result<()> {
    slot.state.overlapped = OVERLAPPED::default();
    let filter = FILE_NOTIFY_CHANGE_FILE_NAME | FILE_NOTIFY_CHANGE_DIR_NAME;
    let result = unsafe {
        ReadDirectoryChangesW(
            source_handle,
            slot.scratch.as_mut_ptr() as *mut core::ffi::c_void,
            slot.scratch.len() as u32,
            true,
            filter,
            None,
            Some(&mut slot.state.overlapped),
            None,
        )
    };
    // ERROR_IO_PENDING is expected for an overlapped request; any other
    // failure means the directory handle itself is bad.
    if let Err(e) = result {
        if e.code().0 as u32 != 0x8007_03E5 {
            return Err(ShadowError::ReadDirectoryFailed);
        }
    }
    Ok(())
}

fn worker_loop(
    engine: Arc<ShadowEngine>,
    source_handle: HANDLE,
    completion_port: HANDLE,
    mut slot: WorkerSlot,
) {
    use windows::Win32::System::IO::GetQueuedCompletionStatus;

    loop {
        let mut bytes_transferred: u32 = 0;
        let mut completion_key: usize = 0;
        let mut overlapped_ptr: *mut OVERLAPPED = std::ptr::null_mut();

        let status = unsafe {
            GetQueuedCompletionStatus(
                completion_port,
                &mut bytes_transferred,
                &mut completion_key,
                &mut overlapped_ptr,
                u32::MAX,
            )
        };

        if overlapped_ptr.is_null() {
            // Synthetic shutdown completion posted by `WorkerPool::stop`.
            return;
        }
        if status.is_err() || bytes_transferred == 0 {
            return;
        }

        parse_and_dispatch(&engine, &slot.scratch[..bytes_transferred as usize]);

        if arm_read(source_handle, &mut slot).is_err() {
            error!("worker failed to re-arm directory read, exiting");
            return;
        }
    }
}

fn parse_and_dispatch(engine: &Arc<ShadowEngine>, buffer: &[u8]) {
    let mut offset = 0usize;
    // Fixed portion of FILE_NOTIFY_INFORMATION preceding the variable-length
    // FileName array: NextEntryOffset, Action, FileNameLength, each a u32.
    const FIXED_HEADER: usize = 12;

    loop {
        if offset + FIXED_HEADER > buffer.len() {
            break;
        }

        // SAFETY: `buffer` holds a kernel-filled chain of correctly
        // aligned FILE_NOTIFY_INFORMATION records.
        let fni = unsafe { &*(buffer.as_ptr().add(offset) as *const FILE_NOTIFY_INFORMATION) };
        let name_chars = fni.FileNameLength as usize / 2;

        // §4.4.2 step 3: if the filename plus header would overrun the
        // scratch buffer, the batch is malformed/truncated -- stop parsing.
        if offset + FIXED_HEADER + fni.FileNameLength as usize > buffer.len() {
            break;
        }

        let name_slice =
            unsafe { std::slice::from_raw_parts(&fni.FileName as *const u16, name_chars) };
        let relative_name = String::from_utf16_lossy(name_slice).replace('\\', "/");
        let absolute = engine.source_dir().join(&relative_name);

        if let Ok((_, display_path)) = engine.relative_of(&absolute) {
            dispatch_action(engine, fni.Action, &display_path, &absolute);
        }

        if fni.NextEntryOffset == 0 {
            break;
        }
        offset += fni.NextEntryOffset as usize;
    }
}

fn dispatch_action(engine: &Arc<ShadowEngine>, action: u32, display_path: &str, _absolute: &PathBuf) {
    match action {
        a if a == FILE_ACTION_ADDED.0 || a == FILE_ACTION_RENAMED_NEW_NAME.0 => {
            if let Err(e) = engine.create_shadow(display_path) {
                log_and_skip(display_path, &e);
            }
        }
        a if a == FILE_ACTION_REMOVED.0 || a == FILE_ACTION_RENAMED_OLD_NAME.0 => {
            if let Err(e) = engine.promote_shadow(display_path) {
                log_and_skip(display_path, &e);
            }
        }
        a if a == FILE_ACTION_MODIFIED.0 => {
            // Observed but not acted on -- the shadow already pins the
            // content from ADDED; MODIFIED doesn't change what's promoted.
            log_observed(display_path, "modified");
        }
        other => log_observed(display_path, &format!("action {other}")),
    }
}

fn log_observed(display_path: &str, what: &str) {
    log_colored(ConsoleColor::Cyan, format!("{display_path}: {what}"));
}

fn log_and_skip(display_path: &str, err: &ShadowError) {
    warn!(path = display_path, error = %err, "event skipped");
    log_colored(ConsoleColor::Red, format!("{display_path}: {err}"));
}
