/// Service-control-manager watcher — the concrete consumer of the
/// monitor-dispatcher (C6) demonstrated by `svcwatch-cli`.
///
/// Grounded in `original_source/src/SCMonitor/ServicesMonitor.h`'s
/// `ServicesMonitor`: enumerates installed services into a name-keyed map
/// on startup, subscribes to a manager-level create/delete notification
/// and a per-service state-change notification, and routes every
/// notification through the shared [`Dispatcher`] pump so subscriber
/// callbacks never run concurrently with each other. The header's
/// `NotificationContext`/`ManagerNotificationContext` pair a `SERVICE_NOTIFYW`
/// buffer with back-pointers to the owning service; this module does the
/// same thing with an owned key instead of a raw back-pointer, since the
/// lookup happens through `services`/`service_notifies` rather than
/// self-referential C structs. The bitmask-to-text rendering helpers in the
/// original's `SCMonitor.cpp` (`ServiceTypeToUnicode` and friends) are
/// external presentation concerns, out of scope here.
use crate::dispatcher::Dispatcher;
use crate::error::{Result, ShadowError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

#[cfg(windows)]
use windows::Win32::System::Services::SERVICE_STATUS_PROCESS;

#[cfg(not(windows))]
#[derive(Clone, Copy, Debug, Default)]
pub struct ServiceStatusProcess {
    pub current_state: u32,
}

#[cfg(windows)]
pub type ServiceStatusProcess = SERVICE_STATUS_PROCESS;

/// `(trigger_flags, name, old_status, new_status)` delivered to every
/// subscriber on a per-service state-change callback.
pub type ServiceNotificationCallback =
    Arc<dyn Fn(u32, &str, ServiceStatusProcess, ServiceStatusProcess) + Send + Sync>;

struct ServiceEntry {
    registered: bool,
    status: ServiceStatusProcess,
    #[cfg(windows)]
    handle: Option<windows::Win32::System::Services::SC_HANDLE>,
}

/// Watches the service control manager for service creation/deletion and
/// per-service state changes, fanning each notification out to subscribers
/// through a single-pump [`Dispatcher`].
pub struct ServiceWatcher {
    dispatcher: Arc<Dispatcher>,
    services: Mutex<HashMap<String, ServiceEntry>>,
    subscribers: Mutex<Vec<ServiceNotificationCallback>>,
    #[cfg(windows)]
    manager: windows::Win32::System::Services::SC_HANDLE,
    #[cfg(windows)]
    manager_notify: Mutex<Option<Box<NotifyState>>>,
    #[cfg(windows)]
    service_notifies: Mutex<HashMap<String, Box<NotifyState>>>,
    #[cfg(windows)]
    running: std::sync::atomic::AtomicBool,
    #[cfg(windows)]
    notify_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    #[cfg(windows)]
    notify_thread_handle: Mutex<Option<windows::Win32::Foundation::HANDLE>>,
}

// SAFETY: SC_HANDLE is an opaque kernel handle; it's only ever read, not
// mutated, from the notification threads that deliver against it.
#[cfg(windows)]
unsafe impl Send for ServiceWatcher {}
#[cfg(windows)]
unsafe impl Sync for ServiceWatcher {}

/// Mirrors `ServicesMonitor::NotificationContext`/`ManagerNotificationContext`:
/// the `SERVICE_NOTIFYW` buffer the SCM writes notification results into.
/// Kept boxed so its address stays stable across re-arms.
#[cfg(windows)]
struct NotifyState {
    notify: windows::Win32::System::Services::SERVICE_NOTIFYW,
}

#[cfg(windows)]
impl Default for NotifyState {
    fn default() -> Self {
        NotifyState {
            notify: windows::Win32::System::Services::SERVICE_NOTIFYW::default(),
        }
    }
}

#[cfg(windows)]
enum NotifyKey {
    Manager,
    Service(String),
}

/// `pContext` payload: identifies which registration fired so the trampoline
/// can route back into the watcher without a self-referential pointer.
#[cfg(windows)]
struct NotifyContext {
    watcher: Arc<ServiceWatcher>,
    key: NotifyKey,
}

#[cfg(windows)]
const ERROR_SERVICE_MARKED_FOR_DELETE_CODE: u32 = 1072;

#[cfg(windows)]
const MANAGER_NOTIFY_MASK: u32 = windows::Win32::System::Services::SERVICE_NOTIFY_CREATED
    | windows::Win32::System::Services::SERVICE_NOTIFY_DELETED;

/// Per-service state-change mask. Mirrors the header's `s_serviceNotifyMask`.
#[cfg(windows)]
const SERVICE_NOTIFY_MASK: u32 = windows::Win32::System::Services::SERVICE_NOTIFY_STOPPED
    | windows::Win32::System::Services::SERVICE_NOTIFY_START_PENDING
    | windows::Win32::System::Services::SERVICE_NOTIFY_STOP_PENDING
    | windows::Win32::System::Services::SERVICE_NOTIFY_RUNNING
    | windows::Win32::System::Services::SERVICE_NOTIFY_CONTINUE_PENDING
    | windows::Win32::System::Services::SERVICE_NOTIFY_PAUSE_PENDING
    | windows::Win32::System::Services::SERVICE_NOTIFY_PAUSED
    | windows::Win32::System::Services::SERVICE_NOTIFY_DELETE_PENDING;

impl ServiceWatcher {
    #[cfg(windows)]
    pub fn new() -> Result<Arc<ServiceWatcher>> {
        use windows::Win32::System::Services::{
            OpenSCManagerW, SC_MANAGER_CONNECT, SC_MANAGER_ENUMERATE_SERVICE,
        };

        let manager = unsafe {
            OpenSCManagerW(
                None,
                None,
                SC_MANAGER_CONNECT | SC_MANAGER_ENUMERATE_SERVICE,
            )
        }
        .map_err(|_| ShadowError::CapabilityDenied)?;

        Ok(Arc::new(ServiceWatcher {
            dispatcher: Dispatcher::new(),
            services: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            manager,
            manager_notify: Mutex::new(None),
            service_notifies: Mutex::new(HashMap::new()),
            running: std::sync::atomic::AtomicBool::new(false),
            notify_thread: Mutex::new(None),
            notify_thread_handle: Mutex::new(None),
        }))
    }

    pub fn subscribe(&self, callback: ServiceNotificationCallback) {
        self.subscribers.lock().push(callback);
    }

    pub fn service_count(&self) -> usize {
        self.services.lock().len()
    }

    /// Routes `notification` through the dispatcher so every subscriber
    /// callback runs on the single pump thread, never concurrently with
    /// another notification.
    fn fan_out(
        self: &Arc<Self>,
        trigger: u32,
        name: String,
        old_status: ServiceStatusProcess,
        new_status: ServiceStatusProcess,
    ) {
        let watcher = Arc::clone(self);
        self.dispatcher.push_callback(move || {
            for subscriber in watcher.subscribers.lock().iter() {
                subscriber(trigger, &name, old_status, new_status);
            }
        });
    }

    pub fn remove_service(&self, name: &str) {
        self.services.lock().remove(name);
    }

    #[cfg(windows)]
    fn enumerate_services(&self) -> Result<()> {
        use windows::Win32::System::Services::{
            EnumServicesStatusExW, OpenServiceW, ENUM_SERVICE_STATUS_PROCESSW,
            SC_ENUM_PROCESS_INFO, SERVICE_QUERY_STATUS, SERVICE_STATE_ALL, SERVICE_WIN32,
        };
        use windows::core::PCWSTR;

        let mut bytes_needed: u32 = 0;
        let mut services_returned: u32 = 0;
        let mut resume_handle: u32 = 0;

        // First call sizes the buffer; ERROR_MORE_DATA is expected here.
        unsafe {
            let _ = EnumServicesStatusExW(
                self.manager,
                SC_ENUM_PROCESS_INFO,
                SERVICE_WIN32,
                SERVICE_STATE_ALL,
                None,
                &mut bytes_needed,
                &mut services_returned,
                Some(&mut resume_handle),
                None,
            );
        }
        if bytes_needed == 0 {
            return Ok(());
        }

        let mut buffer = vec![0u8; bytes_needed as usize];
        resume_handle = 0;
        unsafe {
            EnumServicesStatusExW(
                self.manager,
                SC_ENUM_PROCESS_INFO,
                SERVICE_WIN32,
                SERVICE_STATE_ALL,
                Some(&mut buffer),
                &mut bytes_needed,
                &mut services_returned,
                Some(&mut resume_handle),
                None,
            )
        }
        .map_err(|_| ShadowError::Transient { code: 0 })?;

        let entries = unsafe {
            std::slice::from_raw_parts(
                buffer.as_ptr() as *const ENUM_SERVICE_STATUS_PROCESSW,
                services_returned as usize,
            )
        };

        let mut services = self.services.lock();
        for entry in entries {
            let name = unsafe { entry.lpServiceName.to_string() }.unwrap_or_default();
            let handle = unsafe {
                OpenServiceW(
                    self.manager,
                    PCWSTR::from_raw(entry.lpServiceName.0),
                    SERVICE_QUERY_STATUS,
                )
            }
            .ok();
            if handle.is_none() {
                warn!(service = %name, "failed to open handle for enumerated service");
            }
            services.insert(
                name,
                ServiceEntry {
                    registered: true,
                    status: entry.ServiceStatusProcess,
                    handle,
                },
            );
        }
        info!(count = services.len(), "enumerated installed services");
        Ok(())
    }

    /// Registers (or re-registers) the manager-level create/delete
    /// notification. Mirrors `InstallSCMNotification`.
    #[cfg(windows)]
    fn arm_manager_notification(self: &Arc<Self>) {
        use windows::Win32::System::Services::{
            NotifyServiceStatusChangeW, SERVICE_NOTIFY_STATUS_CHANGE,
        };

        let context = Box::into_raw(Box::new(NotifyContext {
            watcher: Arc::clone(self),
            key: NotifyKey::Manager,
        })) as *mut std::ffi::c_void;

        let mut guard = self.manager_notify.lock();
        let state = guard.get_or_insert_with(|| Box::new(NotifyState::default()));
        state.notify.dwVersion = SERVICE_NOTIFY_STATUS_CHANGE;
        state.notify.pfnNotifyCallback = Some(scm_notify_trampoline);
        state.notify.pContext = context;

        let result =
            unsafe { NotifyServiceStatusChangeW(self.manager, MANAGER_NOTIFY_MASK, &mut state.notify) };
        drop(guard);

        if let Err(e) = result {
            warn!(error = %e, "failed to arm manager-level service notification");
            unsafe { drop(Box::from_raw(context as *mut NotifyContext)) };
        }
    }

    /// Registers (or re-registers) a per-service state-change notification.
    /// On `ERROR_SERVICE_MARKED_FOR_DELETE`, closes the handle and leaves the
    /// entry unregistered — the manager-level `SERVICE_NOTIFY_DELETED`
    /// callback is what finally removes it from `services`. Mirrors
    /// `InstallServicesNotification`.
    #[cfg(windows)]
    fn arm_service_notification(
        self: &Arc<Self>,
        name: &str,
        handle: windows::Win32::System::Services::SC_HANDLE,
    ) {
        use windows::Win32::System::Services::{
            NotifyServiceStatusChangeW, SERVICE_NOTIFY_STATUS_CHANGE,
        };

        let context = Box::into_raw(Box::new(NotifyContext {
            watcher: Arc::clone(self),
            key: NotifyKey::Service(name.to_owned()),
        })) as *mut std::ffi::c_void;

        let mut states = self.service_notifies.lock();
        let state = states
            .entry(name.to_owned())
            .or_insert_with(|| Box::new(NotifyState::default()));
        state.notify.dwVersion = SERVICE_NOTIFY_STATUS_CHANGE;
        state.notify.pfnNotifyCallback = Some(scm_notify_trampoline);
        state.notify.pContext = context;

        let result =
            unsafe { NotifyServiceStatusChangeW(handle, SERVICE_NOTIFY_MASK, &mut state.notify) };
        drop(states);

        match result {
            Ok(()) => {}
            Err(e) if e.code().0 as u32 == ERROR_SERVICE_MARKED_FOR_DELETE_CODE => {
                unsafe { drop(Box::from_raw(context as *mut NotifyContext)) };
                self.mark_service_unregistered(name);
            }
            Err(e) => {
                warn!(service = name, error = %e, "failed to arm per-service notification");
                unsafe { drop(Box::from_raw(context as *mut NotifyContext)) };
            }
        }
    }

    #[cfg(windows)]
    fn mark_service_unregistered(&self, name: &str) {
        let mut services = self.services.lock();
        if let Some(entry) = services.get_mut(name) {
            if let Some(handle) = entry.handle.take() {
                unsafe {
                    let _ = windows::Win32::System::Services::CloseServiceHandle(handle);
                }
            }
            entry.registered = false;
        }
        drop(services);
        self.service_notifies.lock().remove(name);
    }

    #[cfg(windows)]
    fn remove_service_fully(&self, name: &str) {
        if let Some(entry) = self.services.lock().remove(name) {
            if let Some(handle) = entry.handle {
                unsafe {
                    let _ = windows::Win32::System::Services::CloseServiceHandle(handle);
                }
            }
        }
        self.service_notifies.lock().remove(name);
    }

    /// Opens and tracks a service that appeared after startup, then arms its
    /// per-service notification. Mirrors `ServicesMonitor::InsertService`
    /// called from the manager-level `SERVICE_NOTIFY_CREATED` path.
    #[cfg(windows)]
    fn adopt_service(self: &Arc<Self>, name: &str) {
        use windows::Win32::System::Services::{OpenServiceW, SERVICE_QUERY_STATUS};
        use windows::core::PCWSTR;

        let wide: Vec<u16> = name.encode_utf16().chain(std::iter::once(0)).collect();
        let Ok(handle) =
            (unsafe { OpenServiceW(self.manager, PCWSTR::from_raw(wide.as_ptr()), SERVICE_QUERY_STATUS) })
        else {
            warn!(service = name, "failed to open newly created service");
            return;
        };

        self.services.lock().insert(
            name.to_owned(),
            ServiceEntry {
                registered: true,
                status: ServiceStatusProcess::default(),
                handle: Some(handle),
            },
        );
        self.arm_service_notification(name, handle);
    }

    #[cfg(windows)]
    fn on_manager_notification(self: &Arc<Self>) {
        let (triggered, names) = {
            let guard = self.manager_notify.lock();
            match guard.as_ref() {
                Some(state) => (
                    state.notify.dwNotificationTriggered,
                    read_service_names(state.notify.pszServiceNames),
                ),
                None => return,
            }
        };

        for name in names {
            if triggered & windows::Win32::System::Services::SERVICE_NOTIFY_DELETED != 0 {
                self.remove_service_fully(&name);
                self.fan_out(
                    windows::Win32::System::Services::SERVICE_NOTIFY_DELETED,
                    name,
                    ServiceStatusProcess::default(),
                    ServiceStatusProcess::default(),
                );
            } else if triggered & windows::Win32::System::Services::SERVICE_NOTIFY_CREATED != 0 {
                self.adopt_service(&name);
                self.fan_out(
                    windows::Win32::System::Services::SERVICE_NOTIFY_CREATED,
                    name,
                    ServiceStatusProcess::default(),
                    ServiceStatusProcess::default(),
                );
            }
        }

        self.arm_manager_notification();
    }

    #[cfg(windows)]
    fn on_service_notification(self: &Arc<Self>, name: &str) {
        let (triggered, new_status) = {
            let guard = self.service_notifies.lock();
            match guard.get(name) {
                Some(state) => (
                    state.notify.dwNotificationTriggered,
                    state.notify.ServiceStatus,
                ),
                None => return,
            }
        };
        let (old_status, handle) = {
            let mut services = self.services.lock();
            match services.get_mut(name) {
                Some(entry) => {
                    let old = entry.status;
                    entry.status = new_status;
                    (old, entry.handle)
                }
                None => return,
            }
        };

        self.fan_out(triggered, name.to_owned(), old_status, new_status);

        if let Some(handle) = handle {
            self.arm_service_notification(name, handle);
        }
    }

    /// Spawns the dedicated alertable-wait thread that registers the manager-
    /// and service-level notifications and pumps their callbacks. Every
    /// `NotifyServiceStatusChangeW` registration (initial and re-arm) must
    /// run on this thread, since the SCM delivers the callback as an APC
    /// queued to whichever thread performed the registration.
    #[cfg(windows)]
    fn spawn_notify_thread(self: &Arc<Self>) {
        self.running
            .store(true, std::sync::atomic::Ordering::Release);

        let watcher = Arc::clone(self);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let handle = std::thread::Builder::new()
            .name("shadow-scm-notify".to_owned())
            .spawn(move || watcher.notify_pump(ready_tx))
            .expect("failed to spawn SCM notification thread");

        if let Ok(dup) = ready_rx.recv() {
            *self.notify_thread_handle.lock() = Some(dup);
        }
        *self.notify_thread.lock() = Some(handle);
    }

    #[cfg(windows)]
    fn notify_pump(self: Arc<Self>, ready: std::sync::mpsc::Sender<windows::Win32::Foundation::HANDLE>) {
        use windows::Win32::Foundation::HANDLE;
        use windows::Win32::System::Threading::{
            DuplicateHandle, GetCurrentProcess, GetCurrentThread, SleepEx, DUPLICATE_SAME_ACCESS,
        };

        let mut dup = HANDLE::default();
        unsafe {
            let process = GetCurrentProcess();
            let _ = DuplicateHandle(
                process,
                GetCurrentThread(),
                process,
                &mut dup,
                0,
                false,
                DUPLICATE_SAME_ACCESS,
            );
        }
        let _ = ready.send(dup);

        self.arm_manager_notification();
        let pending: Vec<(String, windows::Win32::System::Services::SC_HANDLE)> = self
            .services
            .lock()
            .iter()
            .filter_map(|(name, entry)| entry.handle.map(|h| (name.clone(), h)))
            .collect();
        for (name, handle) in pending {
            self.arm_service_notification(&name, handle);
        }

        while self.running.load(std::sync::atomic::Ordering::Acquire) {
            unsafe {
                SleepEx(windows::Win32::System::Threading::INFINITE, true);
            }
        }
    }

    #[cfg(windows)]
    fn stop_notify_thread(&self) {
        use windows::Win32::Foundation::CloseHandle;
        use windows::Win32::System::Threading::QueueUserAPC;

        self.running
            .store(false, std::sync::atomic::Ordering::Release);
        if let Some(handle) = self.notify_thread_handle.lock().take() {
            unsafe {
                // Wakes the notify thread out of its alertable wait so it
                // observes `running == false` and exits.
                let _ = QueueUserAPC(Some(noop_apc), handle, 0);
                let _ = CloseHandle(handle);
            }
        }
        if let Some(handle) = self.notify_thread.lock().take() {
            let _ = handle.join();
        }
    }

    /// Starts the dispatcher pump, performs the initial enumeration, and
    /// installs the live manager- and per-service-level notifications.
    #[cfg(windows)]
    pub fn start_monitoring(self: &Arc<Self>) -> Result<()> {
        self.enumerate_services()?;
        self.dispatcher.start_monitor();
        self.spawn_notify_thread();
        Ok(())
    }

    pub fn stop_monitoring(&self) {
        #[cfg(windows)]
        self.stop_notify_thread();
        self.dispatcher.stop_monitor();
    }
}

#[cfg(windows)]
unsafe extern "system" fn noop_apc(_: usize) {}

#[cfg(windows)]
unsafe extern "system" fn scm_notify_trampoline(context: *mut std::ffi::c_void) {
    let ctx = unsafe { Box::from_raw(context as *mut NotifyContext) };
    match &ctx.key {
        NotifyKey::Manager => ctx.watcher.on_manager_notification(),
        NotifyKey::Service(name) => ctx.watcher.on_service_notification(name),
    }
}

/// Parses the manager-level notification's `pszServiceNames`: consecutive
/// null-terminated names, terminated by an additional null character, each
/// optionally prefixed with a `/` (created) or `-` (deleted) marker.
#[cfg(windows)]
fn read_service_names(raw: windows::core::PWSTR) -> Vec<String> {
    if raw.is_null() {
        return Vec::new();
    }
    let mut names = Vec::new();
    let mut ptr = raw.0;
    unsafe {
        loop {
            let start = ptr;
            let mut len = 0usize;
            while *ptr != 0 {
                ptr = ptr.add(1);
                len += 1;
            }
            if len == 0 {
                break;
            }
            let slice = std::slice::from_raw_parts(start, len);
            let mut name = String::from_utf16_lossy(slice);
            if name.starts_with('/') || name.starts_with('-') {
                name.remove(0);
            }
            if !name.is_empty() {
                names.push(name);
            }
            ptr = ptr.add(1);
        }
    }
    names
}

#[cfg(not(windows))]
impl ServiceWatcher {
    /// Portable test construction: no live SCM connection, used to
    /// exercise subscriber fan-out and dispatcher ordering.
    pub fn new_for_test() -> Arc<ServiceWatcher> {
        Arc::new(ServiceWatcher {
            dispatcher: Dispatcher::new(),
            services: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    pub fn start_monitoring(self: &Arc<Self>) {
        self.dispatcher.start_monitor();
    }

    pub fn simulate_notification(
        self: &Arc<Self>,
        trigger: u32,
        name: &str,
        old_status: ServiceStatusProcess,
        new_status: ServiceStatusProcess,
    ) {
        self.fan_out(trigger, name.to_owned(), old_status, new_status);
    }
}
