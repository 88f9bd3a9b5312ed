/// Console drain — a single background thread that pulls colored log
/// records from a [`RingQueue`] and writes them to the console, restoring
/// the default text attribute after each record.
///
/// Grounded in `original_source/src/CommonLib/ConsolePrinter.cpp`: a
/// dedicated dispatcher thread, a start/stop handshake event so
/// construction doesn't return until the thread is actually running, a
/// stop event the destructor signals, and per-thread console-context
/// association (the original's `_declspec(thread)` pointer, here a
/// `thread_local!` binding to an `Arc<ConsoleDrain>`).
use crate::ring::RingQueue;
use compact_str::CompactString;
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;

/// Longest message a single console record carries (UTF-16 code units in
/// the original; here, `char`s -- truncated at construction).
pub const CONSOLE_MESSAGE_MAX_CHARS: usize = 511;

/// Color attribute for a console record. Maps onto
/// `SetConsoleTextAttribute`'s foreground bits; rendering of the *name* of
/// an event/color is an excluded external concern (spec.md §1) -- only the
/// enum-to-attribute mapping lives here.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsoleColor {
    Default,
    Green,
    Yellow,
    Red,
    Cyan,
}

impl ConsoleColor {
    #[cfg(windows)]
    fn to_attribute(self, default: u16) -> u16 {
        use windows::Win32::System::Console::{
            FOREGROUND_GREEN, FOREGROUND_INTENSITY, FOREGROUND_RED,
        };
        match self {
            ConsoleColor::Default => default,
            ConsoleColor::Green => (FOREGROUND_GREEN | FOREGROUND_INTENSITY).0 as u16,
            ConsoleColor::Yellow => {
                (FOREGROUND_GREEN | FOREGROUND_RED | FOREGROUND_INTENSITY).0 as u16
            }
            ConsoleColor::Red => (FOREGROUND_RED | FOREGROUND_INTENSITY).0 as u16,
            ConsoleColor::Cyan => (FOREGROUND_GREEN | windows::Win32::System::Console::FOREGROUND_BLUE | FOREGROUND_INTENSITY).0 as u16,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConsoleRecord {
    pub color: ConsoleColor,
    pub message: CompactString,
}

impl ConsoleRecord {
    pub fn new(color: ConsoleColor, message: impl Into<CompactString>) -> Self {
        let mut message: CompactString = message.into();
        if message.chars().count() > CONSOLE_MESSAGE_MAX_CHARS {
            let truncated: String = message.chars().take(CONSOLE_MESSAGE_MAX_CHARS).collect();
            message = CompactString::from(truncated);
        }
        ConsoleRecord { color, message }
    }

    fn encode(&self) -> Vec<u8> {
        // `{ color_code: u8, utf8 message bytes }`. The console message
        // cap is enforced in `ConsoleRecord::new`, so this never exceeds a
        // few hundred bytes -- well inside a page-sized ring.
        let mut buf = Vec::with_capacity(1 + self.message.len());
        buf.push(self.color as u8);
        buf.extend_from_slice(self.message.as_bytes());
        buf
    }

    fn decode(bytes: &[u8]) -> Option<ConsoleRecord> {
        let (&code, rest) = bytes.split_first()?;
        let color = match code {
            0 => ConsoleColor::Default,
            1 => ConsoleColor::Green,
            2 => ConsoleColor::Yellow,
            3 => ConsoleColor::Red,
            4 => ConsoleColor::Cyan,
            _ => ConsoleColor::Default,
        };
        let message = String::from_utf8_lossy(rest).into_owned();
        Some(ConsoleRecord::new(color, message))
    }
}

/// A "work available" signal the drain thread parks on between drains.
struct WorkSignal {
    mutex: Mutex<bool>,
    condvar: Condvar,
}

impl WorkSignal {
    fn new() -> Self {
        WorkSignal {
            mutex: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn signal(&self) {
        let mut ready = self.mutex.lock();
        *ready = true;
        self.condvar.notify_one();
    }

    /// Waits for the signal, clearing it (auto-reset), or returns `false`
    /// if `terminating` became true while waiting.
    fn wait(&self, terminating: &AtomicBool) -> bool {
        let mut ready = self.mutex.lock();
        while !*ready {
            if terminating.load(Ordering::Acquire) {
                return false;
            }
            self.condvar.wait(&mut ready);
        }
        *ready = false;
        true
    }
}

pub struct ConsoleDrain {
    queue: RingQueue,
    signal: WorkSignal,
    terminating: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ConsoleDrain {
    /// Spawns the background drain thread and waits for it to report
    /// ready, mirroring the original's start/stop handshake.
    pub fn spawn() -> Arc<ConsoleDrain> {
        let drain = Arc::new(ConsoleDrain {
            queue: RingQueue::with_default_capacity(),
            signal: WorkSignal::new(),
            terminating: AtomicBool::new(false),
            thread: Mutex::new(None),
        });

        let worker = Arc::clone(&drain);
        let handle = std::thread::Builder::new()
            .name("shadow-console".to_owned())
            .spawn(move || worker.pump())
            .expect("failed to spawn console drain thread");
        *drain.thread.lock() = Some(handle);
        drain
    }

    fn pump(&self) {
        #[cfg(windows)]
        let default_attribute = current_console_attribute();

        loop {
            let had_work = self.signal.wait(&self.terminating);
            self.queue.drain(|bytes| {
                if let Some(record) = ConsoleRecord::decode(bytes) {
                    #[cfg(windows)]
                    write_colored(&record, default_attribute);
                    #[cfg(not(windows))]
                    println!("{}", record.message);
                }
            });
            // The thread exits only after observing `terminating` *following*
            // a drain pass, so no record enqueued before shutdown is lost.
            if !had_work && self.terminating.load(Ordering::Acquire) {
                return;
            }
        }
    }

    /// Enqueues a record for the background thread to print. Best-effort:
    /// under sustained overload `RingQueue::push` may drop the record,
    /// which is by design (log delivery is not correctness-critical).
    pub fn print(&self, color: ConsoleColor, message: impl Into<CompactString>) {
        let record = ConsoleRecord::new(color, message);
        let _ = self.queue.push(&record.encode());
        self.signal.signal();
    }

    pub fn shutdown(&self) {
        self.terminating.store(true, Ordering::Release);
        self.signal.signal();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ConsoleDrain {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(windows)]
fn current_console_attribute() -> u16 {
    use windows::Win32::System::Console::{
        GetConsoleScreenBufferInfo, GetStdHandle, CONSOLE_SCREEN_BUFFER_INFO, STD_OUTPUT_HANDLE,
    };
    unsafe {
        let handle = match GetStdHandle(STD_OUTPUT_HANDLE) {
            Ok(h) => h,
            Err(_) => return 0,
        };
        let mut info = CONSOLE_SCREEN_BUFFER_INFO::default();
        if GetConsoleScreenBufferInfo(handle, &mut info).is_ok() {
            info.wAttributes.0
        } else {
            0
        }
    }
}

#[cfg(windows)]
fn write_colored(record: &ConsoleRecord, default_attribute: u16) {
    use windows::Win32::System::Console::{
        GetStdHandle, SetConsoleTextAttribute, CONSOLE_CHARACTER_ATTRIBUTES, STD_OUTPUT_HANDLE,
    };
    unsafe {
        let Ok(handle) = GetStdHandle(STD_OUTPUT_HANDLE) else {
            return;
        };
        let attribute = record.color.to_attribute(default_attribute);
        let _ = SetConsoleTextAttribute(handle, CONSOLE_CHARACTER_ATTRIBUTES(attribute));
        println!("{}", record.message);
        let _ = SetConsoleTextAttribute(handle, CONSOLE_CHARACTER_ATTRIBUTES(default_attribute));
    }
}

thread_local! {
    static BOUND_CONSOLE: RefCell<Option<Arc<ConsoleDrain>>> = const { RefCell::new(None) };
}

static DEFAULT_CONSOLE: OnceLock<Arc<ConsoleDrain>> = OnceLock::new();

/// Installs the process-default console drain, used by any thread that
/// never calls [`bind_console`]. Idempotent.
pub fn install_default_console() -> Arc<ConsoleDrain> {
    Arc::clone(DEFAULT_CONSOLE.get_or_init(ConsoleDrain::spawn))
}

/// Binds the calling thread to `drain`; `log_colored` on this thread will
/// resolve to it instead of the process default.
pub fn bind_console(drain: Arc<ConsoleDrain>) {
    BOUND_CONSOLE.with(|cell| *cell.borrow_mut() = Some(drain));
}

fn current_console() -> Arc<ConsoleDrain> {
    BOUND_CONSOLE.with(|cell| cell.borrow().clone()).unwrap_or_else(install_default_console)
}

/// Logs a colored line through the calling thread's bound console (or the
/// process default if unbound).
pub fn log_colored(color: ConsoleColor, message: impl Into<CompactString>) {
    current_console().print(color, message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn record_roundtrips_through_encode_decode() {
        let record = ConsoleRecord::new(ConsoleColor::Green, "hello world");
        let decoded = ConsoleRecord::decode(&record.encode()).unwrap();
        assert_eq!(decoded.color, ConsoleColor::Green);
        assert_eq!(decoded.message, "hello world");
    }

    #[test]
    fn record_truncates_overlong_messages() {
        let long = "x".repeat(CONSOLE_MESSAGE_MAX_CHARS + 100);
        let record = ConsoleRecord::new(ConsoleColor::Default, long);
        assert_eq!(record.message.chars().count(), CONSOLE_MESSAGE_MAX_CHARS);
    }

    #[test]
    fn work_signal_wakes_waiter() {
        let signal = Arc::new(WorkSignal::new());
        let terminating = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();

        let s = Arc::clone(&signal);
        let t = Arc::clone(&terminating);
        std::thread::spawn(move || {
            let woke = s.wait(&t);
            tx.send(woke).unwrap();
        });

        std::thread::sleep(Duration::from_millis(20));
        signal.signal();
        assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());
    }

    #[test]
    fn work_signal_unblocks_on_terminate_without_signal() {
        let signal = Arc::new(WorkSignal::new());
        let terminating = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();

        let s = Arc::clone(&signal);
        let t = Arc::clone(&terminating);
        std::thread::spawn(move || {
            let woke = s.wait(&t);
            tx.send(woke).unwrap();
        });

        std::thread::sleep(Duration::from_millis(20));
        terminating.store(true, Ordering::Release);
        signal.signal();
        assert!(!rx.recv_timeout(Duration::from_secs(2)).unwrap());
    }
}
