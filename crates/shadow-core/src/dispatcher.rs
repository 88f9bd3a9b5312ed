/// Monitor-dispatcher framework (C6) — a single background pump thread
/// that serializes delivery of three kinds of notification: stop,
/// queued callback, and pause.
///
/// Grounded in `original_source/src/SCMonitor/ServicesMonitor.h`'s
/// `BaseMonitorDispatcher`: the `MonitorStates` state machine, the
/// `startStop`/`unlock`/`pauseAck` auto-reset events, one event per
/// `MonitorNotifications` kind, and an ordered callback queue under its
/// own mutex. `AutoResetEvent` stands in for the original's raw Win32
/// event `HANDLE`s so this core stays portable; [`crate::service_watcher`]
/// is the layer that plugs in real OS notifications above it.
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::warn;

/// A manual condvar-backed substitute for a Win32 auto-reset event handle:
/// `wait` blocks until signaled, then atomically clears the signal before
/// returning (mirroring `WaitForSingleObject` on an auto-reset event).
pub struct AutoResetEvent {
    mutex: Mutex<bool>,
    condvar: Condvar,
}

impl AutoResetEvent {
    pub fn new() -> Self {
        AutoResetEvent {
            mutex: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    pub fn signal(&self) {
        let mut signaled = self.mutex.lock();
        *signaled = true;
        self.condvar.notify_one();
    }

    pub fn wait(&self) {
        let mut signaled = self.mutex.lock();
        while !*signaled {
            self.condvar.wait(&mut signaled);
        }
        *signaled = false;
    }
}

impl Default for AutoResetEvent {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatcherState {
    Stopped,
    Started,
    Terminating,
}

type Callback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct NotifyBoard {
    stop_pending: bool,
    pause_pending: bool,
    callback_pending: bool,
}

enum Notification {
    Stop,
    Callback,
    Pause,
}

struct Control {
    state: DispatcherState,
    thread: Option<JoinHandle<()>>,
}

/// Single-pump dispatcher. Construct with [`Dispatcher::new`], call
/// [`Dispatcher::start_monitor`] to begin processing, [`Dispatcher::stop_monitor`]
/// to pause delivery (the pump thread stays alive, parked on `unlock`),
/// and drop the last `Arc` to tear the pump thread down entirely.
pub struct Dispatcher {
    control: Mutex<Control>,
    unlock: AutoResetEvent,
    start_stop: AutoResetEvent,
    pause_ack: AutoResetEvent,
    notify_board: Mutex<NotifyBoard>,
    notify_cv: Condvar,
    callbacks: Mutex<VecDeque<Callback>>,
    pause_gate: Mutex<()>,
}

impl Dispatcher {
    pub fn new() -> Arc<Dispatcher> {
        Arc::new(Dispatcher {
            control: Mutex::new(Control {
                state: DispatcherState::Stopped,
                thread: None,
            }),
            unlock: AutoResetEvent::new(),
            start_stop: AutoResetEvent::new(),
            pause_ack: AutoResetEvent::new(),
            notify_board: Mutex::new(NotifyBoard::default()),
            notify_cv: Condvar::new(),
            callbacks: Mutex::new(VecDeque::new()),
            pause_gate: Mutex::new(()),
        })
    }

    pub fn state(&self) -> DispatcherState {
        self.control.lock().state
    }

    /// Transitions `Stopped -> Started`, spawning the pump thread on first
    /// use. Re-entering `Started` from `Stopped` is permitted and just
    /// wakes the pump's outer loop.
    pub fn start_monitor(self: &Arc<Self>) {
        let mut control = self.control.lock();
        if control.state == DispatcherState::Terminating {
            return;
        }
        control.state = DispatcherState::Started;
        if control.thread.is_none() {
            let pump = Arc::clone(self);
            control.thread = Some(
                std::thread::Builder::new()
                    .name("shadow-dispatcher".to_owned())
                    .spawn(move || pump.pump_loop())
                    .expect("failed to spawn dispatcher pump thread"),
            );
        }
        drop(control);
        self.unlock.signal();
    }

    /// Transitions `Started -> Stopped`. Blocks until the pump thread
    /// acknowledges via the start-stop handshake.
    pub fn stop_monitor(&self) {
        {
            let control = self.control.lock();
            if control.state != DispatcherState::Started {
                return;
            }
        }
        self.signal_stop();
        self.start_stop.wait();
        self.control.lock().state = DispatcherState::Stopped;
    }

    /// Appends `callback` to the FIFO queue and wakes the pump. Order
    /// across calls from any number of threads is preserved (I8) because
    /// the queue itself is protected by `callbacks`'s mutex and the pump
    /// drains it strictly in push order.
    ///
    /// The queue is pushed to before `callback_pending` is raised, and
    /// `callback_pending` is raised under the same `notify_board` lock the
    /// pump holds while checking it and waiting on `notify_cv` -- without
    /// that, a push landing between the pump's predicate check and its
    /// `wait` call would notify a condvar nobody is blocked on yet and be
    /// lost until some later, unrelated notification happened to wake it.
    pub fn push_callback(&self, callback: impl FnOnce() + Send + 'static) {
        self.callbacks.lock().push_back(Box::new(callback));
        let mut board = self.notify_board.lock();
        board.callback_pending = true;
        self.notify_cv.notify_one();
    }

    /// Acquires exclusive access against the pump thread: signals `Pause`,
    /// waits for the pump to acknowledge (so no callback is mid-flight),
    /// and returns a guard. The pump resumes only once the guard drops.
    pub fn pause_dispatcher(&self) -> MutexGuard<'_, ()> {
        let guard = self.pause_gate.lock();
        {
            let mut board = self.notify_board.lock();
            board.pause_pending = true;
        }
        self.notify_cv.notify_one();
        self.pause_ack.wait();
        guard
    }

    fn signal_stop(&self) {
        self.notify_board.lock().stop_pending = true;
        self.notify_cv.notify_one();
    }

    fn next_notification(&self) -> Notification {
        let mut board = self.notify_board.lock();
        loop {
            if board.stop_pending {
                board.stop_pending = false;
                return Notification::Stop;
            }
            if board.callback_pending {
                board.callback_pending = false;
                return Notification::Callback;
            }
            if board.pause_pending {
                board.pause_pending = false;
                return Notification::Pause;
            }
            self.notify_cv.wait(&mut board);
        }
    }

    fn drain_callbacks(&self) {
        loop {
            let next = self.callbacks.lock().pop_front();
            match next {
                Some(callback) => callback(),
                None => return,
            }
        }
    }

    fn pump_loop(self: Arc<Self>) {
        loop {
            // Step 1: park an idle dispatcher until (re)started.
            self.unlock.wait();

            loop {
                match self.next_notification() {
                    Notification::Stop => {
                        self.start_stop.signal();
                        if self.control.lock().state == DispatcherState::Terminating {
                            return;
                        }
                        break;
                    }
                    Notification::Callback => self.drain_callbacks(),
                    Notification::Pause => {
                        self.pause_ack.signal();
                        // Blocks until `pause_dispatcher`'s guard drops.
                        let _ = self.pause_gate.lock();
                    }
                }
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        let should_join = {
            let mut control = self.control.lock();
            let was_running = control.thread.is_some();
            control.state = DispatcherState::Terminating;
            was_running
        };
        if should_join {
            self.signal_stop();
            self.unlock.signal();
            if let Some(handle) = self.control.lock().thread.take() {
                if let Err(e) = handle.join() {
                    warn!(?e, "dispatcher pump thread panicked during shutdown");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn start_stop_is_idempotent_and_synchronous() {
        let dispatcher = Dispatcher::new();
        dispatcher.start_monitor();
        assert_eq!(dispatcher.state(), DispatcherState::Started);
        dispatcher.stop_monitor();
        assert_eq!(dispatcher.state(), DispatcherState::Stopped);
        // Restarting from Stopped is permitted.
        dispatcher.start_monitor();
        assert_eq!(dispatcher.state(), DispatcherState::Started);
        dispatcher.stop_monitor();
    }

    /// I8 / scenario 6: callbacks pushed from many threads each execute
    /// exactly once, and a single thread's own pushes stay in push order.
    #[test]
    fn callbacks_execute_once_in_push_order_per_thread() {
        let dispatcher = Dispatcher::new();
        dispatcher.start_monitor();

        let total = Arc::new(AtomicUsize::new(0));
        let per_thread_order: Arc<Mutex<Vec<Vec<u32>>>> = Arc::new(Mutex::new(vec![Vec::new(); 8]));

        let mut handles = Vec::new();
        for t in 0..8u32 {
            let dispatcher = Arc::clone(&dispatcher);
            let total = Arc::clone(&total);
            let order = Arc::clone(&per_thread_order);
            handles.push(std::thread::spawn(move || {
                for i in 0..1000u32 {
                    let total = Arc::clone(&total);
                    let order = Arc::clone(&order);
                    dispatcher.push_callback(move || {
                        total.fetch_add(1, Ordering::SeqCst);
                        order.lock()[t as usize].push(i);
                    });
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        // Give the pump time to drain everything.
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while total.load(Ordering::SeqCst) < 8000 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(total.load(Ordering::SeqCst), 8000);
        for seen in per_thread_order.lock().iter() {
            let sorted: Vec<u32> = {
                let mut s = seen.clone();
                s.sort();
                s
            };
            assert_eq!(*seen, sorted, "callbacks from one thread ran out of push order");
            assert_eq!(seen.len(), 1000);
        }

        dispatcher.stop_monitor();
    }

    #[test]
    fn pause_blocks_callback_delivery_until_released() {
        let dispatcher = Dispatcher::new();
        dispatcher.start_monitor();

        let ran = Arc::new(AtomicUsize::new(0));
        {
            let _guard = dispatcher.pause_dispatcher();
            let ran = Arc::clone(&ran);
            dispatcher.push_callback(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
            std::thread::sleep(Duration::from_millis(50));
            assert_eq!(ran.load(Ordering::SeqCst), 0, "callback ran while paused");
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while ran.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        dispatcher.stop_monitor();
    }
}
