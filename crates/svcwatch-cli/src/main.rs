//! `svcwatch` — demonstrates the monitor-dispatcher framework by watching
//! Windows service-control-manager notifications and printing state
//! transitions as they arrive.
//!
//! Thin binary entry point. All logic lives in `shadow-core`.

use std::io::Read;
use std::process::ExitCode;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    #[cfg(windows)]
    {
        use shadow_core::service_watcher::ServiceWatcher;

        let watcher = match ServiceWatcher::new() {
            Ok(w) => w,
            Err(e) => {
                eprintln!("failed to connect to the service control manager: {e}");
                return ExitCode::from(2);
            }
        };

        watcher.subscribe(std::sync::Arc::new(|trigger, name, _old, new| {
            tracing::info!(
                trigger,
                name,
                state = new.dwCurrentState,
                "service notification"
            );
        }));

        if let Err(e) = watcher.start_monitoring() {
            eprintln!("failed to start monitoring: {e}");
            return ExitCode::from(2);
        }

        println!("watching service control manager, press any key + Enter to exit");
        let mut buf = [0u8; 1];
        let _ = std::io::stdin().read(&mut buf);
        watcher.stop_monitoring();
        ExitCode::from(0)
    }

    #[cfg(not(windows))]
    {
        eprintln!("svcwatch: the service control manager is Windows-only");
        ExitCode::from(1)
    }
}
