//! `shadow` — watches a source directory and shadows files that are
//! about to be deleted so their content can be recovered from a backup
//! directory afterward.
//!
//! Thin binary entry point. All logic lives in `shadow-core`.

use std::io::Read;
use std::process::ExitCode;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let mut args = std::env::args().skip(1);
    let (source_dir, backup_dir) = match (args.next(), args.next()) {
        (Some(source), Some(backup)) => (source, backup),
        _ => {
            eprintln!("usage: shadow <source_dir> <backup_dir>");
            return ExitCode::from(1);
        }
    };

    tracing::info!(source_dir, backup_dir, "shadow starting");

    #[cfg(windows)]
    {
        let engine = match shadow_core::ShadowEngine::init(&source_dir, &backup_dir) {
            Ok(engine) => engine,
            Err(e) => {
                eprintln!("failed to initialize: {e}");
                return ExitCode::from(1);
            }
        };

        if let Err(e) = engine.spawn_workers() {
            eprintln!("failed to start monitor: {e}");
            return ExitCode::from(2);
        }

        tracing::info!("monitor started, press any key + Enter to stop");
        let mut buf = [0u8; 1];
        let _ = std::io::stdin().read(&mut buf);
        engine.stop();
        ExitCode::from(0)
    }

    #[cfg(not(windows))]
    {
        eprintln!("shadow: the shadowing engine's notification source is Windows-only");
        ExitCode::from(1)
    }
}
