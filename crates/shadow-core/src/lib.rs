/// Core library behind the `shadow` and `svcwatch` binaries.
///
/// Two independent subsystems live here:
///
/// - the shadowing engine ([`shadow`], backed by [`index`] and [`fs`]),
///   which watches a directory tree and preserves deleted files' content
///   via hard links, and
/// - the monitor-dispatcher framework ([`dispatcher`], consumed by
///   [`service_watcher`]), a single-pump callback framework originally
///   built for service-control-manager notifications and reused here in
///   its general form.
///
/// [`console`] and [`ring`] are shared infrastructure: a bounded
/// multi-producer/single-consumer log queue and the background thread
/// that drains it to a colored console.
pub mod console;
pub mod dispatcher;
pub mod error;
pub mod fs;
pub mod index;
pub mod ring;
pub mod service_watcher;
pub mod shadow;

pub use error::{Result, ShadowError};
pub use shadow::ShadowEngine;
