//! Root [`slog`] logger construction (`SPEC_FULL.md` §2).
//!
//! One `Logger` is built at process start and cloned with per-component
//! key-value context (`component`, `ssrc`, `tuple`) down into
//! [`crate::glue::PacketRouter`] and its children, the way Medea's own
//! `main.rs` threads a root logger into its actors. The core itself never
//! calls `println!`/`eprintln!`; components that only know the `log` facade
//! go through `slog-stdlog` into the same sink.

use slog::{o, Drain};

/// Builds the root logger: JSON records on an async, non-blocking drain,
/// filtered by `RUST_LOG`-style env directives. Returns the scope guard
/// alongside the logger; dropping the guard restores the previous global
/// logger and must outlive the process.
#[must_use]
pub fn init(component: &'static str) -> (slog::Logger, slog_scope::GlobalLoggerGuard) {
    let drain = slog_json::Json::new(std::io::stdout())
        .add_default_keys()
        .build()
        .fuse();
    let drain = slog_envlogger::new(drain).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let logger = slog::Logger::root(drain, o!("component" => component));
    let guard = slog_scope::set_global_logger(logger.clone());
    let _ = slog_stdlog::init();
    (logger, guard)
}

/// A logger with a `tuple` key bound, for per-transport components (ICE,
/// NACK, retransmission buffer, TCC).
#[must_use]
pub fn for_tuple(root: &slog::Logger, tuple: crate::transport::TransportTuple) -> slog::Logger {
    root.new(o!("remote" => tuple.remote.to_string()))
}

/// A logger with an `ssrc` key bound, for per-producer components
/// (key-frame request manager, retransmission buffer entries).
#[must_use]
pub fn for_ssrc(root: &slog::Logger, ssrc: u32) -> slog::Logger {
    root.new(o!("ssrc" => ssrc))
}
