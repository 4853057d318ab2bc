use std::fs::OpenOptions;
use std::path::Path;
use std::sync::{Once, OnceLock};

use slog::Drain;

const LEVEL_ENV: &str = "RUST_LOG";

/// Map a `RUST_LOG`-style value onto a single max level.
///
/// Module filters are not supported; the most verbose keyword found wins.
fn parse_level(value: &str) -> Option<log::LevelFilter> {
    let lower = value.to_ascii_lowercase();
    let level = if lower.contains("trace") {
        log::LevelFilter::Trace
    } else if lower.contains("debug") {
        log::LevelFilter::Debug
    } else if lower.contains("info") {
        log::LevelFilter::Info
    } else if lower.contains("warn") {
        log::LevelFilter::Warn
    } else if lower.contains("error") {
        log::LevelFilter::Error
    } else if lower.contains("off") {
        log::LevelFilter::Off
    } else {
        return None;
    };
    Some(level)
}

fn resolve_level(verbose: bool) -> log::LevelFilter {
    let default = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    std::env::var(LEVEL_ENV)
        .ok()
        .and_then(|v| parse_level(&v))
        .unwrap_or(default)
}

fn install_logger(logger: slog::Logger, level: log::LevelFilter) {
    static LOGGER_GUARD: OnceLock<slog_scope::GlobalLoggerGuard> = OnceLock::new();
    static STDLOG_INIT: Once = Once::new();

    if LOGGER_GUARD.get().is_none() {
        let guard = slog_scope::set_global_logger(logger);
        let _ = LOGGER_GUARD.set(guard);
    }

    // tracing events fall through to `log` (no subscriber installed),
    // which slog-stdlog forwards into the global slog drain.
    STDLOG_INIT.call_once(|| {
        let _ = slog_stdlog::init();
    });
    log::set_max_level(level);
}

pub fn init_terminal(verbose: bool) {
    let level = resolve_level(verbose);
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain)
        .overflow_strategy(slog_async::OverflowStrategy::Block)
        .build()
        .fuse();
    let logger = slog::Logger::root(drain, slog::o!("app" => "tunbox"));
    install_logger(logger, level);
}

/// Log to an append-only file, used when the client runs detached from a terminal.
pub fn init_file(path: &Path, verbose: bool) -> anyhow::Result<()> {
    let level = resolve_level(verbose);
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let decorator = slog_term::PlainDecorator::new(file);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain)
        .overflow_strategy(slog_async::OverflowStrategy::Block)
        .build()
        .fuse();
    let logger = slog::Logger::root(drain, slog::o!("app" => "tunbox"));
    install_logger(logger, level);
    Ok(())
}
