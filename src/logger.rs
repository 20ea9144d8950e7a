//! Logging setup for binaries and applications embedding sextant.
//!
//! The library itself only emits `tracing` events; installing a subscriber is left to the
//! application. [`init_logger`] installs the crate's standard one: INFO by default,
//! overridable through `RUST_LOG`, one bracketed header per line:
//!
//! ```text
//! [INFO 2026-10-16 09:12:44 sextant::optimizer::levenberg_marquardt] message
//! [DEBUG 2026-10-16 09:12:44 levenberg_marquardt.rs:731] message
//! ```
//!
//! Levels are colored only when stdout is a terminal.

use std::borrow::Cow;
use std::io::IsTerminal;

use tracing::Level;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Installs the standard subscriber at INFO.
///
/// ```no_run
/// sextant::init_logger();
/// tracing::info!("Application started");
/// ```
///
/// `RUST_LOG=debug cargo run --bin odometry_2d` prints the optimizer's iteration table.
pub fn init_logger() {
    init_logger_with_level(Level::INFO)
}

/// Installs the standard subscriber with `default_level` unless `RUST_LOG` says otherwise.
///
/// A second call leaves the first subscriber in place and prints a note to stderr.
pub fn init_logger_with_level(default_level: Level) {
    if let Err(e) = try_init_logger_with_level(default_level) {
        eprintln!("logger already initialized: {e}");
    }
}

/// Fallible form of [`init_logger_with_level`] for callers that may race to initialize,
/// e.g. tests.
pub fn try_init_logger_with_level(
    default_level: Level,
) -> Result<(), tracing_subscriber::util::TryInitError> {
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .with_ansi(std::io::stdout().is_terminal())
        .event_format(BracketFormat)
        .finish()
        .try_init()
}

/// `[LEVEL timestamp location] fields` event format.
struct BracketFormat;

impl<S, N> FormatEvent<S, N> for BracketFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let metadata = event.metadata();
        let level = *metadata.level();

        if writer.has_ansi_escapes() {
            write!(writer, "[\x1b[{}m{}\x1b[0m ", level_color(level), level)?;
        } else {
            write!(writer, "[{level} ")?;
        }
        write!(
            writer,
            "{} {}] ",
            chrono::Local::now().format(TIMESTAMP_FORMAT),
            event_location(level, metadata.file(), metadata.line(), metadata.target())
        )?;

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// ANSI SGR color code per level.
fn level_color(level: Level) -> u8 {
    match level {
        Level::ERROR => 31,
        Level::WARN => 33,
        Level::INFO => 32,
        Level::DEBUG => 34,
        Level::TRACE => 35,
    }
}

/// Source `file:line` for DEBUG and TRACE, the module target otherwise.
fn event_location<'a>(
    level: Level,
    file: Option<&'a str>,
    line: Option<u32>,
    target: &'a str,
) -> Cow<'a, str> {
    let verbose = matches!(level, Level::DEBUG | Level::TRACE);
    match (verbose, file) {
        (true, Some(file)) => {
            let name = file.rsplit(['/', '\\']).next().unwrap_or(file);
            match line {
                Some(line) => Cow::Owned(format!("{name}:{line}")),
                None => Cow::Borrowed(name),
            }
        }
        _ => Cow::Borrowed(target),
    }
}
