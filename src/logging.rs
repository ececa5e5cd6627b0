//! Log sink setup: a console sink and an optional file sink with
//! independent levels, both writing `[timestamp][LEVEL][module] message`
//! lines.

use crate::config::Settings;
use crate::error::YakNsError;

use flexi_logger::{DeferredNow, Duplicate, FileSpec, Logger, LoggerHandle, WriteMode};
use log::Record;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f%:z";

fn log_format(
    w: &mut dyn std::io::Write,
    now: &mut DeferredNow,
    record: &Record,
) -> Result<(), std::io::Error> {
    write!(
        w,
        "[{}][{}][{}] {}",
        now.format(TIMESTAMP_FORMAT),
        record.level(),
        record.module_path().unwrap_or("yakns"),
        record.args()
    )
}

fn duplicate_level(level: &str) -> Duplicate {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Duplicate::Trace,
        "debug" => Duplicate::Debug,
        "info" => Duplicate::Info,
        "warn" | "warning" => Duplicate::Warn,
        "error" => Duplicate::Error,
        _ => Duplicate::Info,
    }
}

/// Start logging per the settings. The returned handle has to stay alive
/// for the life of the process or buffered lines get lost.
pub fn init_logging(settings: &Settings, debug: bool) -> Result<LoggerHandle, YakNsError> {
    let console_level = match debug {
        true => "debug",
        false => settings.console_log_level.as_str(),
    };

    let handle = match &settings.log_file {
        Some(log_file) => {
            // the file sink carries its own level, the console gets a
            // duplicate stream at the console level
            Logger::try_with_str(&settings.file_log_level)?
                .format(log_format)
                .log_to_file(FileSpec::try_from(log_file.clone())?)
                .duplicate_to_stderr(duplicate_level(console_level))
                .write_mode(WriteMode::Async)
                .start()?
        }
        None => Logger::try_with_str(console_level)?
            .format(log_format)
            .log_to_stderr()
            .start()?,
    };

    Ok(handle)
}
