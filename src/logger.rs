use std::path::Path;

/// Simplifies file paths by extracting relevant parts from cargo registry paths
///
/// # Arguments
/// * `file_path` - The file path to simplify
///
/// # Returns
/// A simplified version of the file path
fn simplify_file_path(file_path: &str) -> String {
    if file_path.contains("xcproxy") {
        if let Some(pos) = file_path.rfind("/src/") {
            return file_path[(pos + 1)..].to_string();
        }
    }

    if let Some((_, suffix)) = file_path.split_once(".cargo/registry/src/") {
        if let Some(first_slash) = suffix.find('/') {
            suffix[(first_slash + 1)..].to_string()
        } else {
            suffix.to_string()
        }
    } else {
        file_path.to_string()
    }
}

/// Formats log messages for console output with a simplified format
///
/// # Features
/// * Simplified time format (HH:MM:SS)
/// * Concise log format for console viewing
fn console_log_formatter(
    out: fern::FormatCallback,
    message: &std::fmt::Arguments,
    record: &log::Record,
) {
    let level = record.level();
    let level_color = match level {
        log::Level::Error => "\x1B[31m", // red
        log::Level::Warn => "\x1B[33m",  // yellow
        log::Level::Info => "\x1B[32m",  // green
        log::Level::Debug => "\x1B[0m",  // normal
        log::Level::Trace => "\x1B[35m", // purple
    };
    let reset = "\x1B[0m";

    out.finish(format_args!(
        "{}{}[{}] {}:{} {}{}",
        level_color,
        chrono::Local::now().format("%H:%M:%S.%3f "),
        get_level(level),
        simplify_file_path(record.file().unwrap_or("")),
        record.line().unwrap_or(0),
        replace_sensitive_info(message.to_string().as_str()),
        reset,
    ))
}

/// Formats log messages for file output with detailed information
///
/// # Features
/// * Complete date-time format (YYYY-MM-DD HH:MM:SS)
/// * Includes file location for troubleshooting
fn file_log_formatter(
    out: fern::FormatCallback,
    message: &std::fmt::Arguments,
    record: &log::Record,
) {
    out.finish(format_args!(
        "{}[{}] {}:{} {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S.%3f"),
        get_level(record.level()),
        simplify_file_path(record.file().unwrap_or("")),
        record.line().unwrap_or(0),
        replace_sensitive_info(message.to_string().as_str()),
    ))
}

/// Replaces sensitive values in log messages with asterisks (`***`).
///
/// Scans the message for sensitive keywords (e.g. `api_key`, `token`) and
/// replaces the value after the `=` sign with `***` so credentials never
/// reach the log files.
fn replace_sensitive_info(message: &str) -> String {
    let sensitive_keywords = ["api_key", "key", "password", "passwd", "secret", "token"];
    let mut sanitized_message = message.to_string();

    for keyword in sensitive_keywords {
        if let Some(start) = sanitized_message.find(keyword) {
            if let Some(equals_pos) = sanitized_message[start..].find('=') {
                let value_start = start + equals_pos + 1;
                let value_end = sanitized_message[value_start..]
                    .find('&')
                    .map(|pos| value_start + pos)
                    .unwrap_or(sanitized_message.len());
                sanitized_message.replace_range(value_start..value_end, "***");
            }
        }
    }

    sanitized_message
}

/// Sets up the process logger with console output and an optional log file.
///
/// # Arguments
/// * `verbose` - enables debug-level console output
/// * `log_file` - when set, detailed records are appended to this path
pub fn setup_logger(verbose: bool, log_file: Option<&Path>) -> Result<(), fern::InitError> {
    let console_level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    let stdout_dispatcher = fern::Dispatch::new()
        .level(console_level)
        .filter(|record| {
            record.target().contains("xcproxy") || record.level() < log::LevelFilter::Debug
        })
        .format(console_log_formatter)
        .chain(std::io::stdout());

    let mut base_dispatcher = fern::Dispatch::new()
        .level(log::LevelFilter::Debug)
        .chain(stdout_dispatcher);

    if let Some(path) = log_file {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file_dispatcher = fern::Dispatch::new()
            .level(log::LevelFilter::Debug)
            .filter(|record| {
                record.target().contains("xcproxy") || record.level() < log::LevelFilter::Info
            })
            .format(file_log_formatter)
            .chain(fern::log_file(path)?);
        base_dispatcher = base_dispatcher.chain(file_dispatcher);
    }

    base_dispatcher.apply()?;
    Ok(())
}

fn get_level(level: log::Level) -> String {
    match level {
        log::Level::Error => "E",
        log::Level::Warn => "W",
        log::Level::Info => "I",
        log::Level::Debug => "D",
        log::Level::Trace => "T",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_sensitive_info() {
        let message = "api_key=1234567890&password=1234567890&secret=1234567890";
        let sanitized_message = replace_sensitive_info(message);
        assert_eq!(sanitized_message, "api_key=***&password=***&secret=***");
    }

    #[test]
    fn test_simplify_registry_path() {
        let path = "/home/u/.cargo/registry/src/index.crates.io-6f17d22bba15001f/tokio-1.43.0/src/lib.rs";
        assert_eq!(
            simplify_file_path(path),
            "tokio-1.43.0/src/lib.rs".to_string()
        );
    }
}
