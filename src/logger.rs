//! log4rs setup for the binary and embedding applications.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

const LOG_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} - {l} - {m}{n}";

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: LevelFilter,
    /// Also write to `<dir>/<timestamp>.log` when set.
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LevelFilter::Info,
            log_dir: Some(PathBuf::from("logs")),
        }
    }
}

/// `2026-03-01-14_05.log`
pub fn log_file_name(now: DateTime<Local>) -> String {
    format!("{}.log", now.format("%Y-%m-%d-%H_%M"))
}

fn build_config(
    config: &LoggingConfig,
    file: Option<&Path>,
) -> Result<Config, Box<dyn std::error::Error>> {
    let console = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
        .build();
    let mut builder =
        Config::builder().appender(Appender::builder().build("console", Box::new(console)));
    let mut root = Root::builder().appender("console");

    if let Some(path) = file {
        let file_appender = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
            .build(path)?;
        builder = builder.appender(Appender::builder().build("file", Box::new(file_appender)));
        root = root.appender("file");
    }

    Ok(builder.build(root.build(config.level))?)
}

/// Install the global logger. Returns the log file path, if any.
pub fn setup_logging(
    config: &LoggingConfig,
) -> Result<Option<PathBuf>, Box<dyn std::error::Error>> {
    let file = match &config.log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            Some(dir.join(log_file_name(Local::now())))
        }
        None => None,
    };
    log4rs::init_config(build_config(config, file.as_deref())?)?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_log_file_name() {
        let now = Local.with_ymd_and_hms(2026, 3, 1, 14, 5, 59).unwrap();
        assert_eq!(log_file_name(now), "2026-03-01-14_05.log");
    }

    #[test]
    fn test_console_only_config() {
        let config = LoggingConfig {
            level: LevelFilter::Debug,
            log_dir: None,
        };
        let built = build_config(&config, None).unwrap();
        assert_eq!(built.appenders().len(), 1);
        assert_eq!(built.root().level(), LevelFilter::Debug);
    }
}
