use anyhow::Result;
use tracing::{metadata::LevelFilter, Subscriber};
use tracing_subscriber::{filter, layer::SubscriberExt, Registry};

#[derive(PartialEq)]
pub enum LogType {
    Json,
    Plain,
}

pub fn setup(verbosity: u8, log_format: LogType) -> Result<impl Subscriber> {
    let log_severity = verbosity_to_level_filter(verbosity);

    // mute logs from other crates and those below the log_severity level
    let filter = filter::Targets::new().with_target(env!("CARGO_PKG_NAME"), log_severity);

    let plain_log = if log_format == LogType::Plain {
        Some(tracing_subscriber::fmt::layer())
    } else {
        None
    };

    let json_log = if log_format == LogType::Json {
        Some(tracing_subscriber::fmt::layer().json())
    } else {
        None
    };

    let subscriber = Registry::default().with(filter).with(plain_log).with(json_log);

    Ok(subscriber)
}

pub fn verbosity_to_level_filter(severity: u8) -> LevelFilter {
    match severity {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}
