use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use slog::Level;
use strum::EnumString;

/// Verbosity of the monitor, as named by its `--verbose` flag.
#[derive(Clone, Copy, Debug, Deserialize, EnumString, Serialize, ValueEnum)]
#[clap(rename_all = "PascalCase")]
#[serde(rename_all = "PascalCase")]
#[strum(serialize_all = "PascalCase")]
pub enum LogLevel {
    Debug,
    Info,
    Error,
}

impl LogLevel {
    pub fn as_slog_level(&self) -> Level {
        match self {
            LogLevel::Debug => slog::Level::Debug,
            LogLevel::Info => slog::Level::Info,
            LogLevel::Error => slog::Level::Error,
        }
    }
}
