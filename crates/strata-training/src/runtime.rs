//! Process-wide settings, applied once at startup.
//!
//! [`init`] installs the global `tracing` subscriber and records whether
//! progress output is suppressed. Later calls keep the first settings.

use std::str::FromStr;
use std::sync::OnceLock;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

static SETTINGS: OnceLock<RuntimeSettings> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub log_level: Level,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self { log_level: Level::INFO }
    }
}

impl RuntimeSettings {
    /// Unknown names fall back to `info`.
    pub fn from_level_name(name: &str) -> Self {
        Self { log_level: Level::from_str(name).unwrap_or(Level::INFO) }
    }

    /// Progress output is suppressed at `warn` and `error`.
    pub fn progress_disabled(&self) -> bool {
        self.log_level <= Level::WARN
    }
}

/// Apply `settings` for the whole process and return the settings in effect.
pub fn init(settings: RuntimeSettings) -> RuntimeSettings {
    *SETTINGS.get_or_init(|| {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(settings.log_level)
            .without_time()
            .with_target(false)
            .finish();
        if tracing::subscriber::set_global_default(subscriber).is_err() {
            tracing::debug!("A global subscriber is already installed");
        }
        settings
    })
}

pub fn progress_disabled() -> bool {
    SETTINGS.get().is_some_and(RuntimeSettings::progress_disabled)
}
