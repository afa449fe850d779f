use crate::errors::TyperError;
use crate::runtime::FileSystem;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = ".macrotyper/config.toml";

#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
    pub autoplay_interval_ms: Option<u64>,
    pub silent: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    pub playback: PlaybackConfig,
    pub recording: RecordingConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
    pub feedback: FeedbackConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlaybackConfig {
    pub autoplay_interval_ms: u64,
    pub breakout_key: String,
    pub autoplay_toggle_key: String,
}

impl PlaybackConfig {
    pub fn autoplay_interval(&self) -> Duration {
        Duration::from_millis(self.autoplay_interval_ms)
    }

    pub fn breakout_char(&self) -> char {
        self.breakout_key.chars().next().unwrap_or('\n')
    }

    pub fn autoplay_toggle_char(&self) -> char {
        self.autoplay_toggle_key.chars().next().unwrap_or('`')
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EndingStopPolicy {
    Prompt,
    Always,
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordingConfig {
    pub ending_stop: EndingStopPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageConfig {
    pub db_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub path: PathBuf,
    pub max_payload_bytes: usize,
    pub max_file_bytes: u64,
    pub budget_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedbackConfig {
    pub app_name: String,
    pub silent: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            playback: PlaybackConfig {
                autoplay_interval_ms: 60,
                breakout_key: "\n".to_string(),
                autoplay_toggle_key: "`".to_string(),
            },
            recording: RecordingConfig {
                ending_stop: EndingStopPolicy::Prompt,
            },
            storage: StorageConfig {
                db_path: PathBuf::from(".macrotyper/macros.sqlite"),
            },
            logging: LoggingConfig {
                path: PathBuf::from(".macrotyper/logs/run.jsonl"),
                max_payload_bytes: 4096,
                max_file_bytes: 1024 * 1024,
                budget_bytes: crate::logging::DEFAULT_DISK_BUDGET_BYTES,
            },
            feedback: FeedbackConfig {
                app_name: "HackerTyper".to_string(),
                silent: false,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialAppConfig {
    playback: Option<PartialPlaybackConfig>,
    recording: Option<PartialRecordingConfig>,
    storage: Option<PartialStorageConfig>,
    logging: Option<PartialLoggingConfig>,
    feedback: Option<PartialFeedbackConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialPlaybackConfig {
    autoplay_interval_ms: Option<u64>,
    breakout_key: Option<String>,
    autoplay_toggle_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialRecordingConfig {
    ending_stop: Option<EndingStopPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialStorageConfig {
    db_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialLoggingConfig {
    path: Option<PathBuf>,
    max_payload_bytes: Option<usize>,
    max_file_bytes: Option<u64>,
    budget_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialFeedbackConfig {
    app_name: Option<String>,
    silent: Option<bool>,
}

/// Builds the effective config: defaults, then the config file, then CLI
/// overrides. Relative paths resolve against `process_cwd`.
pub fn load_config(
    overrides: &CliOverrides,
    process_cwd: &Path,
    fs: &dyn FileSystem,
) -> Result<AppConfig, TyperError> {
    let mut cfg = AppConfig::default();

    let config_path = match &overrides.config_path {
        Some(path) => Some(absolutize_path(process_cwd, path)),
        None => {
            let default_path = process_cwd.join(DEFAULT_CONFIG_FILE);
            fs.exists(&default_path).then_some(default_path)
        }
    };

    if let Some(path) = config_path {
        let file_contents = fs.read_to_string(&path)?;
        let partial: PartialAppConfig =
            toml::from_str(&file_contents).map_err(|e| TyperError::ConfigParse(e.to_string()))?;
        merge_partial_config(&mut cfg, partial);
    }

    apply_cli_overrides(&mut cfg, overrides);
    cfg.storage.db_path = absolutize_path(process_cwd, &cfg.storage.db_path);
    cfg.logging.path = absolutize_path(process_cwd, &cfg.logging.path);

    validate_config(&cfg)?;
    Ok(cfg)
}

fn merge_partial_config(cfg: &mut AppConfig, partial: PartialAppConfig) {
    if let Some(playback) = partial.playback {
        if let Some(value) = playback.autoplay_interval_ms {
            cfg.playback.autoplay_interval_ms = value;
        }
        if let Some(value) = playback.breakout_key {
            cfg.playback.breakout_key = value;
        }
        if let Some(value) = playback.autoplay_toggle_key {
            cfg.playback.autoplay_toggle_key = value;
        }
    }

    if let Some(recording) = partial.recording {
        if let Some(value) = recording.ending_stop {
            cfg.recording.ending_stop = value;
        }
    }

    if let Some(storage) = partial.storage {
        if let Some(value) = storage.db_path {
            cfg.storage.db_path = value;
        }
    }

    if let Some(logging) = partial.logging {
        if let Some(value) = logging.path {
            cfg.logging.path = value;
        }
        if let Some(value) = logging.max_payload_bytes {
            cfg.logging.max_payload_bytes = value;
        }
        if let Some(value) = logging.max_file_bytes {
            cfg.logging.max_file_bytes = value;
        }
        if let Some(value) = logging.budget_bytes {
            cfg.logging.budget_bytes = value;
        }
    }

    if let Some(feedback) = partial.feedback {
        if let Some(value) = feedback.app_name {
            cfg.feedback.app_name = value;
        }
        if let Some(value) = feedback.silent {
            cfg.feedback.silent = value;
        }
    }
}

fn apply_cli_overrides(cfg: &mut AppConfig, overrides: &CliOverrides) {
    if let Some(path) = &overrides.db_path {
        cfg.storage.db_path = path.clone();
    }
    if let Some(interval) = overrides.autoplay_interval_ms {
        cfg.playback.autoplay_interval_ms = interval;
    }
    if overrides.silent {
        cfg.feedback.silent = true;
    }
}

fn absolutize_path(base: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        base.join(value)
    }
}

fn validate_config(cfg: &AppConfig) -> Result<(), TyperError> {
    if cfg.playback.autoplay_interval_ms == 0 {
        return Err(TyperError::InvalidConfig(
            "playback.autoplay_interval_ms must be greater than zero".to_string(),
        ));
    }

    for (field, key) in [
        ("playback.breakout_key", &cfg.playback.breakout_key),
        ("playback.autoplay_toggle_key", &cfg.playback.autoplay_toggle_key),
    ] {
        if key.chars().count() != 1 {
            return Err(TyperError::InvalidConfig(format!(
                "{field} must be exactly one character, got {key:?}"
            )));
        }
    }

    if cfg.playback.breakout_key == cfg.playback.autoplay_toggle_key {
        return Err(TyperError::InvalidConfig(
            "playback.breakout_key and playback.autoplay_toggle_key must differ".to_string(),
        ));
    }

    if cfg.storage.db_path.as_os_str().is_empty() {
        return Err(TyperError::InvalidConfig(
            "storage.db_path must not be empty".to_string(),
        ));
    }

    if cfg.logging.max_file_bytes > cfg.logging.budget_bytes {
        return Err(TyperError::InvalidConfig(
            "logging.max_file_bytes must not exceed logging.budget_bytes".to_string(),
        ));
    }

    Ok(())
}
