use std::{fs, io, time::Duration};

use camino::{Utf8Path, Utf8PathBuf};
use config::{Config, Environment, File, FileFormat};
use log::{debug, info};
use serde::Deserialize;

#[derive(thiserror::Error, Debug)]
pub enum ConfigurationError {
    #[error("Could not determine the local data directory for this user")]
    NoAppFolder,
    #[error("Error preparing {path}")]
    Filesystem { path: Utf8PathBuf, #[source] source: io::Error },
    #[error("Error reading configuration")]
    Config (#[from] config::ConfigError),
}

/// Runtime settings. Loaded from `settings.toml` in the app folder, with `IMGSRCH_*` environment variables
/// taking precedence (eg. `IMGSRCH_BATCH_SIZE=32`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AppConfig {
    pub data_directory: Utf8PathBuf,
    pub table_name: String,
    pub model_directory: Utf8PathBuf,
    #[serde(default)]
    pub onnx_library_directory: Option<Utf8PathBuf>,
    pub batch_size: usize,
    pub progress_interval: usize,
    pub watch_debounce_ms: u64,
    pub default_top_k: usize,
}

impl AppConfig {
    /// Loads the user's settings, writing the bundled defaults to the app folder first if there are none yet.
    /// The data directory is created if missing.
    pub fn load() -> Result<AppConfig, ConfigurationError> {
        let app_folder = app_folder()?;
        let settings_file = app_folder.join(SETTINGS_FILE);
        if !settings_file.exists() {
            info!("Writing default settings to {}", settings_file);
            fs::write(&settings_file, DEFAULT_SETTINGS_BYTES)
                .map_err(|e| ConfigurationError::Filesystem { path: settings_file.clone(), source: e })?;
        }

        let config = AppConfig::load_from(&settings_file, &app_folder)?;
        ensure_dir(&config.data_directory)?;
        Ok(config)
    }

    /// Loads settings from an explicit file on top of the bundled defaults. `%%AppDataDirectory%%` in any
    /// path setting is replaced with `app_folder`.
    pub fn load_from(settings_file: &Utf8Path, app_folder: &Utf8Path) -> Result<AppConfig, ConfigurationError> {
        debug!("Loading settings from {}", settings_file);
        let defaults = std::str::from_utf8(DEFAULT_SETTINGS_BYTES).unwrap_or_default();

        let mut config: AppConfig = Config::builder()
            .add_source(File::from_str(defaults, FileFormat::Toml))
            .add_source(File::with_name(settings_file.as_str()).format(FileFormat::Toml))
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()?;

        config.data_directory = expand(&config.data_directory, app_folder);
        config.model_directory = expand(&config.model_directory, app_folder);
        config.onnx_library_directory = config.onnx_library_directory.map(|d| expand(&d, app_folder));
        Ok(config)
    }

    pub fn watch_debounce(&self) -> Duration {
        Duration::from_millis(self.watch_debounce_ms)
    }
}

/// Per-user folder for settings and data, created if missing.
pub fn app_folder() -> Result<Utf8PathBuf, ConfigurationError> {
    let folder = dirs::data_local_dir()
        .and_then(|dir| Utf8PathBuf::from_path_buf(dir).ok())
        .ok_or(ConfigurationError::NoAppFolder)?
        .join(APP_NAME);
    ensure_dir(&folder)?;
    Ok(folder)
}

// Private constants and functions
const APP_NAME: &str = "imgsrch";
const SETTINGS_FILE: &str = "settings.toml";
const ENV_PREFIX: &str = "IMGSRCH";
const APP_DATA_PLACEHOLDER: &str = "%%AppDataDirectory%%";
const DEFAULT_SETTINGS_BYTES: &[u8] = include_bytes!("../artifacts/defaults/settings.toml");

fn expand(path: &Utf8Path, app_folder: &Utf8Path) -> Utf8PathBuf {
    Utf8PathBuf::from(path.as_str().replace(APP_DATA_PLACEHOLDER, app_folder.as_str()))
}

fn ensure_dir(folder: &Utf8Path) -> Result<(), ConfigurationError> {
    fs::create_dir_all(folder)
        .map_err(|e| ConfigurationError::Filesystem { path: folder.to_owned(), source: e })
}
