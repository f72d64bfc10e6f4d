use crate::registry::RegistryMode;
use crate::reveal::{RevealCadence, DEFAULT_CHUNK_CHARS};
use directories::BaseDirs;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:3000/";
pub const DEFAULT_WELCOME: &str = "Hello! Ask me anything to start a new conversation.";
pub const DEFAULT_TITLE: &str = "New chat";
const DEFAULT_TIMEOUT_SECS: u64 = 60;
const DEFAULT_TICK_MS: u64 = 15;

pub const BASE_URL_ENV: &str = "PARLEY_BASE_URL";
pub const MODE_ENV: &str = "PARLEY_MODE";

#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub base_url: String,
    pub mode: RegistryMode,
    /// Remote mode always requires authentication regardless of this flag.
    pub require_auth: bool,
    pub streaming: bool,
    pub request_timeout: Duration,
    pub reveal: RevealCadence,
    pub welcome_message: String,
    pub default_title: String,
    pub data_dir: PathBuf,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            mode: RegistryMode::Local,
            require_auth: false,
            streaming: true,
            request_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            reveal: RevealCadence::default(),
            welcome_message: DEFAULT_WELCOME.to_string(),
            default_title: DEFAULT_TITLE.to_string(),
            data_dir: default_data_dir(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {reason}")]
    Unreadable { path: PathBuf, reason: String },
    #[error("client configuration invalid: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn user_message(&self) -> String {
        match self {
            Self::Unreadable { path, .. } => {
                format!("Could not read {}. Check its permissions.", path.display())
            }
            Self::Invalid(detail) => format!("Client not configured: {detail}. Update parley.yaml."),
        }
    }
}

impl ClientSettings {
    /// Loads `.env`, the first `parley.yaml` found, then process environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let file = match locate_config_file() {
            Some(path) => Some(read_config_file(&path)?),
            None => None,
        };
        resolve_settings(file.unwrap_or_default(), |key| std::env::var(key).ok())
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let file = read_config_file(path)?;
        resolve_settings(file, |key| std::env::var(key).ok())
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let file: ParleyConfig = serde_yaml::from_str(contents)
            .map_err(|err| ConfigError::Invalid(format!("invalid parley.yaml: {err}")))?;
        resolve_settings(file, |_| None)
    }

    pub fn requires_auth(&self) -> bool {
        self.require_auth || self.mode == RegistryMode::Remote
    }
}

fn read_config_file(path: &Path) -> Result<ParleyConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|err| ConfigError::Unreadable {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;
    serde_yaml::from_str(&contents)
        .map_err(|err| ConfigError::Invalid(format!("invalid {}: {err}", path.display())))
}

fn resolve_settings(
    file: ParleyConfig,
    env: impl Fn(&str) -> Option<String>,
) -> Result<ClientSettings, ConfigError> {
    let defaults = ClientSettings::default();

    let base_url = env(BASE_URL_ENV)
        .or(file.base_url)
        .map(|value| value.trim().to_string())
        .unwrap_or(defaults.base_url);
    if url::Url::parse(&base_url).is_err() {
        return Err(ConfigError::Invalid(format!(
            "base_url `{base_url}` is not an absolute URL"
        )));
    }

    let mode = match env(MODE_ENV) {
        Some(raw) => parse_mode(&raw)?,
        None => file.mode.unwrap_or_default(),
    };

    let timeout_secs = file.request_timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(ConfigError::Invalid(
            "request_timeout_secs must be positive".to_string(),
        ));
    }

    let reveal = file.reveal.unwrap_or_default();
    let chunk_chars = reveal.chunk_chars.unwrap_or(DEFAULT_CHUNK_CHARS);
    if chunk_chars == 0 {
        return Err(ConfigError::Invalid(
            "reveal.chunk_chars must be positive".to_string(),
        ));
    }

    let mut settings = ClientSettings {
        base_url,
        mode,
        require_auth: file.require_auth.unwrap_or(false),
        streaming: file.streaming.unwrap_or(true),
        request_timeout: Duration::from_secs(timeout_secs),
        reveal: RevealCadence {
            chunk_chars,
            tick: Duration::from_millis(reveal.tick_ms.unwrap_or(DEFAULT_TICK_MS)),
        },
        welcome_message: non_blank(file.welcome_message).unwrap_or(defaults.welcome_message),
        default_title: non_blank(file.default_title).unwrap_or(defaults.default_title),
        data_dir: file.data_dir.unwrap_or(defaults.data_dir),
    };
    settings.require_auth = settings.requires_auth();
    Ok(settings)
}

fn parse_mode(raw: &str) -> Result<RegistryMode, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "local" => Ok(RegistryMode::Local),
        "remote" => Ok(RegistryMode::Remote),
        other => Err(ConfigError::Invalid(format!(
            "unknown mode `{other}` (expected local or remote)"
        ))),
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

fn locate_config_file() -> Option<PathBuf> {
    parley_yaml_candidates()
        .into_iter()
        .find(|path| path.exists())
}

fn parley_yaml_candidates() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(base) = BaseDirs::new() {
        let config_dir = base.config_dir().join("parley");
        paths.push(config_dir.join("parley.yaml"));
        paths.push(config_dir.join("parley.yml"));
        let home_dir = base.home_dir();
        paths.push(home_dir.join(".parley").join("parley.yaml"));
        paths.push(home_dir.join(".parley").join("parley.yml"));
    } else {
        paths.push(PathBuf::from("parley.yaml"));
        paths.push(PathBuf::from("parley.yml"));
    }
    paths
}

fn default_data_dir() -> PathBuf {
    BaseDirs::new()
        .map(|base| base.data_local_dir().join("parley"))
        .unwrap_or_else(|| PathBuf::from(".parley"))
}

#[derive(Debug, Default, Deserialize)]
struct ParleyConfig {
    base_url: Option<String>,
    mode: Option<RegistryMode>,
    require_auth: Option<bool>,
    streaming: Option<bool>,
    request_timeout_secs: Option<u64>,
    reveal: Option<RevealSection>,
    welcome_message: Option<String>,
    default_title: Option<String>,
    data_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct RevealSection {
    chunk_chars: Option<usize>,
    tick_ms: Option<u64>,
}
