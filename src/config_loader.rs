use crate::decision::{valid_unit, Policy};
use crate::errors::{VeilError, VeilResult};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_CONFIG_FILE: &str = "feedveil.toml";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClassifierConfig {
    pub endpoint: String,
    pub timeout_ms: u64,
    pub max_images: u32,
    /// Static metadata object sent with every request.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8000/api/analyze_post".to_string(),
            timeout_ms: 10_000,
            max_images: 3,
            metadata: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WatcherConfig {
    pub debounce_ms: u64,
    pub item_tag: String,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 200,
            item_tag: "article".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScannerConfig {
    pub media_class: String,
    pub alt_prefix: String,
    pub excluded_alt: String,
    pub min_image_width: u32,
    pub caption_marker_class: String,
    pub caption_class: String,
    pub caption_min_len: usize,
    pub skip_link_fragment: String,
    pub caption_limit: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            media_class: "post-media".to_string(),
            alt_prefix: "Photo by".to_string(),
            excluded_alt: "profile picture".to_string(),
            min_image_width: 100,
            caption_marker_class: "post-caption".to_string(),
            caption_class: "post-text".to_string(),
            caption_min_len: 5,
            skip_link_fragment: "/explore/locations/".to_string(),
            caption_limit: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MutatorConfig {
    pub placeholder_text: String,
    pub reveal_label: String,
    pub reconceal_scroll_px: u32,
}

impl Default for MutatorConfig {
    fn default() -> Self {
        Self {
            placeholder_text: "This post was hidden by feedveil.".to_string(),
            reveal_label: "Show anyway".to_string(),
            reconceal_scroll_px: 600,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8181,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VeilConfig {
    pub data_dir: PathBuf,
    pub log_level: String,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    /// Thresholds used until the store holds its own.
    #[serde(default)]
    pub policy: Policy,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub mutator: MutatorConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("feedveil")
}

impl Default for VeilConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            classifier: ClassifierConfig::default(),
            policy: Policy::default(),
            watcher: WatcherConfig::default(),
            scanner: ScannerConfig::default(),
            mutator: MutatorConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl VeilConfig {
    pub fn validate(&self) -> VeilResult<()> {
        if self.classifier.endpoint.trim().is_empty() {
            return Err(VeilError::config("classifier.endpoint must be set"));
        }
        if self.classifier.timeout_ms == 0 {
            return Err(VeilError::config("classifier.timeout_ms must be positive"));
        }
        if !valid_unit(self.policy.ai_threshold) {
            return Err(VeilError::config("policy.ai_threshold must be within 0..=1"));
        }
        if !valid_unit(self.policy.misinfo_threshold) {
            return Err(VeilError::config("policy.misinfo_threshold must be within 0..=1"));
        }
        if self.watcher.debounce_ms == 0 {
            return Err(VeilError::config("watcher.debounce_ms must be positive"));
        }
        if self.watcher.item_tag.trim().is_empty() {
            return Err(VeilError::config("watcher.item_tag must be set"));
        }
        Ok(())
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("store")
    }
}

pub fn figment(path: Option<&str>) -> Figment {
    Figment::from(Serialized::defaults(VeilConfig::default()))
        .merge(Toml::file(path.unwrap_or(DEFAULT_CONFIG_FILE)))
        .merge(Env::prefixed("FEEDVEIL_").split("__"))
}

/// Layer defaults, the TOML file and `FEEDVEIL_` env vars, then validate.
pub fn load_config(path: Option<&str>) -> VeilResult<VeilConfig> {
    let config: VeilConfig = figment(path).extract()?;
    config.validate()?;
    Ok(config)
}
