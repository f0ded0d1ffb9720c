use serde::Deserialize;
use std::{path::PathBuf, time::Duration};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub model: ModelConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    pub video: VideoConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// SAM 2.1 checkpoint sizes, exported as an encoder/decoder pair of ONNX graphs.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModelSize {
    Tiny,
    Small,
    #[default]
    BasePlus,
    Large,
}

impl ModelSize {
    fn stem(&self) -> &'static str {
        match self {
            ModelSize::Tiny => "sam2.1_hiera_tiny",
            ModelSize::Small => "sam2.1_hiera_small",
            ModelSize::BasePlus => "sam2.1_hiera_base_plus",
            ModelSize::Large => "sam2.1_hiera_large",
        }
    }

    pub fn encoder_file(&self) -> String {
        format!("{}.encoder.onnx", self.stem())
    }

    pub fn decoder_file(&self) -> String {
        format!("{}.decoder.onnx", self.stem())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    pub model_dir: PathBuf,
    #[serde(default)]
    pub size: ModelSize,
    #[serde(default)]
    pub force_cpu: bool,
}

impl ModelConfig {
    pub fn get_encoder_path(&self) -> PathBuf {
        self.model_dir.join(self.size.encoder_file())
    }

    pub fn get_decoder_path(&self) -> PathBuf {
        self.model_dir.join(self.size.decoder_file())
    }

    pub fn validate(&self) -> Result<(), String> {
        for path in [self.get_encoder_path(), self.get_decoder_path()] {
            if !path.exists() {
                return Err(format!("Model file not found: {:?}", path));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct InferenceConfig {
    #[serde(default)]
    pub mask_threshold: f32,
    /// Sessions are kept until closed unless this is set.
    #[serde(default)]
    pub session_idle_ttl_secs: Option<u64>,
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
}

fn default_reaper_interval_secs() -> u64 {
    60
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            mask_threshold: 0.0,
            session_idle_ttl_secs: None,
            reaper_interval_secs: default_reaper_interval_secs(),
        }
    }
}

impl InferenceConfig {
    pub fn get_session_idle_ttl(&self) -> Option<Duration> {
        self.session_idle_ttl_secs.map(Duration::from_secs)
    }

    pub fn get_reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs.max(1))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct VideoConfig {
    pub data_root: PathBuf,
}

impl VideoConfig {
    pub fn get_video_dir(&self) -> PathBuf {
        self.data_root.join("videos")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum LogLevel {
    Debug,
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir()
        .map_err(|e| config::ConfigError::Message(format!("no current directory: {}", e)))?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let config = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(config::File::from(
            configuration_directory.join(format!("{}.yaml", environment.as_str())),
        ))
        .add_source(
            config::Environment::with_prefix("APP")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let config: Config = config.try_deserialize::<Config>()?;
    if let Err(e) = config.model.validate() {
        tracing::error!("Configuration validation failed: {}", e);
        return Err(config::ConfigError::Message(e));
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_files_follow_size() {
        let model = ModelConfig {
            model_dir: PathBuf::from("/models"),
            size: ModelSize::Tiny,
            force_cpu: false,
        };

        assert_eq!(
            model.get_encoder_path(),
            PathBuf::from("/models/sam2.1_hiera_tiny.encoder.onnx")
        );
        assert_eq!(
            model.get_decoder_path(),
            PathBuf::from("/models/sam2.1_hiera_tiny.decoder.onnx")
        );
        assert!(model.validate().is_err());
    }

    #[test]
    fn test_parse_yaml_with_defaults() {
        let yaml = r#"
server:
  host: 0.0.0.0
  port: 8000
log_level: INFO
model:
  model_dir: ./checkpoints
video:
  data_root: ./data
"#;
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.model.size, ModelSize::BasePlus);
        assert_eq!(config.inference.mask_threshold, 0.0);
        assert!(config.inference.get_session_idle_ttl().is_none());
        assert_eq!(config.video.get_video_dir(), PathBuf::from("./data/videos"));
        assert_eq!(config.server.get_address(), "0.0.0.0:8000");
    }

    #[test]
    fn test_unknown_log_level_is_rejected() {
        let level: Result<LogLevel, _> = "trace".to_string().try_into();
        assert!(level.is_err());
    }
}
