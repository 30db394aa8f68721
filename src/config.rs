//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP__ prefix, `__` between sections and keys)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Special environment variables (HOST, PORT, GEMINI_API_KEY)
//! 2. Environment variables (APP__SERVER__PORT, APP__LIVE__VOICE, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! ## Why `__` as separator:
//! Several keys contain underscores themselves (`api_key`, `capture_block_size`), so a
//! single `_` cannot tell sections apart from words inside a key.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration.
///
/// ## Sections:
/// - `server`: where the HTTP/websocket server listens
/// - `live`: the realtime speech service the sessions talk to
/// - `audio`: wire formats and capture framing
/// - `evaluation`: the text-generation service that writes the report
/// - `performance`: capacity limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub live: LiveConfig,
    pub audio: AudioConfig,
    pub evaluation: EvaluationConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Realtime speech service settings.
///
/// ## Fields:
/// - `endpoint`: websocket URL of the bidirectional streaming endpoint
/// - `api_key`: appended to the endpoint as the `key` query parameter
/// - `model`: fixed model name sent in the setup message (never negotiated)
/// - `voice`: prebuilt voice the agent speaks with
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub voice: String,
}

/// Audio format settings.
///
/// ## Fields:
/// - `input_sample_rate`: microphone rate on the wire (16 kHz for the speech service)
/// - `output_sample_rate`: rate of the agent audio the service sends back (24 kHz)
/// - `capture_block_size`: samples per outbound microphone frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub capture_block_size: usize,
}

/// Report generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// Base URL of the `generateContent` REST API
    pub endpoint: String,
    pub model: String,
    /// 0.0 = deterministic, 1.0 = creative
    pub temperature: f32,
}

/// Capacity limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Maximum number of live sessions (one per browser socket) at the same time
    pub max_concurrent_sessions: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            live: LiveConfig {
                endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
                api_key: String::new(),
                model: "models/gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
                voice: "Zephyr".to_string(),
            },
            audio: AudioConfig {
                input_sample_rate: 16000,
                output_sample_rate: 24000,
                capture_block_size: 4096,
            },
            evaluation: EvaluationConfig {
                endpoint: "https://generativelanguage.googleapis.com/v1beta".to_string(),
                model: "gemini-2.5-flash".to_string(),
                temperature: 0.4,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 10,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml`, and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP__SERVER__PORT=3000`: Override server port
    /// - `APP__LIVE__VOICE=Puck`: Override the agent voice
    /// - `APP__AUDIO__CAPTURE_BLOCK_SIZE=2048`: Smaller outbound frames
    /// - `HOST` / `PORT`: Special cases for deployment platforms
    /// - `GEMINI_API_KEY`: API key for both the live and evaluation services
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("__")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(key) = env::var("GEMINI_API_KEY") {
            settings = settings.set_override("live.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// A missing API key is not an error here: the server can still start and serve
    /// health checks, and the session reports a connection error when it tries to
    /// open the stream.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.live.endpoint.is_empty() {
            return Err(anyhow::anyhow!("Live endpoint cannot be empty"));
        }

        if self.live.model.is_empty() {
            return Err(anyhow::anyhow!("Live model cannot be empty"));
        }

        if self.audio.input_sample_rate == 0 || self.audio.output_sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if self.audio.capture_block_size == 0 {
            return Err(anyhow::anyhow!("Capture block size must be greater than 0"));
        }

        if !(0.0..=2.0).contains(&self.evaluation.temperature) {
            return Err(anyhow::anyhow!("Evaluation temperature must be between 0.0 and 2.0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        Ok(())
    }

    /// Apply a partial update from a JSON string (used by `PUT /api/v1/config`).
    ///
    /// Only the fields present in the JSON are changed, for example
    /// `{"live": {"voice": "Puck"}}` changes the voice and nothing else. The updated
    /// configuration is validated before returning.
    ///
    /// Service endpoints are fixed at startup: the API key travels to whatever
    /// endpoint is configured, so a request that changes one is refused.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        for (section, current) in [
            ("live", &self.live.endpoint),
            ("evaluation", &self.evaluation.endpoint),
        ] {
            if let Some(endpoint) = partial_config.get(section).and_then(|s| s.get("endpoint")) {
                if endpoint.as_str() != Some(current.as_str()) {
                    return Err(anyhow::anyhow!(
                        "{}.endpoint can only be set at startup",
                        section
                    ));
                }
            }
        }

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = u16::try_from(port)
                    .map_err(|_| anyhow::anyhow!("Server port out of range: {}", port))?;
            }
        }

        if let Some(live) = partial_config.get("live") {
            if let Some(model) = live.get("model").and_then(|v| v.as_str()) {
                self.live.model = model.to_string();
            }
            if let Some(voice) = live.get("voice").and_then(|v| v.as_str()) {
                self.live.voice = voice.to_string();
            }
        }

        if let Some(audio) = partial_config.get("audio") {
            if let Some(block) = audio.get("capture_block_size").and_then(|v| v.as_u64()) {
                self.audio.capture_block_size = block as usize;
            }
        }

        if let Some(evaluation) = partial_config.get("evaluation") {
            if let Some(model) = evaluation.get("model").and_then(|v| v.as_str()) {
                self.evaluation.model = model.to_string();
            }
            if let Some(temperature) = evaluation.get("temperature").and_then(|v| v.as_f64()) {
                self.evaluation.temperature = temperature as f32;
            }
        }

        if let Some(performance) = partial_config.get("performance") {
            if let Some(sessions) = performance
                .get("max_concurrent_sessions")
                .and_then(|v| v.as_u64())
            {
                self.performance.max_concurrent_sessions = sessions as usize;
            }
        }

        self.validate()?;
        Ok(())
    }

    /// Configuration as JSON with the API key redacted, for the config endpoints.
    pub fn redacted_json(&self) -> serde_json::Value {
        serde_json::json!({
            "server": {
                "host": self.server.host,
                "port": self.server.port
            },
            "live": {
                "endpoint": self.live.endpoint,
                "model": self.live.model,
                "voice": self.live.voice,
                "api_key_set": !self.live.api_key.is_empty()
            },
            "audio": {
                "input_sample_rate": self.audio.input_sample_rate,
                "output_sample_rate": self.audio.output_sample_rate,
                "capture_block_size": self.audio.capture_block_size
            },
            "evaluation": {
                "endpoint": self.evaluation.endpoint,
                "model": self.evaluation.model,
                "temperature": self.evaluation.temperature
            },
            "performance": {
                "max_concurrent_sessions": self.performance.max_concurrent_sessions
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.audio.input_sample_rate, 16000);
        assert_eq!(config.audio.output_sample_rate, 24000);
        assert_eq!(config.audio.capture_block_size, 4096);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.capture_block_size = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.evaluation.temperature = 3.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"live": {"voice": "Puck"}, "audio": {"capture_block_size": 2048}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.live.voice, "Puck");
        assert_eq!(config.audio.capture_block_size, 2048);
        // Untouched fields stay as they were
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.audio.input_sample_rate, 16000);
    }

    #[test]
    fn test_config_update_rejects_invalid_values() {
        let mut config = AppConfig::default();
        assert!(config.update_from_json(r#"{"server": {"port": 70000}}"#).is_err());
        assert!(config
            .update_from_json(r#"{"performance": {"max_concurrent_sessions": 0}}"#)
            .is_err());
    }

    #[test]
    fn test_config_update_refuses_endpoint_changes() {
        let mut config = AppConfig::default();
        let original = config.clone();

        let err = config
            .update_from_json(r#"{"live": {"endpoint": "wss://elsewhere.example/ws", "voice": "Puck"}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("live.endpoint"));
        assert!(config
            .update_from_json(r#"{"evaluation": {"endpoint": "https://elsewhere.example"}}"#)
            .is_err());
        assert_eq!(config.live.endpoint, original.live.endpoint);
        assert_eq!(config.live.voice, original.live.voice);
        assert_eq!(config.evaluation.endpoint, original.evaluation.endpoint);

        // Echoing the current value back is fine
        let echo = serde_json::json!({"live": {"endpoint": original.live.endpoint, "voice": "Puck"}});
        assert!(config.update_from_json(&echo.to_string()).is_ok());
        assert_eq!(config.live.voice, "Puck");
    }

    #[test]
    fn test_redacted_json_hides_api_key() {
        let mut config = AppConfig::default();
        config.live.api_key = "secret-key".to_string();
        let json = config.redacted_json().to_string();
        assert!(!json.contains("secret-key"));
        assert!(json.contains("\"api_key_set\":true"));
    }
}
