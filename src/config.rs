use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::Result;

/// Calling subsystem configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Relay endpoints handed to the media transport.
    pub ice_servers: Vec<IceServer>,
    /// How long a direct-call caller rings before hanging up.
    pub ring_timeout_secs: u64,
    /// Capture hints for 1:1 video calls.
    pub direct_video: VideoConstraints,
    /// Capture hints for group video calls.
    pub group_video: VideoConstraints,
    /// Upper bound on call ids remembered by the incoming-call detector.
    pub processed_call_capacity: usize,
}

/// STUN or TURN endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FacingMode {
    User,
    Environment,
}

/// Resolution and frame-rate hints for local video capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub facing_mode: Option<FacingMode>,
}

impl CallConfig {
    /// Layer defaults, an optional config file and `HUDDLE__*` environment
    /// variables, in that order.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&CallConfig::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(config::Environment::with_prefix("HUDDLE").separator("__"))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    pub fn from_toml_str(source: &str) -> Result<Self> {
        Ok(toml::from_str(source)?)
    }

    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_secs)
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        CallConfig {
            ice_servers: vec![IceServer {
                urls: vec!["stun:stun.l.google.com:19302".to_string()],
                username: String::new(),
                credential: String::new(),
            }],
            ring_timeout_secs: 60,
            direct_video: VideoConstraints {
                width: 640,
                height: 480,
                frame_rate: 30,
                facing_mode: Some(FacingMode::User),
            },
            group_video: VideoConstraints {
                width: 480,
                height: 640,
                frame_rate: 30,
                facing_mode: None,
            },
            processed_call_capacity: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = CallConfig::default();
        assert_eq!(config.ring_timeout(), Duration::from_secs(60));
        assert_eq!(config.direct_video.width, 640);
        assert_eq!(config.group_video.height, 640);
        assert_eq!(config.ice_servers.len(), 1);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = CallConfig::from_toml_str(
            r#"
            ring_timeout_secs = 45

            [[ice_servers]]
            urls = ["turn:relay.example.org:443?transport=tcp"]
            username = "u"
            credential = "c"
            "#,
        )
        .expect("Should parse config");

        assert_eq!(config.ring_timeout_secs, 45);
        assert_eq!(config.ice_servers[0].username, "u");
        assert_eq!(config.processed_call_capacity, 256);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("Should create temp file");
        writeln!(file, "processed_call_capacity = 8").expect("Should write config");

        let config = CallConfig::load(Some(file.path())).expect("Should load config");
        assert_eq!(config.processed_call_capacity, 8);
        assert_eq!(config.ring_timeout_secs, 60);
    }
}
