//! Configuration tree for the collaboration hub.
//!
//! Loaded from a TOML file with camelCase keys; every section and field
//! falls back to its default, so a missing or partial file still yields a
//! runnable configuration.

use std::fs;
use std::io;
use std::path::Path;

use serde::Deserialize;

use conclave_media::{AudioConfig, VideoConfig};

/// Base-protocol configuration (the `collaboration` section).
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CollaborationConfig {
    /// Server host to connect to (client side).
    pub server_host_name: String,
    /// Server listen/connect port.
    pub server_port_id: u16,
    /// Display name announced by a client.
    pub client_name: String,
    /// Fan-out tick period in seconds (server side).
    pub tick_time: f64,
}

impl Default for CollaborationConfig {
    fn default() -> Self {
        CollaborationConfig {
            server_host_name: "localhost".into(),
            server_port_id: 26000,
            client_name: "anonymous".into(),
            tick_time: 0.02,
        }
    }
}

/// The full configuration tree.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub collaboration: CollaborationConfig,
    pub audio: AudioConfig,
    pub video: VideoConfig,
}

impl HubConfig {
    /// Load a configuration file.
    pub fn load(path: &Path) -> io::Result<HubConfig> {
        let text = fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|err| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{}: {}", path.display(), err),
            )
        })
    }

    /// Load `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> io::Result<HubConfig> {
        if path.exists() {
            HubConfig::load(path)
        } else {
            Ok(HubConfig::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_without_a_file() {
        let config = HubConfig::default();
        assert_eq!(config.collaboration.server_port_id, 26000);
        assert_eq!(config.collaboration.tick_time, 0.02);
        assert_eq!(config.audio.send_queue_size, 8);
        assert_eq!(config.audio.jitter_buffer_size, 6);
        assert!(!config.video.enable_capture);
    }

    #[test]
    fn partial_file_overrides_only_named_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[collaboration]
serverPortId = 31337
clientName = "cave-north"

[audio]
enableRecording = true
jitterBufferSize = 12

[video]
width = 640
height = 480
"#
        )
        .unwrap();

        let config = HubConfig::load(file.path()).unwrap();
        assert_eq!(config.collaboration.server_port_id, 31337);
        assert_eq!(config.collaboration.client_name, "cave-north");
        // Unnamed keys keep their defaults.
        assert_eq!(config.collaboration.tick_time, 0.02);
        assert!(config.audio.enable_recording);
        assert_eq!(config.audio.jitter_buffer_size, 12);
        assert_eq!(config.audio.send_queue_size, 8);
        assert_eq!(config.video.width, 640);
        assert_eq!(config.video.frame_rate, 15.0);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[collaboration\nserverPortId = oops").unwrap();
        assert!(HubConfig::load(file.path()).is_err());
    }
}
