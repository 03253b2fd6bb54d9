use crate::proto::AppVersion;
use serde_derive::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

/// Request/reply control port of Gen3/4 hosts.
pub const CONTROL_PORT_TCP: u16 = 47995;
/// Reliable-UDP control port of Gen5+ hosts.
pub const CONTROL_PORT_ENET: u16 = 47999;
/// Dedicated input port, only used below Gen5.
pub const INPUT_PORT_TCP: u16 = 35043;

/// Everything the session needs from the preceding RTSP negotiation.
#[derive(Serialize, Deserialize, Clone)]
pub struct StreamConfig {
    /// Host address. Reliable-UDP generations require IPv4.
    pub remote_addr: IpAddr,
    /// AES-128 key negotiated for the input/control ciphers.
    pub remote_input_aes_key: [u8; 16],
    /// Initial IV for the legacy input cipher.
    pub remote_input_aes_iv: [u8; 16],
    /// Whether lost frame ranges may be reported to the encoder instead of
    /// demanding a full IDR frame.
    pub reference_frame_invalidation: bool,
    /// Reported server version; selects transport, wire tables and crypto.
    pub app_version: AppVersion,
}

impl Default for StreamConfig {
    fn default() -> StreamConfig {
        StreamConfig {
            app_version: AppVersion::new(7, 1, 431, 0),
            remote_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            remote_input_aes_key: [0; 16],
            remote_input_aes_iv: [0; 16],
            reference_frame_invalidation: true,
        }
    }
}

impl StreamConfig {
    /// Loads a configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> StreamConfig {
        serdeconv::from_toml_file(path).expect("Error loading stream configuration file")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toml_roundtrip() {
        let mut config = StreamConfig::default();
        config.app_version = AppVersion::new(7, 1, 415, 0);
        config.remote_input_aes_key = [7; 16];
        config.reference_frame_invalidation = false;

        let toml = serdeconv::to_toml_string(&config).unwrap();
        let loaded: StreamConfig = serdeconv::from_toml_str(&toml).unwrap();

        assert_eq!(loaded.app_version, AppVersion::new(7, 1, 415, 0));
        assert_eq!(loaded.remote_addr, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(loaded.remote_input_aes_key, [7; 16]);
        assert!(!loaded.reference_frame_invalidation);
    }

    #[test]
    fn test_default_targets_current_generation() {
        let config = StreamConfig::default();

        assert!(config.app_version.encrypted_control());
        assert!(config.reference_frame_invalidation);
    }
}
