//! API listener and channel topology configuration.

use serde::Deserialize;

/// gRPC API listener configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenApiConfig {
    /// Token expected in the `authorization` metadata. Empty disables the check.
    #[serde(alias = "accessToken", alias = "accesstoken")]
    pub access_token: String,
    /// Address the gRPC API binds to.
    #[serde(alias = "addressGRPC", alias = "addressgrpc")]
    pub address_grpc: String,
}

impl Default for ListenApiConfig {
    fn default() -> Self {
        Self {
            access_token: String::new(),
            address_grpc: "0.0.0.0:5080".to_string(),
        }
    }
}

/// Batcher endpoint of a channel.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BatcherEndpoint {
    /// gRPC address of the batcher (e.g., "localhost:8881").
    #[serde(alias = "addressGRPC", alias = "addressgrpc")]
    pub address_grpc: String,
}

/// A destination channel served by this orchestrator.
///
/// Written either as a bare name or as `{name, batcher}`. Names are
/// case-insensitive and kept lowercased.
#[derive(Debug, Clone, Deserialize)]
#[serde(from = "ChannelEntry")]
pub struct ChannelConfig {
    /// Channel name, as used in transfer requests.
    pub name: String,
    /// Batcher executing transfers into this channel.
    pub batcher: BatcherEndpoint,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ChannelEntry {
    Name(String),
    Full {
        name: String,
        #[serde(default)]
        batcher: BatcherEndpoint,
    },
}

impl From<ChannelEntry> for ChannelConfig {
    fn from(entry: ChannelEntry) -> Self {
        let (name, batcher) = match entry {
            ChannelEntry::Name(name) => (name, BatcherEndpoint::default()),
            ChannelEntry::Full { name, batcher } => (name, batcher),
        };
        Self {
            name: name.to_lowercase(),
            batcher,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_api_default() {
        let listen = ListenApiConfig::default();
        assert!(listen.access_token.is_empty());
        assert_eq!(listen.address_grpc, "0.0.0.0:5080");
    }

    #[test]
    fn test_channel_entry_forms() {
        let channels: Vec<ChannelConfig> = serde_yaml::from_str(
            r#"
- CC
- name: Fiat
  batcher:
    addressGRPC: localhost:8882
"#,
        )
        .unwrap();
        assert_eq!(channels[0].name, "cc");
        assert!(channels[0].batcher.address_grpc.is_empty());
        assert_eq!(channels[1].name, "fiat");
        assert_eq!(channels[1].batcher.address_grpc, "localhost:8882");
    }
}
