//! LAN discovery records and datagrams.
//!
//! A server publishes itself under the service type [`SERVICE_TYPE`]; a
//! controller browses for that type and turns every answer into a
//! [`DiscoveredDevice`].  Typing an IP address by hand produces the same
//! record through [`DiscoveredDevice::manual`], so the rest of the controller
//! never needs to know how a device was found.
//!
//! # Datagram format
//!
//! Discovery uses single UDP datagrams holding one JSON object each:
//!
//! ```json
//! {"kind":"probe","service":"soundplayer"}
//! {"kind":"announce","service":"soundplayer","name":"Nursery","port":9876,"version":"1"}
//! {"kind":"goodbye","service":"soundplayer","name":"Nursery"}
//! ```
//!
//! Controllers broadcast `probe`; servers answer with a unicast `announce`
//! and broadcast `goodbye` when they unpublish.

use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::protocol::DEFAULT_CONTROL_PORT;

/// Service type advertised by SoundLink servers.
pub const SERVICE_TYPE: &str = "soundplayer";

/// Protocol version carried in the announcement metadata.
pub const PROTOCOL_VERSION: &str = "1";

/// A server found on the LAN (or entered by hand).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Advertised device name.  Devices are deduplicated by name.
    pub name: String,
    /// Host name or address text to display.
    pub host: String,
    /// Address to connect to.
    pub address: IpAddr,
    /// Control-channel port.
    pub port: u16,
}

impl DiscoveredDevice {
    /// Builds a record from a hand-typed `"ip"` or `"ip:port"` string.
    ///
    /// Returns `None` when the text is neither.
    ///
    /// ```rust
    /// use soundlink_core::DiscoveredDevice;
    ///
    /// let d = DiscoveredDevice::manual("192.168.1.20").unwrap();
    /// assert_eq!(d.port, 9876);
    /// assert_eq!(d.name, "192.168.1.20");
    /// ```
    pub fn manual(input: &str) -> Option<Self> {
        let input = input.trim();
        let (address, port) = match input.parse::<SocketAddr>() {
            Ok(sock) => (sock.ip(), sock.port()),
            Err(_) => (input.parse::<IpAddr>().ok()?, DEFAULT_CONTROL_PORT),
        };
        Some(Self {
            name: address.to_string(),
            host: address.to_string(),
            address,
            port,
        })
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

/// One discovery datagram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DiscoveryDatagram {
    /// "Is anyone there?" broadcast by a browsing controller.
    Probe { service: String },

    /// A server's answer, or its unsolicited announcement.
    Announce {
        service: String,
        name: String,
        port: u16,
        version: String,
    },

    /// A server withdrawing its announcement.
    Goodbye { service: String, name: String },
}

impl DiscoveryDatagram {
    pub fn probe() -> Self {
        DiscoveryDatagram::Probe {
            service: SERVICE_TYPE.to_string(),
        }
    }

    pub fn announce(name: impl Into<String>, port: u16) -> Self {
        DiscoveryDatagram::Announce {
            service: SERVICE_TYPE.to_string(),
            name: name.into(),
            port,
            version: PROTOCOL_VERSION.to_string(),
        }
    }

    pub fn goodbye(name: impl Into<String>) -> Self {
        DiscoveryDatagram::Goodbye {
            service: SERVICE_TYPE.to_string(),
            name: name.into(),
        }
    }

    /// Returns `true` if the datagram belongs to the SoundLink service.
    pub fn is_ours(&self) -> bool {
        let service = match self {
            DiscoveryDatagram::Probe { service }
            | DiscoveryDatagram::Announce { service, .. }
            | DiscoveryDatagram::Goodbye { service, .. } => service,
        };
        service == SERVICE_TYPE
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_with_bare_ip_uses_control_port() {
        let d = DiscoveredDevice::manual(" 10.0.0.5 ").unwrap();
        assert_eq!(d.address, "10.0.0.5".parse::<IpAddr>().unwrap());
        assert_eq!(d.port, DEFAULT_CONTROL_PORT);
        assert_eq!(d.host, "10.0.0.5");
    }

    #[test]
    fn test_manual_with_explicit_port() {
        let d = DiscoveredDevice::manual("10.0.0.5:7000").unwrap();
        assert_eq!(d.port, 7000);
        assert_eq!(d.socket_addr(), "10.0.0.5:7000".parse().unwrap());
    }

    #[test]
    fn test_manual_rejects_garbage() {
        assert!(DiscoveredDevice::manual("not an address").is_none());
        assert!(DiscoveredDevice::manual("").is_none());
    }

    #[test]
    fn test_announce_datagram_json_shape() {
        let bytes = DiscoveryDatagram::announce("Nursery", 9876).to_bytes().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "kind": "announce",
                "service": "soundplayer",
                "name": "Nursery",
                "port": 9876,
                "version": "1"
            })
        );
    }

    #[test]
    fn test_from_bytes_parses_probe() {
        let d = DiscoveryDatagram::from_bytes(br#"{"kind":"probe","service":"soundplayer"}"#).unwrap();
        assert_eq!(d, DiscoveryDatagram::probe());
        assert!(d.is_ours());
    }

    #[test]
    fn test_foreign_service_is_not_ours() {
        let d = DiscoveryDatagram::Probe {
            service: "printer".into(),
        };
        assert!(!d.is_ours());
    }
}
