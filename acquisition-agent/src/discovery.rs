//! Node identification and multicast discovery
//!
//! This module handles:
//! - Primary MAC address detection with priority (Ethernet > WiFi > Other)
//! - Network interface enumeration with IP addresses
//! - Node identification (hostname, OS, architecture, node id from MAC)
//! - Answering coordinator "show"/"test" requests on a multicast group

use anyhow::{Context, Result};
use if_addrs::{get_if_addrs, IfAddr};
use mac_address::MacAddress;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::config::{DiscoveryConfig, TimeSyncConfig};
use crate::metrics::MachineDetails;
use crate::protocol::NtpRequest;
use crate::timesync::{self, TimeInfo};

/// Network interface information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub name: String,
    pub mac: String,
    pub ip: String,
    #[serde(rename = "type")]
    pub interface_type: InterfaceType,
}

/// Interface type classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceType {
    Ethernet,
    Wireless,
    Loopback,
    Other,
}

/// Complete network discovery result
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub primary_mac: Option<String>,
    pub interfaces: Vec<NetworkInterface>,
}

/// Who this node is, as reported to coordinators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub id: String,
    pub hostname: String,
    pub os: String,
    pub architecture: String,
}

impl NodeIdentity {
    /// Discover identity and network layout.
    ///
    /// The node id is the primary MAC without colons, or the hostname when
    /// no interface exposes a MAC.
    pub async fn discover() -> (Self, NetworkInfo) {
        let network = match NetworkInfo::discover().await {
            Ok(network) => network,
            Err(e) => {
                warn!("Network discovery failed: {:#}", e);
                NetworkInfo::default()
            }
        };

        let hostname = gethostname::gethostname().to_string_lossy().to_string();

        let id = network
            .primary_mac
            .as_ref()
            .map(|mac| mac.replace(':', ""))
            .unwrap_or_else(|| hostname.clone());

        let identity = NodeIdentity {
            id,
            hostname,
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
        };

        info!(
            "Discovery complete - Node ID: {}, Hostname: {}, OS: {}",
            identity.id, identity.hostname, identity.os
        );

        (identity, network)
    }
}

impl NetworkInfo {
    /// Discover network interfaces and determine primary MAC
    pub async fn discover() -> Result<Self> {
        debug!("Enumerating network interfaces...");

        let if_addrs = get_if_addrs().context("Failed to enumerate network interfaces")?;

        let mut interfaces = Vec::new();
        for if_addr in if_addrs {
            if if_addr.is_loopback() {
                continue;
            }

            let ip = match if_addr.addr {
                IfAddr::V4(v4) => v4.ip.to_string(),
                IfAddr::V6(v6) => v6.ip.to_string(),
            };

            if let Some(mac) = Self::get_interface_mac(&if_addr.name) {
                let interface = NetworkInterface {
                    name: if_addr.name.clone(),
                    mac: format_mac(&mac),
                    ip,
                    interface_type: Self::classify_interface(&if_addr.name),
                };

                debug!("Found interface: {} ({})", interface.name, interface.mac);
                interfaces.push(interface);
            }
        }

        let primary_mac = Self::select_primary_mac(&interfaces);

        Ok(NetworkInfo {
            primary_mac,
            interfaces,
        })
    }

    fn get_interface_mac(interface_name: &str) -> Option<MacAddress> {
        match mac_address::mac_address_by_name(interface_name) {
            Ok(Some(mac)) => Some(mac),
            Ok(None) => {
                debug!("No MAC found for interface: {}", interface_name);
                None
            }
            Err(e) => {
                debug!("Error getting MAC for {}: {}", interface_name, e);
                None
            }
        }
    }

    /// Classify interface type based on name patterns
    fn classify_interface(name: &str) -> InterfaceType {
        let name_lower = name.to_lowercase();

        if name_lower == "lo" || name_lower.starts_with("lo0") || name_lower.contains("loopback") {
            return InterfaceType::Loopback;
        }

        if name_lower.contains("wlan")
            || name_lower.contains("wifi")
            || name_lower.contains("wlp")
            || name_lower.contains("wlo")
        {
            return InterfaceType::Wireless;
        }

        if name_lower.starts_with("eth") || name_lower.starts_with("en") {
            return InterfaceType::Ethernet;
        }

        InterfaceType::Other
    }

    /// Ethernet first, then wireless, then whatever comes first
    fn select_primary_mac(interfaces: &[NetworkInterface]) -> Option<String> {
        [InterfaceType::Ethernet, InterfaceType::Wireless]
            .iter()
            .find_map(|wanted| interfaces.iter().find(|i| i.interface_type == *wanted))
            .or_else(|| interfaces.first())
            .map(|i| {
                debug!("Selected {} as primary interface", i.name);
                i.mac.clone()
            })
    }
}

fn format_mac(mac: &MacAddress) -> String {
    let b = mac.bytes();
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        b[0], b[1], b[2], b[3], b[4], b[5]
    )
}

/// Query sent by coordinators on the multicast group
#[derive(Debug, Deserialize)]
struct Query {
    message: String,
    #[serde(default)]
    ntp: Option<NtpRequest>,
    #[serde(default, rename = "idTest")]
    id_test: Option<String>,
    #[serde(default, rename = "shareStr")]
    share_str: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "message", rename_all = "lowercase")]
enum DiscoveryReply<'a> {
    Show {
        node: &'a NodeIdentity,
        port: u16,
        details: MachineDetails,
        announcer: String,
    },
    Found {
        node: &'a NodeIdentity,
        port: u16,
        details: MachineDetails,
        interfaces: &'a [NetworkInterface],
        announcer: String,
    },
}

/// Answers discovery queries; the receive loop never exits
pub struct DiscoveryResponder {
    socket: UdpSocket,
    identity: NodeIdentity,
    /// Work-queue port coordinators should send orders to
    work_port: u16,
    network: NetworkInfo,
    share_secret: String,
    time_sync: TimeSyncConfig,
}

impl DiscoveryResponder {
    /// Bind the discovery port and join the multicast group
    pub async fn bind(
        config: &DiscoveryConfig,
        identity: NodeIdentity,
        work_port: u16,
        network: NetworkInfo,
        share_secret: String,
        time_sync: TimeSyncConfig,
    ) -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, config.port))
            .await
            .with_context(|| format!("Failed to bind discovery port {}", config.port))?;
        socket
            .join_multicast_v4(config.group, config.interface)
            .with_context(|| format!("Failed to join multicast group {}", config.group))?;

        info!("Discovery listening on {}:{}", config.group, config.port);
        Ok(Self::from_socket(socket, identity, work_port, network, share_secret, time_sync))
    }

    /// Use an already bound socket (unicast queries only)
    pub fn from_socket(
        socket: UdpSocket,
        identity: NodeIdentity,
        work_port: u16,
        network: NetworkInfo,
        share_secret: String,
        time_sync: TimeSyncConfig,
    ) -> Self {
        Self {
            socket,
            identity,
            work_port,
            network,
            share_secret,
            time_sync,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn run(self) {
        let mut buf = vec![0u8; 8192];
        loop {
            let (len, peer) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!("Discovery receive error: {}", e);
                    continue;
                }
            };

            match self.respond(&buf[..len], peer).await {
                Ok(Some(reply)) => {
                    if let Err(e) = self.socket.send_to(&reply, peer).await {
                        warn!("Discovery reply to {} failed: {}", peer, e);
                    }
                }
                Ok(None) => {}
                Err(e) => debug!("Ignoring malformed query from {}: {:#}", peer, e),
            }
        }
    }

    /// Build the reply to one datagram, if it deserves one
    async fn respond(&self, datagram: &[u8], peer: SocketAddr) -> Result<Option<Vec<u8>>> {
        let query: Query = serde_json::from_slice(datagram).context("Query is not valid JSON")?;

        let reply = match query.message.as_str() {
            "show" => DiscoveryReply::Show {
                node: &self.identity,
                port: self.work_port,
                details: self.details(query.ntp.as_ref()).await,
                announcer: peer.to_string(),
            },
            "test" => {
                let id_matches = query.id_test.as_deref() == Some(self.identity.id.as_str());
                let secret_matches = query.share_str.as_deref() == Some(self.share_secret.as_str());
                if !(id_matches && secret_matches) {
                    debug!("Test query from {} does not match this node", peer);
                    return Ok(None);
                }
                DiscoveryReply::Found {
                    node: &self.identity,
                    port: self.work_port,
                    details: self.details(query.ntp.as_ref()).await,
                    interfaces: &self.network.interfaces,
                    announcer: peer.to_string(),
                }
            }
            other => {
                debug!("Ignoring '{}' query from {}", other, peer);
                return Ok(None);
            }
        };

        Ok(Some(serde_json::to_vec(&reply)?))
    }

    async fn details(&self, ntp: Option<&NtpRequest>) -> MachineDetails {
        let time_info = match ntp {
            Some(request) => timesync::time_info(&self.time_sync, Some(request)).await,
            None => TimeInfo::unavailable(),
        };
        MachineDetails::collect(time_info).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn identity() -> NodeIdentity {
        NodeIdentity {
            id: "a1b2c3d4e5f6".into(),
            hostname: "bench-node".into(),
            os: "linux".into(),
            architecture: "x86_64".into(),
        }
    }

    async fn responder() -> DiscoveryResponder {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        DiscoveryResponder::from_socket(
            socket,
            identity(),
            7100,
            NetworkInfo::default(),
            "s3cret".into(),
            TimeSyncConfig::default(),
        )
    }

    #[test]
    fn test_interface_classification() {
        assert_eq!(NetworkInfo::classify_interface("eth0"), InterfaceType::Ethernet);
        assert_eq!(NetworkInfo::classify_interface("enp3s0"), InterfaceType::Ethernet);
        assert_eq!(NetworkInfo::classify_interface("wlan0"), InterfaceType::Wireless);
        assert_eq!(NetworkInfo::classify_interface("lo"), InterfaceType::Loopback);
        assert_eq!(NetworkInfo::classify_interface("docker0"), InterfaceType::Other);
    }

    #[test]
    fn test_primary_mac_priority() {
        let iface = |name: &str, mac: &str, kind| NetworkInterface {
            name: name.into(),
            mac: mac.into(),
            ip: "10.0.0.1".into(),
            interface_type: kind,
        };
        let interfaces = vec![
            iface("docker0", "02:00:00:00:00:01", InterfaceType::Other),
            iface("wlan0", "02:00:00:00:00:02", InterfaceType::Wireless),
            iface("eth0", "02:00:00:00:00:03", InterfaceType::Ethernet),
        ];
        assert_eq!(
            NetworkInfo::select_primary_mac(&interfaces).as_deref(),
            Some("02:00:00:00:00:03")
        );
        assert_eq!(
            NetworkInfo::select_primary_mac(&interfaces[..2]).as_deref(),
            Some("02:00:00:00:00:02")
        );
        assert!(NetworkInfo::select_primary_mac(&[]).is_none());
    }

    #[tokio::test]
    async fn test_show_query_answered() {
        let responder = responder().await;
        let peer: SocketAddr = "192.168.1.20:40000".parse().unwrap();

        let reply = responder
            .respond(br#"{"message":"show"}"#, peer)
            .await
            .unwrap()
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&reply).unwrap();
        assert_eq!(value["message"], "show");
        assert_eq!(value["node"]["id"], "a1b2c3d4e5f6");
        assert_eq!(value["port"], 7100);
        assert_eq!(value["announcer"], "192.168.1.20:40000");
        assert!(value["details"]["ram"]["total"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_test_query_requires_secret() {
        let responder = responder().await;
        let peer: SocketAddr = "192.168.1.20:40000".parse().unwrap();

        let wrong = br#"{"message":"test","idTest":"a1b2c3d4e5f6","shareStr":"guess"}"#;
        assert!(responder.respond(wrong, peer).await.unwrap().is_none());

        let other_node = br#"{"message":"test","idTest":"ffffffffffff","shareStr":"s3cret"}"#;
        assert!(responder.respond(other_node, peer).await.unwrap().is_none());

        let right = br#"{"message":"test","idTest":"a1b2c3d4e5f6","shareStr":"s3cret"}"#;
        let reply = responder.respond(right, peer).await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&reply).unwrap();
        assert_eq!(value["message"], "found");
        assert_eq!(value["port"], 7100);
        assert!(value["interfaces"].is_array());
    }

    #[tokio::test]
    async fn test_loop_survives_garbage() {
        let responder = responder().await;
        let addr = responder.local_addr().unwrap();
        tokio::spawn(responder.run());

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"\xff\xfe garbage", addr).await.unwrap();
        client.send_to(br#"{"message":"show"}"#, addr).await.unwrap();

        let mut buf = vec![0u8; 65_536];
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&buf[..len]).unwrap();
        assert_eq!(value["message"], "show");
    }
}
