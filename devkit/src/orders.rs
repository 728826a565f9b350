/*!
Builders pour les ordres du coordinateur

Produit les messages JSON tels qu'un coordinateur les pousse sur la file de
travail, et les envoie (une ligne JSON par ordre).
*/

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

pub struct OrderBuilder;

impl OrderBuilder {
    /// Ordre `update` (demande des détails machine)
    pub fn update(server: &str, send_back: u16) -> Value {
        json!({
            "order": "update",
            "server": server,
            "sendBack": send_back
        })
    }

    /// Ordre `SYNC` regroupant des directives
    pub fn sync(directives: Vec<Value>) -> Value {
        json!({
            "order": "SYNC",
            "directives": directives
        })
    }

    /// Directive de type 1 (instrument TCP sur `localhost:instrument_port`), sans parsing
    pub fn tcp_directive(
        server: &str,
        send_back_port: u16,
        instrument: &str,
        metaid: Value,
        instrument_port: u16,
    ) -> Value {
        json!({
            "server": server,
            "sendBackPort": send_back_port,
            "type": 1,
            "instrument": instrument,
            "metaid": metaid,
            "metaName": instrument.to_lowercase(),
            "database": "acquisition",
            "engine": "files",
            "remarks": {
                "port": instrument_port,
                "pollInterval": 2,
                "command": ""
            }
        })
    }

    /// Directive de type 0 (synchronisation d'un répertoire existant)
    ///
    /// Le répertoire et ses filtres voyagent dans `remarks`.
    pub fn directory_directive(
        server: &str,
        send_back_port: u16,
        instrument: &str,
        metaid: Value,
        path: &str,
        extension: &str,
    ) -> Value {
        json!({
            "server": server,
            "sendBackPort": send_back_port,
            "type": 0,
            "instrument": instrument,
            "metaid": metaid,
            "metaName": instrument.to_lowercase(),
            "remarks": {
                "path": path,
                "extension": extension,
                "pattern": ""
            }
        })
    }

    /// Ordre `GETPORTDATA` vers un instrument TCP
    pub fn port_data(server: &str, send_back: u16, instrument_port: u16, command: &str) -> Value {
        json!({
            "order": "GETPORTDATA",
            "server": server,
            "sendBack": send_back,
            "type": 1,
            "remarks": {
                "port": instrument_port,
                "pollInterval": 2,
                "command": command
            }
        })
    }

    /// Ordre `GETCOMMPORTS`
    pub fn comm_ports(server: &str, send_back: u16) -> Value {
        json!({
            "order": "GETCOMMPORTS",
            "server": server,
            "sendBack": send_back
        })
    }
}

/// Envoie un ordre sur la file de travail
pub async fn send_order(addr: SocketAddr, order: &Value) -> Result<()> {
    send_raw_line(addr, &serde_json::to_string(order)?).await
}

/// Envoie une ligne brute (y compris du JSON invalide)
pub async fn send_raw_line(addr: SocketAddr, line: &str) -> Result<()> {
    let mut stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("Failed to connect to work queue {}", addr))?;
    stream.write_all(line.as_bytes()).await?;
    stream.write_all(b"\n").await?;
    stream.shutdown().await?;
    log::info!("📨 Sent to {}: {} bytes", addr, line.len());
    Ok(())
}
