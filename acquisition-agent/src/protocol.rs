//! Wire messages exchanged with the coordinator
//!
//! Orders arrive on the work queue as JSON objects discriminated by `order`:
//! - `update`       → reply `DETAILSOVER` with machine details
//! - `SYNC`         → fan out one acquisition worker per directive
//! - `GETPORTDATA`  → inline peripheral read, reply `PORTDATA`
//! - `GETCOMMPORTS` → serial port enumeration, reply `COMMPORTS`
//!
//! Workers answer every directive with exactly one `METASYNCOVER`.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::discovery::NodeIdentity;
use crate::error::AgentError;
use crate::metrics::MachineDetails;
use crate::readers::{CommPort, ReadOutcome};

/// Unique source identifier, the lock key of an instrument.
///
/// Coordinators send it either as a number or as a string; it is echoed back
/// in the form it arrived.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaId {
    Number(i64),
    Text(String),
}

impl fmt::Display for MetaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaId::Number(n) => write!(f, "{}", n),
            MetaId::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for MetaId {
    fn from(value: i64) -> Self {
        MetaId::Number(value)
    }
}

impl From<&str> for MetaId {
    fn from(value: &str) -> Self {
        MetaId::Text(value.to_string())
    }
}

/// Directive `type` discriminator (0, 1 or 2 on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum DirectiveKind {
    DirectorySync,
    TcpPeripheral,
    SerialPeripheral,
}

impl TryFrom<u8> for DirectiveKind {
    type Error = AgentError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(DirectiveKind::DirectorySync),
            1 => Ok(DirectiveKind::TcpPeripheral),
            2 => Ok(DirectiveKind::SerialPeripheral),
            other => Err(AgentError::UnsupportedDirectiveType(other)),
        }
    }
}

impl From<DirectiveKind> for u8 {
    fn from(kind: DirectiveKind) -> Self {
        match kind {
            DirectiveKind::DirectorySync => 0,
            DirectiveKind::TcpPeripheral => 1,
            DirectiveKind::SerialPeripheral => 2,
        }
    }
}

/// A single unit of work requested by the coordinator.
///
/// Consumed by exactly one acquisition worker, never persisted.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Directive {
    pub server: String,
    #[serde(alias = "sendBack")]
    pub send_back_port: u16,
    #[serde(rename = "type")]
    pub kind: DirectiveKind,
    pub instrument: String,
    pub metaid: MetaId,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub backup_port: Option<u16>,
    #[serde(default)]
    pub backup_user: String,
    #[serde(default)]
    pub backup_pass: String,
    #[serde(default, rename = "serverDB")]
    pub server_db: Option<String>,
    #[serde(default)]
    pub engine: String,
    #[serde(default)]
    pub meta_name: String,
    /// Peripheral settings (types 1 and 2) or the directory to sync (type 0)
    #[serde(default)]
    pub remarks: Option<serde_json::Value>,
    #[serde(default)]
    pub channels: Vec<Channel>,
}

impl Directive {
    /// `remarks` read as a TCP/serial peripheral configuration
    pub fn peripheral_config(&self) -> Result<PeripheralConfig, AgentError> {
        self.remarks_as()
    }

    /// `remarks` read as the metadata directory of a type 0 directive
    pub fn directory_source(&self) -> Result<DirectorySource, AgentError> {
        let source: DirectorySource = self.remarks_as()?;
        if source.path.trim().is_empty() {
            return Err(AgentError::MissingMetaDirectory(self.metaid.clone()));
        }
        Ok(source)
    }

    fn remarks_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, AgentError> {
        let remarks = self
            .remarks
            .as_ref()
            .ok_or_else(|| AgentError::MissingRemarks(self.metaid.clone()))?;
        T::deserialize(remarks).map_err(|e| AgentError::InvalidRemarks {
            metaid: self.metaid.clone(),
            reason: e.to_string(),
        })
    }
}

/// Directory-sync source carried in the `remarks` of type 0 directives
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectorySource {
    #[serde(default)]
    pub path: String,
    /// File extension filter, without the dot
    #[serde(default)]
    pub extension: String,
    /// Substring the synced file names must contain
    #[serde(default)]
    pub pattern: String,
}

/// Device, port and parsing configuration carried in `remarks`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeripheralConfig {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub device: Option<String>,
    /// Poll interval in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval: f64,
    #[serde(default)]
    pub command: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default = "default_parity")]
    pub parity: String,
    #[serde(default = "default_bytesize")]
    pub bytesize: u8,
    #[serde(default)]
    pub stopbits: u8,
    #[serde(default)]
    pub parse: Option<ParseInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseInfo {
    #[serde(default = "default_separator")]
    pub separator: String,
    /// Line terminator for serial captures; TCP captures always split on `\n`
    #[serde(default = "default_terminator")]
    pub terminator: String,
    #[serde(default)]
    pub time_provided: bool,
}

/// Field extraction rule: `[min, max)` character range within a line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    #[serde(default)]
    pub name: String,
    pub min: usize,
    pub max: usize,
}

fn default_poll_interval() -> f64 {
    60.0
}

fn default_baud() -> u32 {
    9600
}

fn default_parity() -> String {
    "N".to_string()
}

fn default_bytesize() -> u8 {
    8
}

fn default_separator() -> String {
    ",".to_string()
}

fn default_terminator() -> String {
    "\n".to_string()
}

/// Inbound work-queue message
#[derive(Debug, Deserialize)]
#[serde(tag = "order")]
pub enum WorkOrder {
    #[serde(rename = "update")]
    Update(UpdateOrder),
    #[serde(rename = "SYNC")]
    Sync(SyncOrder),
    #[serde(rename = "GETPORTDATA")]
    GetPortData(PortDataOrder),
    #[serde(rename = "GETCOMMPORTS")]
    GetCommPorts(CommPortsOrder),
}

#[derive(Debug, Deserialize)]
pub struct UpdateOrder {
    pub server: String,
    #[serde(rename = "sendBack", alias = "sendBackPort")]
    pub send_back: u16,
    #[serde(default)]
    pub ntp: Option<NtpRequest>,
}

/// Optional time-sync request attached to `update` and discovery queries
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NtpRequest {
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub apply: bool,
}

/// Directives are kept as raw JSON so one malformed entry does not discard
/// the whole batch.
#[derive(Debug, Deserialize)]
pub struct SyncOrder {
    #[serde(default)]
    pub directives: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct PortDataOrder {
    pub server: String,
    #[serde(rename = "sendBack", alias = "sendBackPort")]
    pub send_back: u16,
    #[serde(rename = "type")]
    pub kind: DirectiveKind,
    pub remarks: PeripheralConfig,
}

#[derive(Debug, Deserialize)]
pub struct CommPortsOrder {
    pub server: String,
    #[serde(rename = "sendBack", alias = "sendBackPort")]
    pub send_back: u16,
}

/// Terminal status report a worker sends back for its directive
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionMessage {
    pub server: String,
    pub engine: String,
    pub database: String,
    pub instrument: String,
    pub metaid: MetaId,
    pub meta_name: String,
    pub errors: Vec<String>,
}

impl CompletionMessage {
    /// `server` names the database server when the directive has one
    pub fn for_directive(directive: &Directive, errors: Vec<String>) -> Self {
        let server = directive
            .server_db
            .as_deref()
            .filter(|db| !db.trim().is_empty())
            .unwrap_or(&directive.server);

        Self {
            server: server.to_string(),
            engine: directive.engine.clone(),
            database: directive.database.clone(),
            instrument: directive.instrument.clone(),
            metaid: directive.metaid.clone(),
            meta_name: directive.meta_name.clone(),
            errors,
        }
    }
}

/// Outbound reply to the coordinator
#[derive(Debug, Serialize)]
#[serde(tag = "order")]
pub enum Reply {
    #[serde(rename = "DETAILSOVER")]
    Details {
        node: NodeIdentity,
        details: MachineDetails,
        /// Work-queue port of this node
        port: u16,
    },
    #[serde(rename = "PORTDATA")]
    PortData(ReadOutcome),
    #[serde(rename = "COMMPORTS")]
    CommPorts { ports: Vec<CommPort> },
    #[serde(rename = "METASYNCOVER")]
    MetaSyncOver(CompletionMessage),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sync_order_parsing() {
        let raw = json!({
            "order": "SYNC",
            "directives": [{
                "server": "10.0.0.2",
                "sendBackPort": 6000,
                "type": 1,
                "instrument": "Therm1",
                "metaid": 42,
                "metaName": "temperature",
                "remarks": { "port": 7001, "pollInterval": 2.5 },
                "channels": [{ "name": "t", "min": 0, "max": 4 }]
            }]
        });

        let order: WorkOrder = serde_json::from_value(raw).unwrap();
        let WorkOrder::Sync(sync) = order else {
            panic!("expected SYNC order");
        };
        let directive: Directive = serde_json::from_value(sync.directives[0].clone()).unwrap();
        assert_eq!(directive.kind, DirectiveKind::TcpPeripheral);
        assert_eq!(directive.metaid, MetaId::Number(42));
        assert_eq!(directive.send_back_port, 6000);

        let remarks = directive.peripheral_config().unwrap();
        assert_eq!(remarks.port, Some(7001));
        assert_eq!(remarks.baud, 9600);
        assert!(remarks.command.is_empty());
        assert!(remarks.parse.is_none());
    }

    #[test]
    fn test_unknown_directive_type_rejected() {
        let raw = json!({
            "server": "s", "sendBack": 1, "type": 7, "instrument": "x", "metaid": "m"
        });
        let err = serde_json::from_value::<Directive>(raw).unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }

    #[test]
    fn test_unknown_order_rejected() {
        let raw = json!({ "order": "REBOOT" });
        assert!(serde_json::from_value::<WorkOrder>(raw).is_err());
    }

    #[test]
    fn test_directory_source_from_remarks() {
        let raw = json!({
            "server": "10.0.0.2", "sendBackPort": 6000, "type": 0,
            "instrument": "Camera", "metaid": 3,
            "remarks": { "path": "/data/cam", "extension": "fits", "pattern": "run" }
        });
        let directive: Directive = serde_json::from_value(raw).unwrap();
        let source = directive.directory_source().unwrap();
        assert_eq!(source.path, "/data/cam");
        assert_eq!(source.extension, "fits");
        assert_eq!(source.pattern, "run");

        let mut empty = directive.clone();
        empty.remarks = Some(json!({ "extension": "fits" }));
        assert!(matches!(empty.directory_source(), Err(AgentError::MissingMetaDirectory(_))));

        empty.remarks = None;
        assert!(matches!(empty.directory_source(), Err(AgentError::MissingRemarks(_))));

        empty.remarks = Some(json!({ "path": 12 }));
        assert!(matches!(empty.directory_source(), Err(AgentError::InvalidRemarks { .. })));
    }

    #[test]
    fn test_completion_reports_database_server() {
        let raw = json!({
            "server": "127.0.0.1", "sendBackPort": 6000, "type": 0,
            "instrument": "Camera", "metaid": 3, "serverDB": "dbhost"
        });
        let mut directive: Directive = serde_json::from_value(raw).unwrap();
        assert_eq!(CompletionMessage::for_directive(&directive, vec![]).server, "dbhost");

        directive.server_db = None;
        assert_eq!(CompletionMessage::for_directive(&directive, vec![]).server, "127.0.0.1");
    }

    #[test]
    fn test_completion_message_shape() {
        let completion = CompletionMessage {
            server: "10.0.0.2".into(),
            engine: "pg".into(),
            database: "lab".into(),
            instrument: "Therm1".into(),
            metaid: MetaId::Text("abc".into()),
            meta_name: "temperature".into(),
            errors: vec![],
        };

        let value = serde_json::to_value(Reply::MetaSyncOver(completion)).unwrap();
        assert_eq!(value["order"], "METASYNCOVER");
        assert_eq!(value["metaid"], "abc");
        assert_eq!(value["metaName"], "temperature");
        assert_eq!(value["errors"], json!([]));
    }
}
