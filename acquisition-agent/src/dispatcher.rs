//! Dispatcher loop
//!
//! Single sequential consumer of the work queue. Point queries (`update`,
//! `GETPORTDATA`, `GETCOMMPORTS`) are answered inline; `SYNC` directives
//! are fanned out to workers after taking the instrument lock. Nothing a
//! coordinator sends can stop the loop: every failure ends up in the log
//! sink and the next message is processed.

use anyhow::{bail, Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info};

use crate::config::{AgentConfig, TimeSyncConfig};
use crate::discovery::NodeIdentity;
use crate::error::AgentError;
use crate::log_error;
use crate::log_sink::LogClient;
use crate::metrics::MachineDetails;
use crate::protocol::{
    CommPortsOrder, Directive, DirectiveKind, PortDataOrder, Reply, SyncOrder, UpdateOrder, WorkOrder,
};
use crate::readers::{self, ReadOutcome, SerialSettings};
use crate::registry::RegistryHandle;
use crate::sync::DirectorySync;
use crate::timesync::{self, TimeInfo};
use crate::wire;
use crate::worker::{self, WorkerContext};

const PROCESS: &str = "dispatcher";
const KNOWN_ORDERS: [&str; 4] = ["update", "SYNC", "GETPORTDATA", "GETCOMMPORTS"];
const QUEUE_DEPTH: usize = 256;

pub struct Dispatcher<S> {
    listener: TcpListener,
    handler: OrderHandler<S>,
}

/// Everything needed to act on one order
pub struct OrderHandler<S> {
    registry: RegistryHandle,
    workers: WorkerContext<S>,
    identity: NodeIdentity,
    /// Work-queue port, advertised in `DETAILSOVER`
    port: u16,
    time_sync: TimeSyncConfig,
    log: LogClient,
}

impl<S: DirectorySync> Dispatcher<S> {
    /// Bind the work queue and start the lock registry
    pub async fn bind(config: &AgentConfig, sync: S, identity: NodeIdentity, log: LogClient) -> Result<Self> {
        let listener = TcpListener::bind(config.dispatcher.bind)
            .await
            .with_context(|| format!("Failed to bind work queue on {}", config.dispatcher.bind))?;
        let port = listener.local_addr()?.port();

        let (registry, _registry_task) = RegistryHandle::spawn();

        let workers = WorkerContext {
            temp_dir: config.dispatcher.temp_dir.clone(),
            sync: Arc::new(sync),
            log: log.clone(),
            timeout: Duration::from_secs(config.dispatcher.worker_timeout_secs.max(1)),
            pool: Arc::new(Semaphore::new(config.dispatcher.max_workers.max(1))),
        };

        Ok(Self {
            listener,
            handler: OrderHandler {
                registry,
                workers,
                identity,
                port,
                time_sync: config.time_sync.clone(),
                log,
            },
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn handler(&self) -> &OrderHandler<S> {
        &self.handler
    }

    /// Consume the work queue until the listener goes away
    pub async fn run(self) -> Result<()> {
        let Dispatcher { listener, handler } = self;
        info!("Dispatcher listening on {}", listener.local_addr()?);

        let (tx, mut rx) = mpsc::channel(QUEUE_DEPTH);
        let _listener_task = wire::spawn_line_listener(listener, tx);

        while let Some(line) = rx.recv().await {
            handler.handle_line(&line).await;
        }

        bail!("work queue listener stopped")
    }
}

impl<S: DirectorySync> OrderHandler<S> {
    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Handle one work-queue line; errors are reported, never returned
    pub async fn handle_line(&self, line: &str) {
        if let Err(e) = self.dispatch(line).await {
            log_error!(self.log, PROCESS, e);
        }
    }

    async fn dispatch(&self, line: &str) -> Result<()> {
        let value: serde_json::Value =
            serde_json::from_str(line).context("work queue message is not valid JSON")?;

        let Some(order) = value.get("order") else {
            debug!("Ignoring message without order");
            return Ok(());
        };
        let name = match order.as_str() {
            Some(name) => name.to_string(),
            None => order.to_string(),
        };
        if !KNOWN_ORDERS.contains(&name.as_str()) {
            return Err(AgentError::UnknownOrder(name).into());
        }

        let order: WorkOrder =
            serde_json::from_value(value).with_context(|| format!("malformed {} order", name))?;

        match order {
            WorkOrder::Update(order) => self.update(order).await,
            WorkOrder::Sync(order) => self.sync(order).await,
            WorkOrder::GetPortData(order) => self.port_data(order).await,
            WorkOrder::GetCommPorts(order) => self.comm_ports(order).await,
        }
    }

    async fn update(&self, order: UpdateOrder) -> Result<()> {
        let time_info = match &order.ntp {
            Some(request) => timesync::time_info(&self.time_sync, Some(request)).await,
            None => TimeInfo::unavailable(),
        };

        let reply = Reply::Details {
            node: self.identity.clone(),
            port: self.port,
            details: MachineDetails::collect(time_info).await,
        };
        wire::send_json(&order.server, order.send_back, &reply)
            .await
            .context("DETAILSOVER reply failed")
    }

    async fn sync(&self, order: SyncOrder) -> Result<()> {
        for raw in order.directives {
            let directive: Directive = match serde_json::from_value(raw) {
                Ok(directive) => directive,
                Err(e) => {
                    let err = anyhow::Error::new(e).context("malformed directive");
                    log_error!(self.log, PROCESS, err);
                    continue;
                }
            };

            match self.registry.try_acquire(&directive.metaid).await? {
                Some(lease) => {
                    debug!("Dispatching {} ({})", directive.instrument, directive.metaid);
                    worker::spawn(self.workers.clone(), lease, directive);
                }
                None => debug!("{} busy, directive dropped", directive.metaid),
            }
        }
        Ok(())
    }

    async fn port_data(&self, order: PortDataOrder) -> Result<()> {
        let remarks = &order.remarks;
        let outcome = match order.kind {
            DirectiveKind::TcpPeripheral => match remarks.port {
                Some(port) => readers::read_tcp(port, remarks.poll_interval, &remarks.command).await,
                None => ReadOutcome::failure(AgentError::MissingPeripheralField("port")),
            },
            DirectiveKind::SerialPeripheral => match SerialSettings::from_config(remarks) {
                Ok(settings) => readers::read_serial(settings, remarks.poll_interval, &remarks.command).await,
                Err(e) => ReadOutcome::failure(e),
            },
            DirectiveKind::DirectorySync => {
                ReadOutcome::failure(AgentError::UnsupportedDirectiveType(order.kind.into()))
            }
        };

        wire::send_json(&order.server, order.send_back, &Reply::PortData(outcome))
            .await
            .context("PORTDATA reply failed")
    }

    async fn comm_ports(&self, order: CommPortsOrder) -> Result<()> {
        let ports = match tokio::task::spawn_blocking(readers::list_comm_ports).await {
            Ok(Ok(ports)) => ports,
            Ok(Err(e)) => {
                log_error!(self.log, PROCESS, e);
                Vec::new()
            }
            Err(e) => {
                log_error!(self.log, PROCESS, e);
                Vec::new()
            }
        };

        wire::send_json(&order.server, order.send_back, &Reply::CommPorts { ports })
            .await
            .context("COMMPORTS reply failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MetaId;
    use crate::sync::SyncRequest;
    use serde_json::json;
    use tokio::io::AsyncBufReadExt;

    struct NoopSync;

    impl DirectorySync for NoopSync {
        async fn sync(&self, _request: &SyncRequest) -> Result<()> {
            Ok(())
        }
    }

    async fn dispatcher() -> Dispatcher<NoopSync> {
        let mut config = AgentConfig::default();
        config.dispatcher.bind = "127.0.0.1:0".parse().unwrap();
        let identity = NodeIdentity {
            id: "node1".into(),
            hostname: "bench".into(),
            os: "linux".into(),
            architecture: "x86_64".into(),
        };
        Dispatcher::bind(&config, NoopSync, identity, LogClient::local_only())
            .await
            .unwrap()
    }

    async fn reply_on(listener: &TcpListener) -> serde_json::Value {
        let (stream, _) = tokio::time::timeout(Duration::from_secs(10), listener.accept())
            .await
            .unwrap()
            .unwrap();
        let line = tokio::io::BufReader::new(stream)
            .lines()
            .next_line()
            .await
            .unwrap()
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn test_messages_without_order_ignored() {
        let dispatcher = dispatcher().await;
        assert!(dispatcher.handler().dispatch(r#"{"hello":"world"}"#).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_orders_rejected() {
        let dispatcher = dispatcher().await;
        let handler = dispatcher.handler();

        let err = handler.dispatch(r#"{"order":"REBOOT"}"#).await.unwrap_err();
        assert_eq!(err.to_string(), "unknown order 'REBOOT'");

        let err = handler.dispatch(r#"{"order":"update"}"#).await.unwrap_err();
        assert!(err.to_string().contains("malformed update order"));

        assert!(handler.dispatch("not json").await.is_err());
    }

    #[tokio::test]
    async fn test_busy_instrument_skipped() {
        let dispatcher = dispatcher().await;
        let handler = dispatcher.handler();
        let reply_endpoint = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = reply_endpoint.local_addr().unwrap().port();

        let id = MetaId::Number(42);
        let held = handler.registry().try_acquire(&id).await.unwrap().unwrap();

        let order = json!({
            "order": "SYNC",
            "directives": [{
                "server": "127.0.0.1", "sendBackPort": port, "type": 0,
                "instrument": "Therm1", "metaid": 42, "remarks": {"path": "/data"}
            }]
        });
        handler.dispatch(&order.to_string()).await.unwrap();

        let accepted = tokio::time::timeout(Duration::from_millis(300), reply_endpoint.accept()).await;
        assert!(accepted.is_err(), "no worker may run for a busy instrument");
        assert_eq!(handler.registry().entry(&id).await.unwrap().unwrap().counts, 1);

        drop(held);
        handler.dispatch(&order.to_string()).await.unwrap();
        let reply = reply_on(&reply_endpoint).await;
        assert_eq!(reply["order"], "METASYNCOVER");
    }

    #[tokio::test]
    async fn test_bad_directive_does_not_block_batch() {
        let dispatcher = dispatcher().await;
        let reply_endpoint = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = reply_endpoint.local_addr().unwrap().port();

        let order = json!({
            "order": "SYNC",
            "directives": [
                {"server": "127.0.0.1", "sendBackPort": port, "type": 9, "instrument": "X", "metaid": 1},
                {"server": "127.0.0.1", "sendBackPort": port, "type": 0, "instrument": "Y", "metaid": "y-2", "remarks": {"path": "/d"}}
            ]
        });
        dispatcher.handler().dispatch(&order.to_string()).await.unwrap();

        let reply = reply_on(&reply_endpoint).await;
        assert_eq!(reply["metaid"], "y-2");
    }

    #[tokio::test]
    async fn test_update_replies_with_details() {
        let dispatcher = dispatcher().await;
        let reply_endpoint = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = reply_endpoint.local_addr().unwrap().port();

        let order = json!({"order": "update", "server": "127.0.0.1", "sendBack": port});
        dispatcher.handler().dispatch(&order.to_string()).await.unwrap();

        let reply = reply_on(&reply_endpoint).await;
        assert_eq!(reply["order"], "DETAILSOVER");
        assert_eq!(reply["node"]["id"], "node1");
        assert_eq!(reply["port"], dispatcher.local_addr().unwrap().port());
        assert_eq!(reply["details"]["timeInfo"]["serverDifference"], "N/A");
    }

    #[tokio::test]
    async fn test_port_data_failure_reported() {
        let dispatcher = dispatcher().await;
        let reply_endpoint = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = reply_endpoint.local_addr().unwrap().port();

        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = closed.local_addr().unwrap().port();
        drop(closed);

        let order = json!({
            "order": "GETPORTDATA", "server": "127.0.0.1", "sendBack": port,
            "type": 1, "remarks": {"port": dead_port, "pollInterval": 1}
        });
        dispatcher.handler().dispatch(&order.to_string()).await.unwrap();

        let reply = reply_on(&reply_endpoint).await;
        assert_eq!(reply["order"], "PORTDATA");
        assert_eq!(reply["status"], -1);
        assert!(!reply["error"].as_str().unwrap().is_empty());
        assert_eq!(reply["reply"], "");
    }
}
