/*!
Coordinateur et instruments simulés

`MockCoordinator` écoute comme un endpoint de réponse: chaque connexion
porte une ligne JSON, enregistrée pour les assertions de tests.
`MockInstrument` joue le rôle d'un périphérique TCP sur `localhost`.
*/

use anyhow::{Context, Result};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Endpoint de réponse qui enregistre tous les messages reçus
pub struct MockCoordinator {
    addr: SocketAddr,
    messages: Arc<Mutex<Vec<Value>>>,
    task: JoinHandle<()>,
}

impl MockCoordinator {
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("Failed to bind mock coordinator")?;
        let addr = listener.local_addr()?;
        let messages = Arc::new(Mutex::new(Vec::new()));

        let store = Arc::clone(&messages);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let mut lines = BufReader::new(stream).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        match serde_json::from_str::<Value>(&line) {
                            Ok(message) => {
                                log::info!("📥 [MOCK] Reply received: {}", message["order"]);
                                store.lock().unwrap().push(message);
                            }
                            Err(e) => log::warn!("⚠️ [MOCK] Non-JSON reply: {}", e),
                        }
                    }
                });
            }
        });

        log::info!("🛰️ [MOCK] Coordinator listening on {}", addr);
        Ok(Self { addr, messages, task })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Tous les messages reçus (pour assertions de tests)
    pub fn messages(&self) -> Vec<Value> {
        self.messages.lock().unwrap().clone()
    }

    /// Messages dont le champ `order` vaut `order`
    pub fn messages_with_order(&self, order: &str) -> Vec<Value> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|msg| msg["order"] == order)
            .cloned()
            .collect()
    }

    /// Attend le premier message `order`
    pub async fn wait_for_order(&self, order: &str, timeout_ms: u64) -> Option<Value> {
        self.wait_for_count(order, 1, timeout_ms).await.into_iter().next()
    }

    /// Attend au moins `count` messages `order`; renvoie ce qui est arrivé
    pub async fn wait_for_count(&self, order: &str, count: usize, timeout_ms: u64) -> Vec<Value> {
        let start = std::time::Instant::now();

        loop {
            let found = self.messages_with_order(order);
            if found.len() >= count || start.elapsed() >= Duration::from_millis(timeout_ms) {
                if found.len() < count {
                    log::warn!("⏰ Timeout waiting for {} x {}", count, order);
                }
                return found;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Reset des messages enregistrés
    pub fn clear(&self) {
        self.messages.lock().unwrap().clear();
    }
}

impl Drop for MockCoordinator {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Instrument TCP: lit l'éventuelle commande, attend `delay`, répond
pub struct MockInstrument {
    port: u16,
    connections: Arc<AtomicUsize>,
    commands: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl MockInstrument {
    pub async fn start(response: impl Into<Vec<u8>>, delay: Duration) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("Failed to bind mock instrument")?;
        let port = listener.local_addr()?.port();
        let response: Arc<Vec<u8>> = Arc::new(response.into());
        let connections = Arc::new(AtomicUsize::new(0));
        let commands = Arc::new(Mutex::new(Vec::new()));

        let (count, seen) = (Arc::clone(&connections), Arc::clone(&commands));
        let task = tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                count.fetch_add(1, Ordering::SeqCst);
                let response = Arc::clone(&response);
                let seen = Arc::clone(&seen);
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    if let Ok(Ok(n)) =
                        tokio::time::timeout(Duration::from_millis(50), stream.read(&mut buf)).await
                    {
                        if n > 0 {
                            seen.lock().unwrap().push(String::from_utf8_lossy(&buf[..n]).to_string());
                        }
                    }
                    tokio::time::sleep(delay).await;
                    let _ = stream.write_all(&response).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        log::info!("🌡️ [MOCK] Instrument listening on port {}", port);
        Ok(Self {
            port,
            connections,
            commands,
            task,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Nombre de connexions acceptées
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Commandes écrites par les lecteurs
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

impl Drop for MockInstrument {
    fn drop(&mut self) {
        self.task.abort();
    }
}
