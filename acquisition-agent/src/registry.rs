//! Instrument lock registry
//!
//! Guarantees at most one in-flight acquisition per `metaid`:
//! - A supervising task owns the table, nobody else touches it
//! - Callers hold a cloneable [`RegistryHandle`] and talk to it over one FIFO
//!   command channel
//! - A successful acquire yields a [`Lease`]; dropping the lease releases the
//!   entry, whichever way the owning worker ends

use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::AgentError;
use crate::protocol::MetaId;

/// Busy flag and refused-attempt counter of one instrument
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LockEntry {
    pub metaid: MetaId,
    pub locked: bool,
    pub counts: u32,
}

/// The lock table itself; only ever mutated by the registry task
#[derive(Debug, Default)]
pub struct LockTable {
    entries: HashMap<MetaId, LockEntry>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock `metaid` unless it is already locked.
    ///
    /// Entries are created lazily and never removed.
    pub fn try_acquire(&mut self, metaid: &MetaId) -> bool {
        let entry = self
            .entries
            .entry(metaid.clone())
            .or_insert_with(|| LockEntry {
                metaid: metaid.clone(),
                locked: false,
                counts: 0,
            });

        if entry.locked {
            entry.counts = entry.counts.saturating_add(1);
            false
        } else {
            entry.locked = true;
            true
        }
    }

    pub fn release(&mut self, metaid: &MetaId) {
        if let Some(entry) = self.entries.get_mut(metaid) {
            entry.locked = false;
            entry.counts = 0;
        }
    }

    pub fn get(&self, metaid: &MetaId) -> Option<&LockEntry> {
        self.entries.get(metaid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

enum Command {
    Acquire {
        metaid: MetaId,
        reply: oneshot::Sender<bool>,
    },
    Release {
        metaid: MetaId,
    },
    Inspect {
        metaid: MetaId,
        reply: oneshot::Sender<Option<LockEntry>>,
    },
}

/// Client side of the registry
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl RegistryHandle {
    /// Start the registry task and return a handle to it.
    ///
    /// The task stops once every handle and lease has been dropped.
    pub fn spawn() -> (Self, JoinHandle<LockTable>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();

        let task = tokio::spawn(async move {
            let mut table = LockTable::new();
            while let Some(command) = rx.recv().await {
                match command {
                    Command::Acquire { metaid, reply } => {
                        let granted = table.try_acquire(&metaid);
                        trace!("Acquire {} -> {}", metaid, granted);
                        // Caller gone: hand the entry straight back
                        if reply.send(granted).is_err() && granted {
                            table.release(&metaid);
                        }
                    }
                    Command::Release { metaid } => {
                        trace!("Release {}", metaid);
                        table.release(&metaid);
                    }
                    Command::Inspect { metaid, reply } => {
                        let _ = reply.send(table.get(&metaid).cloned());
                    }
                }
            }
            debug!("Lock registry stopped with {} entries", table.len());
            table
        });

        (Self { tx }, task)
    }

    /// Try to lock `metaid`; `None` means another worker holds it
    pub async fn try_acquire(&self, metaid: &MetaId) -> Result<Option<Lease>, AgentError> {
        let (reply, granted) = oneshot::channel();
        self.tx
            .send(Command::Acquire {
                metaid: metaid.clone(),
                reply,
            })
            .map_err(|_| AgentError::RegistryClosed)?;

        if granted.await.map_err(|_| AgentError::RegistryClosed)? {
            Ok(Some(Lease {
                metaid: metaid.clone(),
                tx: self.tx.clone(),
            }))
        } else {
            Ok(None)
        }
    }

    /// Current state of one entry
    pub async fn entry(&self, metaid: &MetaId) -> Result<Option<LockEntry>, AgentError> {
        let (reply, entry) = oneshot::channel();
        self.tx
            .send(Command::Inspect {
                metaid: metaid.clone(),
                reply,
            })
            .map_err(|_| AgentError::RegistryClosed)?;

        entry.await.map_err(|_| AgentError::RegistryClosed)
    }
}

/// Ownership of one instrument lock; released exactly once on drop
#[derive(Debug)]
pub struct Lease {
    metaid: MetaId,
    tx: mpsc::UnboundedSender<Command>,
}

impl Lease {
    pub fn metaid(&self) -> &MetaId {
        &self.metaid
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Release {
            metaid: self.metaid.clone(),
        });
    }
}
