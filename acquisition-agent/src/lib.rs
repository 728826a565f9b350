//! Acquisition Agent - instrument data acquisition node
//!
//! Receives orders from a coordinator, polls TCP/serial instruments with at
//! most one worker per instrument, stages what they answer and hands the
//! staging directory to a directory sync backend.

pub mod config;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod log_sink;
pub mod metrics;
pub mod parsing;
pub mod protocol;
pub mod readers;
pub mod registry;
pub mod staging;
pub mod sync;
pub mod timesync;
pub mod wire;
pub mod worker;

pub use config::AgentConfig;
pub use dispatcher::Dispatcher;
pub use error::AgentError;
pub use log_sink::{LogClient, LogSink};
pub use registry::{Lease, RegistryHandle};
pub use sync::{CommandSync, DirectorySync, SyncRequest};
