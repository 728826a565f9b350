//! Domain errors for the acquisition agent

use thiserror::Error;

use crate::protocol::MetaId;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("unknown order '{0}'")]
    UnknownOrder(String),

    #[error("directive type {0} is not supported")]
    UnsupportedDirectiveType(u8),

    #[error("directive {0} carries no remarks")]
    MissingRemarks(MetaId),

    #[error("directive {metaid} has unusable remarks: {reason}")]
    InvalidRemarks { metaid: MetaId, reason: String },

    #[error("directive {0} declares no metadata directory")]
    MissingMetaDirectory(MetaId),

    #[error("peripheral configuration has no {0}")]
    MissingPeripheralField(&'static str),

    #[error("invalid serial setting {setting}: {value}")]
    InvalidSerialSetting { setting: &'static str, value: String },

    #[error("peripheral read failed: {0}")]
    Read(String),

    #[error("worker timed out after {0}s")]
    WorkerTimeout(u64),

    #[error("lock registry is not running")]
    RegistryClosed,
}
