//! Record units and the decode/serialize step
//!
//! A [`Record`] is one scanned line; a [`RecordCodec`] turns it into a
//! [`PersistRequest`] (identity + stored blob). [`PgcrCodec`] is the codec for
//! the PGCR corpus: it only looks at `activityDetails.instanceId` and carries
//! every other field through untouched.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::registry::FileId;

/// One line read from an input file.
#[derive(Debug, Clone)]
pub struct Record {
    /// File the line came from
    pub file: FileId,
    /// Raw line contents without the trailing newline
    pub bytes: Bytes,
    /// Zero-based line number within `file`
    pub line: u64,
}

/// A decoded record ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistRequest {
    pub instance_id: i64,
    pub payload: Vec<u8>,
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("record has no activityDetails.instanceId")]
    MissingIdentity,

    #[error("instance id '{0}' is not a 64-bit integer")]
    InvalidIdentity(String),

    #[error("failed to compress payload: {0}")]
    Compression(#[from] pgcr_common::CommonError),
}

/// Decode + serialize step run by every worker.
pub trait RecordCodec: Send + Sync + 'static {
    fn encode(&self, raw: &[u8]) -> Result<PersistRequest, DecodeError>;
}

/// Post-game carnage report, decoded just far enough to find its identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pgcr {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_details: Option<ActivityDetails>,

    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<InstanceId>,

    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

/// The API serves instance ids as strings; some dumps have them as numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InstanceId {
    Text(String),
    Number(i64),
}

impl Pgcr {
    pub fn instance_id(&self) -> Result<i64, DecodeError> {
        let id = self
            .activity_details
            .as_ref()
            .and_then(|details| details.instance_id.as_ref())
            .ok_or(DecodeError::MissingIdentity)?;

        match id {
            InstanceId::Number(n) => Ok(*n),
            InstanceId::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| DecodeError::InvalidIdentity(s.clone())),
        }
    }
}

/// Decodes PGCR JSON lines and stores them as gzip-compressed compact JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgcrCodec;

impl RecordCodec for PgcrCodec {
    fn encode(&self, raw: &[u8]) -> Result<PersistRequest, DecodeError> {
        let pgcr: Pgcr = serde_json::from_slice(raw)?;
        let instance_id = pgcr.instance_id()?;

        let normalized = serde_json::to_vec(&pgcr)?;
        let payload = pgcr_common::compression::gzip(&normalized)?;

        Ok(PersistRequest {
            instance_id,
            payload,
        })
    }
}
