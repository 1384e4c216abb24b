use std::collections::BTreeMap;

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::CodecError;
use crate::types::{GroupId, LogPosition, Node, Slot};

/// Outcome of a protocol request. A stale-term rejection carries the rejecting node's term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Agree,
    LogMismatch,
    LeaderStillOnline,
    /// The elector lags on the secondary (cluster metadata) log.
    SecondaryLogStale,
    Term(u64),
}

// payload discriminants, stable on disk
const PAYLOAD_EMPTY: u8 = 0;
const PAYLOAD_PHYSICAL_PLAN: u8 = 1;
const PAYLOAD_CLOSE_FILE: u8 = 2;

/// Header: type(1) + previous index/term + current index/term.
pub const LOG_ENTRY_HEADER_SIZE: usize = 1 + 4 * 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogPayload {
    /// No-op written by a new leader.
    Empty,
    /// An opaque serialized write operation for the storage engine.
    PhysicalPlan(Vec<u8>),
    /// Seal the working file of a data partition.
    CloseFile {
        storage_group: String,
        partition_id: u64,
        is_seq: bool,
    },
}

impl LogPayload {
    fn type_byte(&self) -> u8 {
        match self {
            LogPayload::Empty => PAYLOAD_EMPTY,
            LogPayload::PhysicalPlan(_) => PAYLOAD_PHYSICAL_PLAN,
            LogPayload::CloseFile { .. } => PAYLOAD_CLOSE_FILE,
        }
    }

    fn encode_body(&self, buf: &mut Vec<u8>) {
        match self {
            LogPayload::Empty => {}
            LogPayload::PhysicalPlan(plan) => {
                buf.extend_from_slice(&(plan.len() as u32).to_le_bytes());
                buf.extend_from_slice(plan);
            }
            LogPayload::CloseFile {
                storage_group,
                partition_id,
                is_seq,
            } => {
                buf.extend_from_slice(&(storage_group.len() as u32).to_le_bytes());
                buf.extend_from_slice(storage_group.as_bytes());
                buf.extend_from_slice(&partition_id.to_le_bytes());
                buf.push(u8::from(*is_seq));
            }
        }
    }

    fn decode_physical_plan(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        let len = reader.u32()? as usize;
        Ok(LogPayload::PhysicalPlan(reader.bytes(len)?.to_vec()))
    }

    fn decode_close_file(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        let len = reader.u32()? as usize;
        let storage_group = std::str::from_utf8(reader.bytes(len)?)
            .map_err(|_| CodecError::InvalidString)?
            .to_string();
        let partition_id = reader.u64()?;
        let is_seq = reader.u8()? != 0;
        Ok(LogPayload::CloseFile {
            storage_group,
            partition_id,
            is_seq,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub curr_log_index: u64,
    pub curr_log_term: u64,
    pub previous_log_index: u64,
    pub previous_log_term: u64,
    pub payload: LogPayload,
}

impl LogEntry {
    pub fn new(index: u64, term: u64, previous: LogPosition, payload: LogPayload) -> Self {
        Self {
            curr_log_index: index,
            curr_log_term: term,
            previous_log_index: previous.index,
            previous_log_term: previous.term,
            payload,
        }
    }

    pub fn position(&self) -> LogPosition {
        LogPosition::new(self.curr_log_index, self.curr_log_term)
    }

    pub fn previous(&self) -> LogPosition {
        LogPosition::new(self.previous_log_index, self.previous_log_term)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(LOG_ENTRY_HEADER_SIZE + 16);
        buf.push(self.payload.type_byte());
        buf.extend_from_slice(&self.previous_log_index.to_le_bytes());
        buf.extend_from_slice(&self.previous_log_term.to_le_bytes());
        buf.extend_from_slice(&self.curr_log_index.to_le_bytes());
        buf.extend_from_slice(&self.curr_log_term.to_le_bytes());
        self.payload.encode_body(&mut buf);
        buf
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, CodecError> {
        let mut reader = Reader::new(data);
        let kind = reader.u8()?;
        let previous_log_index = reader.u64()?;
        let previous_log_term = reader.u64()?;
        let curr_log_index = reader.u64()?;
        let curr_log_term = reader.u64()?;
        let payload = match kind {
            PAYLOAD_EMPTY => LogPayload::Empty,
            PAYLOAD_PHYSICAL_PLAN => LogPayload::decode_physical_plan(&mut reader)?,
            PAYLOAD_CLOSE_FILE => LogPayload::decode_close_file(&mut reader)?,
            other => {
                warn!("Unknown log payload type {} at index {}", other, curr_log_index);
                return Err(CodecError::UnknownPayloadType(other));
            }
        };
        if reader.remaining() > 0 {
            return Err(CodecError::TrailingBytes(reader.remaining()));
        }
        Ok(Self {
            curr_log_index,
            curr_log_term,
            previous_log_index,
            previous_log_term,
            payload,
        })
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Truncated {
                need: n,
                left: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.bytes(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.bytes(4)?);
        Ok(u32::from_le_bytes(raw))
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.bytes(8)?);
        Ok(u64::from_le_bytes(raw))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<Node>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct LogManagerMeta {
    pub last_log_index: u64,
    pub last_log_term: u64,
    pub commit_log_index: u64,
    pub commit_log_term: u64,
    pub max_have_applied_commit_index: u64,
}

/// State subsumed up to `last_log_index`, split per slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct Snapshot {
    pub last_log_index: u64,
    pub last_log_term: u64,
    pub slots: BTreeMap<Slot, Vec<u8>>,
}

impl Snapshot {
    pub fn serialize(&self) -> anyhow::Result<Vec<u8>> {
        Ok(bincode::encode_to_vec(self, bincode::config::standard())?)
    }

    pub fn deserialize(data: &[u8]) -> anyhow::Result<Self> {
        let (snapshot, _) = bincode::decode_from_slice(data, bincode::config::standard())
            .map_err(|e| {
                warn!("Failed to decode snapshot: {}", e);
                anyhow::anyhow!("decode snapshot: {}", e)
            })?;
        Ok(snapshot)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub group: GroupId,
    pub term: u64,
    pub leader: Node,
    pub commit_log_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub response: Response,
    pub follower: Node,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub group: GroupId,
    pub elector: Node,
    pub term: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
    /// Elector's position on the secondary log, for groups that verify one.
    pub secondary: Option<LogPosition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntryRequest {
    pub group: GroupId,
    pub term: u64,
    pub leader: Node,
    pub entry: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntryResponse {
    pub response: Response,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub group: GroupId,
    pub term: u64,
    pub leader: Node,
    pub snapshot: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullSnapshotRequest {
    pub group: GroupId,
    pub required_slots: Vec<Slot>,
    pub require_read_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullSnapshotResponse {
    pub last_log_index: u64,
    pub last_log_term: u64,
    pub snapshots: BTreeMap<Slot, Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadFileRequest {
    pub group: GroupId,
    pub path: String,
    pub offset: u64,
    pub length: u32,
}
