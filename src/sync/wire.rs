//! Protobuf framing of [`BroadcastRecord`]s as they travel through a realtime store.

use prost::Message;

use super::BroadcastRecord;
use super::error::StoreError;
use crate::entity::EntityId;
use crate::position::{MovementStatus, Position, Timestamp};

#[derive(Clone, PartialEq, Message)]
pub struct BroadcastFrame {
    #[prost(string, tag = "1")]
    pub entity_id: String,
    #[prost(double, tag = "2")]
    pub latitude: f64,
    #[prost(double, tag = "3")]
    pub longitude: f64,
    #[prost(enumeration = "FrameStatus", tag = "4")]
    pub status: i32,
    #[prost(uint64, tag = "5")]
    pub updated_at_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum FrameStatus {
    Idle = 0,
    Moving = 1,
    Stopped = 2,
}

impl From<MovementStatus> for FrameStatus {
    fn from(status: MovementStatus) -> Self {
        match status {
            MovementStatus::Idle => FrameStatus::Idle,
            MovementStatus::Moving => FrameStatus::Moving,
            MovementStatus::Stopped => FrameStatus::Stopped,
        }
    }
}

impl From<FrameStatus> for MovementStatus {
    fn from(status: FrameStatus) -> Self {
        match status {
            FrameStatus::Idle => MovementStatus::Idle,
            FrameStatus::Moving => MovementStatus::Moving,
            FrameStatus::Stopped => MovementStatus::Stopped,
        }
    }
}

impl From<&BroadcastRecord> for BroadcastFrame {
    fn from(record: &BroadcastRecord) -> Self {
        Self {
            entity_id: record.entity_id.as_str().to_string(),
            latitude: record.position.latitude,
            longitude: record.position.longitude,
            status: FrameStatus::from(record.status) as i32,
            updated_at_ms: record.updated_at.as_millis(),
        }
    }
}

impl TryFrom<BroadcastFrame> for BroadcastRecord {
    type Error = StoreError;

    fn try_from(frame: BroadcastFrame) -> Result<Self, Self::Error> {
        let status = FrameStatus::try_from(frame.status)
            .map_err(|_| StoreError::Malformed(format!("unknown status {}", frame.status)))?;

        let entity_id = EntityId::try_from(frame.entity_id)
            .map_err(|err| StoreError::Malformed(err.to_string()))?;

        Ok(BroadcastRecord {
            entity_id,
            position: Position::new(frame.latitude, frame.longitude),
            status: status.into(),
            updated_at: Timestamp::from_millis(frame.updated_at_ms),
        })
    }
}

pub fn encode_record(record: &BroadcastRecord) -> Vec<u8> {
    BroadcastFrame::from(record).encode_to_vec()
}

pub fn decode_record(bytes: &[u8]) -> Result<BroadcastRecord, StoreError> {
    BroadcastFrame::decode(bytes)?.try_into()
}
