use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::DecodeError,
    models::{SessionResult, TrainingProgram},
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    SyncPrograms,
    CustomWorkoutCreated,
    CustomWorkoutUpdated,
    CustomWorkoutDeleted,
    SyncAllCustomWorkouts,
    RequestCustomWorkouts,
    Ping,
    WorkoutResults,
    StateSnapshot,
}

/// One message on the link. The payload is JSON, carried as base64 on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncEnvelope {
    pub action: SyncAction,
    #[serde(with = "payload_base64")]
    pub payload: Vec<u8>,
    pub operation_id: Uuid,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

mod payload_base64 {
    use super::BASE64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}

fn epoch_secs(now: DateTime<Utc>) -> f64 {
    now.timestamp_millis() as f64 / 1000.0
}

/// XOR of the payload taken as little-endian 32-bit words, the last word
/// zero-padded. Catches gross corruption only.
pub fn xor_fold(bytes: &[u8]) -> u32 {
    bytes.chunks(4).fold(0u32, |acc, chunk| {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        acc ^ u32::from_le_bytes(word)
    })
}

pub fn checksum(bytes: &[u8]) -> String {
    format!("{:08x}", xor_fold(bytes))
}

impl SyncEnvelope {
    pub fn new(action: SyncAction, payload: Vec<u8>) -> Self {
        Self {
            action,
            checksum: Some(checksum(&payload)),
            payload,
            operation_id: Uuid::new_v4(),
            timestamp: epoch_secs(Utc::now()),
        }
    }

    pub fn encode<T: Serialize + ?Sized>(
        action: SyncAction,
        value: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(action, serde_json::to_vec(value)?))
    }

    /// An envelope without a checksum is accepted as is.
    pub fn verify(&self) -> Result<(), DecodeError> {
        let Some(expected) = &self.checksum else {
            return Ok(());
        };
        let actual = checksum(&self.payload);
        if expected.eq_ignore_ascii_case(&actual) {
            Ok(())
        } else {
            Err(DecodeError::ChecksumMismatch {
                expected: expected.clone(),
                actual,
            })
        }
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, DecodeError> {
        self.verify()?;
        Ok(serde_json::from_slice(&self.payload)?)
    }

    pub fn to_wire(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_wire(bytes: &[u8]) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgramDeletion {
    pub id: Uuid,
    pub deleted_at: DateTime<Utc>,
}

/// Context payload: the whole custom catalog plus recent results.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StateSnapshot {
    pub programs: Vec<TrainingProgram>,
    pub results: Vec<SessionResult>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Received,
    Alive,
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncReply {
    pub status: ReplyStatus,
    pub timestamp: f64,
    /// Base64 JSON list of programs, only on catalog replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workouts_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncReply {
    fn with_status(status: ReplyStatus) -> Self {
        Self {
            status,
            timestamp: epoch_secs(Utc::now()),
            workouts_data: None,
            count: None,
            error: None,
        }
    }

    pub fn received() -> Self {
        Self::with_status(ReplyStatus::Received)
    }

    pub fn alive() -> Self {
        Self::with_status(ReplyStatus::Alive)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::with_status(ReplyStatus::Error)
        }
    }

    pub fn catalog(programs: &[TrainingProgram]) -> Result<Self, serde_json::Error> {
        let encoded = BASE64.encode(serde_json::to_vec(programs)?);
        Ok(Self {
            workouts_data: Some(encoded),
            count: Some(programs.len()),
            ..Self::with_status(ReplyStatus::Success)
        })
    }

    pub fn is_error(&self) -> bool {
        self.status == ReplyStatus::Error
    }

    pub fn decode_catalog(&self) -> Result<Vec<TrainingProgram>, DecodeError> {
        let Some(encoded) = &self.workouts_data else {
            return Ok(Vec::new());
        };
        let bytes = BASE64
            .decode(encoded)
            .map_err(|err| DecodeError::InvalidEntity(format!("workouts_data: {err}")))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_eight_hex_digits() {
        assert_eq!(checksum(b""), "00000000");
        assert_eq!(checksum(&[0x01, 0x00, 0x00, 0x00]), "00000001");
        assert_eq!(checksum(&[0xff]), "000000ff");
        assert_eq!(checksum(b"abcd").len(), 8);
    }

    #[test]
    fn checksum_ignores_word_order() {
        assert_eq!(checksum(b"abcdwxyz"), checksum(b"wxyzabcd"));
        assert_ne!(checksum(b"abcdwxyz"), checksum(b"abcdwxyy"));
    }

    #[test]
    fn decode_rejects_corrupted_payload() {
        let program = TrainingProgram::new_custom("Hills", 3.0, 60, 90);
        let mut envelope = SyncEnvelope::encode(SyncAction::CustomWorkoutCreated, &program).unwrap();
        let decoded: TrainingProgram = envelope.decode().unwrap();
        assert_eq!(decoded, program);

        envelope.payload[0] ^= 0x20;
        assert!(matches!(
            envelope.decode::<TrainingProgram>(),
            Err(DecodeError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn unchecked_garbage_fails_as_payload_error() {
        let mut envelope = SyncEnvelope::new(SyncAction::WorkoutResults, b"not json".to_vec());
        envelope.checksum = None;
        assert!(matches!(
            envelope.decode::<SessionResult>(),
            Err(DecodeError::Payload(_))
        ));
    }

    #[test]
    fn wire_format_uses_snake_case_actions_and_base64() {
        let envelope = SyncEnvelope::new(SyncAction::WorkoutResults, b"{}".to_vec());
        let value: serde_json::Value = serde_json::from_slice(&envelope.to_wire().unwrap()).unwrap();

        assert_eq!(value["action"], "workout_results");
        assert_eq!(value["payload"], "e30=");
        assert_eq!(value["operationId"], envelope.operation_id.to_string());
        assert_eq!(value["checksum"], checksum(b"{}"));

        let back = SyncEnvelope::from_wire(&envelope.to_wire().unwrap()).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn catalog_reply_carries_programs() {
        let programs = vec![
            TrainingProgram::new_custom("A", 1.0, 30, 30),
            TrainingProgram::new_custom("B", 2.0, 60, 30),
        ];
        let reply = SyncReply::catalog(&programs).unwrap();
        assert_eq!(reply.status, ReplyStatus::Success);
        assert_eq!(reply.count, Some(2));
        assert_eq!(reply.decode_catalog().unwrap(), programs);

        let json = serde_json::to_value(SyncReply::alive()).unwrap();
        assert_eq!(json["status"], "alive");
        assert!(json.get("workouts_data").is_none());
    }
}
