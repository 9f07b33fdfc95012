use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::peer::NodeAddr;

/// Hard cap on one encoded envelope; frames above this are rejected before
/// the payload is allocated.
pub const MAX_ENVELOPE_BYTES: usize = 16 * 1024 * 1024;
pub const MAX_ENVELOPE_PAYLOAD_BYTES: usize = MAX_ENVELOPE_BYTES - 1024;

/// Set on every reply envelope.
pub const FLAG_RESPONSE: u16 = 0x0001;
/// Set alongside [`FLAG_RESPONSE`] when the payload is an [`RpcFailure`].
pub const FLAG_ERROR: u16 = 0x0002;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub r#type: u16,
    pub req_id: u32,
    pub flags: u16,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(ciborium::from_reader(bytes)?)
    }

    pub fn decode_with_limits(
        bytes: &[u8],
        max_bytes: usize,
        max_payload_bytes: usize,
    ) -> anyhow::Result<Self> {
        if bytes.len() > max_bytes {
            anyhow::bail!("envelope exceeds max size");
        }
        let envelope = Self::decode(bytes)?;
        if envelope.payload.len() > max_payload_bytes {
            anyhow::bail!("envelope payload exceeds max size");
        }
        Ok(envelope)
    }

    pub fn from_typed(req_id: u32, flags: u16, payload: &WirePayload) -> anyhow::Result<Self> {
        Ok(Self {
            r#type: payload.msg_type() as u16,
            req_id,
            flags,
            payload: payload.encode_inner()?,
        })
    }

    pub fn decode_typed(&self) -> anyhow::Result<WirePayload> {
        let msg_type = MsgType::from_u16(self.r#type)
            .ok_or_else(|| anyhow::anyhow!("unknown message type {}", self.r#type))?;
        Ok(match msg_type {
            MsgType::RpcFailure => WirePayload::RpcFailure(decode_payload(&self.payload)?),
            MsgType::HealthCheck => WirePayload::HealthCheck(decode_payload(&self.payload)?),
            MsgType::HealthCheckOk => WirePayload::HealthCheckOk(decode_payload(&self.payload)?),
            MsgType::GetNeighbors => WirePayload::GetNeighbors(decode_payload(&self.payload)?),
            MsgType::Neighbors => WirePayload::Neighbors(decode_payload(&self.payload)?),
            MsgType::Notify => WirePayload::Notify(decode_payload(&self.payload)?),
            MsgType::NotifyOk => WirePayload::NotifyOk(decode_payload(&self.payload)?),
            MsgType::FindSuccessor => WirePayload::FindSuccessor(decode_payload(&self.payload)?),
            MsgType::SuccessorFound => WirePayload::SuccessorFound(decode_payload(&self.payload)?),
            MsgType::StoreFile => WirePayload::StoreFile(decode_payload(&self.payload)?),
            MsgType::StoreFileOk => WirePayload::StoreFileOk(decode_payload(&self.payload)?),
            MsgType::GetFile => WirePayload::GetFile(decode_payload(&self.payload)?),
            MsgType::FileData => WirePayload::FileData(decode_payload(&self.payload)?),
        })
    }
}

/// Encode one typed payload into the envelope's byte field.
fn encode_payload<T: Serialize>(msg: &T) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(msg, &mut buf)?;
    Ok(buf)
}

/// Decode an envelope's byte field back into a typed payload.
fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> anyhow::Result<T> {
    Ok(ciborium::from_reader(bytes)?)
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    RpcFailure = 1,
    HealthCheck = 100,
    HealthCheckOk = 101,
    GetNeighbors = 110,
    Neighbors = 111,
    Notify = 120,
    NotifyOk = 121,
    FindSuccessor = 130,
    SuccessorFound = 131,
    StoreFile = 140,
    StoreFileOk = 141,
    GetFile = 150,
    FileData = 151,
}

impl MsgType {
    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            1 => Self::RpcFailure,
            100 => Self::HealthCheck,
            101 => Self::HealthCheckOk,
            110 => Self::GetNeighbors,
            111 => Self::Neighbors,
            120 => Self::Notify,
            121 => Self::NotifyOk,
            130 => Self::FindSuccessor,
            131 => Self::SuccessorFound,
            140 => Self::StoreFile,
            141 => Self::StoreFileOk,
            150 => Self::GetFile,
            151 => Self::FileData,
            _ => return None,
        })
    }
}

/// Carried with [`FLAG_ERROR`] when the remote could not serve a request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RpcFailure {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthCheckRequest {}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthCheckOk {}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GetNeighborsRequest {}

/// Snapshot of the remote's successor list and predecessor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Neighbors {
    pub successors: Vec<NodeAddr>,
    pub predecessor: NodeAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotifyRequest {
    pub candidate: NodeAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotifyOk {}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FindSuccessorRequest {
    pub target: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SuccessorFound {
    pub addr: NodeAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreFileRequest {
    pub id: u64,
    pub name: String,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreFileOk {}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GetFileRequest {
    pub id: u64,
}

/// `error` is set (non-empty) when the id is unknown; a miss is in-band,
/// never a transport failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileData {
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    pub error: Option<String>,
}

/// Every message that can cross the wire, in typed form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WirePayload {
    RpcFailure(RpcFailure),
    HealthCheck(HealthCheckRequest),
    HealthCheckOk(HealthCheckOk),
    GetNeighbors(GetNeighborsRequest),
    Neighbors(Neighbors),
    Notify(NotifyRequest),
    NotifyOk(NotifyOk),
    FindSuccessor(FindSuccessorRequest),
    SuccessorFound(SuccessorFound),
    StoreFile(StoreFileRequest),
    StoreFileOk(StoreFileOk),
    GetFile(GetFileRequest),
    FileData(FileData),
}

impl WirePayload {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Self::RpcFailure(_) => MsgType::RpcFailure,
            Self::HealthCheck(_) => MsgType::HealthCheck,
            Self::HealthCheckOk(_) => MsgType::HealthCheckOk,
            Self::GetNeighbors(_) => MsgType::GetNeighbors,
            Self::Neighbors(_) => MsgType::Neighbors,
            Self::Notify(_) => MsgType::Notify,
            Self::NotifyOk(_) => MsgType::NotifyOk,
            Self::FindSuccessor(_) => MsgType::FindSuccessor,
            Self::SuccessorFound(_) => MsgType::SuccessorFound,
            Self::StoreFile(_) => MsgType::StoreFile,
            Self::StoreFileOk(_) => MsgType::StoreFileOk,
            Self::GetFile(_) => MsgType::GetFile,
            Self::FileData(_) => MsgType::FileData,
        }
    }

    fn encode_inner(&self) -> anyhow::Result<Vec<u8>> {
        match self {
            Self::RpcFailure(msg) => encode_payload(msg),
            Self::HealthCheck(msg) => encode_payload(msg),
            Self::HealthCheckOk(msg) => encode_payload(msg),
            Self::GetNeighbors(msg) => encode_payload(msg),
            Self::Neighbors(msg) => encode_payload(msg),
            Self::Notify(msg) => encode_payload(msg),
            Self::NotifyOk(msg) => encode_payload(msg),
            Self::FindSuccessor(msg) => encode_payload(msg),
            Self::SuccessorFound(msg) => encode_payload(msg),
            Self::StoreFile(msg) => encode_payload(msg),
            Self::StoreFileOk(msg) => encode_payload(msg),
            Self::GetFile(msg) => encode_payload(msg),
            Self::FileData(msg) => encode_payload(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrip() {
        let payload = FindSuccessorRequest { target: 42 };
        let envelope = Envelope {
            r#type: MsgType::FindSuccessor as u16,
            req_id: 7,
            flags: 0,
            payload: encode_payload(&payload).expect("encode payload"),
        };

        let encoded = envelope.encode().expect("encode envelope");
        let decoded = Envelope::decode(&encoded).expect("decode envelope");
        let decoded_payload: FindSuccessorRequest =
            decode_payload(&decoded.payload).expect("decode payload");

        assert_eq!(decoded.r#type, MsgType::FindSuccessor as u16);
        assert_eq!(decoded.req_id, 7);
        assert_eq!(decoded_payload, payload);
    }

    #[test]
    fn typed_roundtrip_for_every_message() {
        let addr = NodeAddr {
            ip: "127.0.0.1".into(),
            port: 7000,
            id: 41,
        };
        let payloads = vec![
            WirePayload::RpcFailure(RpcFailure {
                message: "boom".into(),
            }),
            WirePayload::HealthCheck(HealthCheckRequest {}),
            WirePayload::HealthCheckOk(HealthCheckOk {}),
            WirePayload::GetNeighbors(GetNeighborsRequest {}),
            WirePayload::Neighbors(Neighbors {
                successors: vec![addr.clone(), addr.clone()],
                predecessor: NodeAddr::nil(),
            }),
            WirePayload::Notify(NotifyRequest {
                candidate: addr.clone(),
            }),
            WirePayload::NotifyOk(NotifyOk {}),
            WirePayload::FindSuccessor(FindSuccessorRequest { target: 9 }),
            WirePayload::SuccessorFound(SuccessorFound { addr: addr.clone() }),
            WirePayload::StoreFile(StoreFileRequest {
                id: 12,
                name: "report.txt".into(),
                data: vec![1, 2, 3],
            }),
            WirePayload::StoreFileOk(StoreFileOk {}),
            WirePayload::GetFile(GetFileRequest { id: 12 }),
            WirePayload::FileData(FileData {
                data: vec![4, 5, 6],
                error: None,
            }),
        ];

        for payload in payloads {
            let envelope = Envelope::from_typed(3, 0, &payload).expect("encode typed");
            assert_eq!(envelope.r#type, payload.msg_type() as u16);
            let decoded = envelope.decode_typed().expect("decode typed");
            assert_eq!(decoded, payload);
        }
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let envelope = Envelope {
            r#type: 9999,
            req_id: 1,
            flags: 0,
            payload: vec![],
        };
        assert!(envelope.decode_typed().is_err());
    }

    #[test]
    fn decode_with_limits_rejects_oversized_payload() {
        let envelope = Envelope {
            r#type: MsgType::StoreFile as u16,
            req_id: 1,
            flags: 0,
            payload: vec![0u8; 64],
        };
        let encoded = envelope.encode().expect("encode envelope");

        assert!(Envelope::decode_with_limits(&encoded, MAX_ENVELOPE_BYTES, 16).is_err());
        assert!(
            Envelope::decode_with_limits(&encoded, MAX_ENVELOPE_BYTES, MAX_ENVELOPE_PAYLOAD_BYTES)
                .is_ok()
        );
    }

    #[test]
    fn file_data_miss_carries_in_band_error() {
        let miss = FileData {
            data: vec![],
            error: Some("file does not exist in the ring".into()),
        };
        let envelope = Envelope::from_typed(1, FLAG_RESPONSE, &WirePayload::FileData(miss.clone()))
            .expect("encode");
        match envelope.decode_typed().expect("decode") {
            WirePayload::FileData(decoded) => assert_eq!(decoded, miss),
            other => panic!("unexpected payload {other:?}"),
        }
    }
}
