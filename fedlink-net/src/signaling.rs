//! Signaling message codec
//!
//! Every frame on the persistent channel is a JSON envelope
//! `{"type": <string>, "data": {...}}`. [`SignalingMessage`] is the single
//! sum type for all of them; [`SignalingMessage::encode`] and
//! [`SignalingMessage::decode`] are exact inverses.
//!
//! Requests and responses of the same session operation share a `type`
//! string and are told apart by the keys present in `data`.

use fedlink_core::identity::{PeerId, ProtocolId, ScopeId, WorkerId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::protocol::{AuthReply, AuthRequest, CycleRequest, CycleResponse, ReportReply, ReportRequest};
use crate::{Error, Result};

/// Literal keep-alive frame
pub const KEEP_ALIVE_PAYLOAD: &str = r#"{"type":"socket-ping"}"#;

/// Envelope `type` strings
pub mod message_type {
    /// Keep-alive
    pub const KEEP_ALIVE: &str = "socket-ping";
    /// Authentication request/response
    pub const AUTHENTICATE: &str = "federated/authenticate";
    /// Cycle request/response
    pub const CYCLE_REQUEST: &str = "federated/cycle-request";
    /// Diff report request/response
    pub const REPORT: &str = "federated/report";
    /// Protocol lookup before joining a scope
    pub const GET_PROTOCOL: &str = "get-protocol";
    /// A worker joined the scope
    pub const JOIN_ROOM: &str = "webrtc: join-room";
    /// A worker left the scope
    pub const PEER_LEFT: &str = "webrtc: peer-left";
    /// Relayed peer-to-peer negotiation
    pub const INTERNAL_MESSAGE: &str = "webrtc: internal-message";
}

/// Kind of session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer
    Offer,
    /// Answer
    Answer,
}

/// Session description exchanged during offer/answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// SDP body
    pub sdp: String,
    /// Offer or answer
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
}

impl SessionDescription {
    /// An offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            sdp_type: SdpType::Offer,
        }
    }

    /// An answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            sdp_type: SdpType::Answer,
        }
    }
}

/// ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate line
    pub candidate: String,
    /// Media line index
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: u16,
    /// Media stream id
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
}

/// Payload of a relayed peer message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerPayload {
    /// Session offer
    Offer(SessionDescription),
    /// Session answer
    Answer(SessionDescription),
    /// ICE candidate
    Candidate(IceCandidate),
}

impl PeerPayload {
    fn kind(&self) -> &'static str {
        match self {
            PeerPayload::Offer(_) => "offer",
            PeerPayload::Answer(_) => "answer",
            PeerPayload::Candidate(_) => "candidate",
        }
    }
}

/// Peer negotiation message relayed by the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalMessage {
    /// Sender
    pub worker_id: PeerId,
    /// Scope the peers share
    pub scope_id: ScopeId,
    /// Recipient
    pub to: PeerId,
    /// Negotiation payload
    pub payload: PeerPayload,
}

/// Scope membership change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMembership {
    /// Worker that joined or left
    pub worker_id: PeerId,
    /// Scope
    pub scope_id: ScopeId,
}

/// Protocol lookup request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetProtocol {
    /// Requesting worker
    pub worker_id: WorkerId,
    /// Scope to join
    pub scope_id: ScopeId,
    /// Protocol to fetch
    pub protocol_id: ProtocolId,
}

/// Every message carried by the signaling channel
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingMessage {
    /// Keep-alive frame
    KeepAlive,
    /// Authentication request
    AuthRequest(AuthRequest),
    /// Authentication response
    AuthResponse(AuthReply),
    /// Cycle request
    CycleRequest(CycleRequest),
    /// Cycle response
    CycleResponse(CycleResponse),
    /// Diff report
    ReportRequest(ReportRequest),
    /// Diff report acknowledgement
    ReportResponse(ReportReply),
    /// Protocol lookup
    GetProtocolRequest(GetProtocol),
    /// Protocol lookup response, opaque to the client
    GetProtocolResponse(Value),
    /// Worker joined the scope
    JoinRoom(RoomMembership),
    /// Worker left the scope
    PeerLeft(RoomMembership),
    /// Relayed offer, answer or candidate
    Internal(InternalMessage),
}

impl SignalingMessage {
    /// Envelope `type` for this message
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::KeepAlive => message_type::KEEP_ALIVE,
            Self::AuthRequest(_) | Self::AuthResponse(_) => message_type::AUTHENTICATE,
            Self::CycleRequest(_) | Self::CycleResponse(_) => message_type::CYCLE_REQUEST,
            Self::ReportRequest(_) | Self::ReportResponse(_) => message_type::REPORT,
            Self::GetProtocolRequest(_) | Self::GetProtocolResponse(_) => message_type::GET_PROTOCOL,
            Self::JoinRoom(_) => message_type::JOIN_ROOM,
            Self::PeerLeft(_) => message_type::PEER_LEFT,
            Self::Internal(_) => message_type::INTERNAL_MESSAGE,
        }
    }

    /// Encode as a JSON text frame
    pub fn encode(&self) -> Result<String> {
        let data = match self {
            Self::KeepAlive => return Ok(KEEP_ALIVE_PAYLOAD.to_string()),
            Self::AuthRequest(m) => serde_json::to_value(m)?,
            Self::AuthResponse(m) => serde_json::to_value(m)?,
            Self::CycleRequest(m) => serde_json::to_value(m)?,
            Self::CycleResponse(m) => serde_json::to_value(m)?,
            Self::ReportRequest(m) => serde_json::to_value(m)?,
            Self::ReportResponse(m) => serde_json::to_value(m)?,
            Self::GetProtocolRequest(m) => serde_json::to_value(m)?,
            Self::GetProtocolResponse(v) => v.clone(),
            Self::JoinRoom(m) | Self::PeerLeft(m) => serde_json::to_value(m)?,
            Self::Internal(m) => encode_internal(m)?,
        };
        let envelope = json!({ "type": self.message_type(), "data": data });
        Ok(serde_json::to_string(&envelope)?)
    }

    /// Decode a JSON text frame
    pub fn decode(text: &str) -> Result<Self> {
        let envelope: Value = serde_json::from_str(text)?;
        let kind = envelope
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidMessage("missing `type`".into()))?;

        if kind == message_type::KEEP_ALIVE {
            return Ok(SignalingMessage::KeepAlive);
        }

        let data = envelope
            .get("data")
            .cloned()
            .ok_or_else(|| Error::InvalidMessage(format!("`{kind}` without `data`")))?;
        let has = |key: &str| data.get(key).is_some();
        let auth_request = has("model") && has("version") && !has("worker_id");
        let cycle_response = has("status");
        let report_request = has("diff");
        let protocol_request = has("workerId") && has("scopeId") && has("protocolId");

        let message = match kind {
            message_type::AUTHENTICATE if auth_request => {
                SignalingMessage::AuthRequest(serde_json::from_value(data)?)
            }
            message_type::AUTHENTICATE => SignalingMessage::AuthResponse(serde_json::from_value(data)?),
            message_type::CYCLE_REQUEST if cycle_response => {
                SignalingMessage::CycleResponse(serde_json::from_value(data)?)
            }
            message_type::CYCLE_REQUEST => SignalingMessage::CycleRequest(serde_json::from_value(data)?),
            message_type::REPORT if report_request => {
                SignalingMessage::ReportRequest(serde_json::from_value(data)?)
            }
            message_type::REPORT => SignalingMessage::ReportResponse(serde_json::from_value(data)?),
            message_type::GET_PROTOCOL if protocol_request => {
                SignalingMessage::GetProtocolRequest(serde_json::from_value(data)?)
            }
            message_type::GET_PROTOCOL => SignalingMessage::GetProtocolResponse(data),
            message_type::JOIN_ROOM => SignalingMessage::JoinRoom(serde_json::from_value(data)?),
            message_type::PEER_LEFT => SignalingMessage::PeerLeft(serde_json::from_value(data)?),
            message_type::INTERNAL_MESSAGE => SignalingMessage::Internal(decode_internal(data)?),
            other => return Err(Error::InvalidMessage(format!("unknown message type `{other}`"))),
        };
        Ok(message)
    }
}

fn encode_internal(message: &InternalMessage) -> Result<Value> {
    let payload = match &message.payload {
        PeerPayload::Offer(sdp) | PeerPayload::Answer(sdp) => serde_json::to_value(sdp)?,
        PeerPayload::Candidate(candidate) => serde_json::to_value(candidate)?,
    };
    let mut data = Map::new();
    data.insert("type".into(), Value::from(message.payload.kind()));
    data.insert("workerId".into(), Value::from(message.worker_id.as_str()));
    data.insert("scopeId".into(), Value::from(message.scope_id.as_str()));
    data.insert("to".into(), Value::from(message.to.as_str()));
    data.insert("data".into(), payload);
    Ok(Value::Object(data))
}

fn decode_internal(data: Value) -> Result<InternalMessage> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Raw {
        #[serde(rename = "type")]
        kind: String,
        worker_id: PeerId,
        scope_id: ScopeId,
        to: PeerId,
        data: Value,
    }

    let raw: Raw = serde_json::from_value(data)?;
    let payload = match raw.kind.as_str() {
        "offer" => PeerPayload::Offer(serde_json::from_value(raw.data)?),
        "answer" => PeerPayload::Answer(serde_json::from_value(raw.data)?),
        "candidate" => PeerPayload::Candidate(serde_json::from_value(raw.data)?),
        other => {
            return Err(Error::InvalidMessage(format!(
                "unknown internal message type `{other}`"
            )))
        }
    };
    Ok(InternalMessage {
        worker_id: raw.worker_id,
        scope_id: raw.scope_id,
        to: raw.to,
        payload,
    })
}
