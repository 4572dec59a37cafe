//! Signaling message definitions and their stored row encoding.
//!
//! Signaling travels through the backend as rows of a `calls` table:
//!
//! ```text
//! caller_id | receiver_id | type      | signal_data                     | call_mode
//! ----------+-------------+-----------+---------------------------------+----------
//! alice     | bob         | offer     | {"sdp":{"type":"offer",...}}    | video
//! alice     | bob         | candidate | {"candidate":{"candidate":...}} | video
//! alice     | bob         | end       | {}                              |
//! ```
//!
//! The receiving side gets each inserted row as a change notification and
//! parses `signal_data` back into a typed payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::types::{CallMode, UserId};

/// Kind of a signaling message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    /// Session description proposed by the initiator.
    Offer,
    /// Session description accepted by the responder.
    Answer,
    /// One trickled ICE candidate.
    Candidate,
    /// Either side hung up.
    End,
}

impl SignalKind {
    pub const ALL: [SignalKind; 4] = [Self::Offer, Self::Answer, Self::Candidate, Self::End];

    /// Value stored in the `type` column.
    pub const fn tag_name(&self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Candidate => "candidate",
            Self::End => "end",
        }
    }

    /// Parse from the `type` column (case-insensitive).
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.to_lowercase().as_str() {
            "offer" => Some(Self::Offer),
            "answer" => Some(Self::Answer),
            "candidate" => Some(Self::Candidate),
            "end" => Some(Self::End),
            _ => None,
        }
    }

    /// Whether this kind carries a session description.
    pub fn is_description(&self) -> bool {
        matches!(self, Self::Offer | Self::Answer)
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag_name())
    }
}

/// Direction of a session description in the offer/answer exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Opaque offer/answer blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// An ICE candidate received from or to be sent to a peer.
///
/// Field names on the wire follow `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// The candidate line, e.g. `candidate:1 1 UDP 2130706431 192.168.1.1 8888 typ host`.
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }

    pub fn with_sdp_mid(mut self, sdp_mid: impl Into<String>) -> Self {
        self.sdp_mid = Some(sdp_mid.into());
        self
    }

    pub fn with_sdp_m_line_index(mut self, index: u16) -> Self {
        self.sdp_m_line_index = Some(index);
        self
    }

    pub fn with_username_fragment(mut self, ufrag: impl Into<String>) -> Self {
        self.username_fragment = Some(ufrag.into());
        self
    }
}

/// Typed content of a signaling message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalPayload {
    Description(SessionDescription),
    Candidate(IceCandidate),
    Empty,
}

/// A single signaling message between two peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingMessage {
    pub from_id: UserId,
    pub to_id: UserId,
    pub kind: SignalKind,
    pub payload: SignalPayload,
    /// Mode of the call this message belongs to. Absent on `end` rows.
    pub mode: Option<CallMode>,
    /// Creation time; only a hint, the relay does not order across senders.
    pub created_at: DateTime<Utc>,
}

impl SignalingMessage {
    fn build(
        from_id: UserId,
        to_id: UserId,
        kind: SignalKind,
        payload: SignalPayload,
        mode: Option<CallMode>,
    ) -> Self {
        Self {
            from_id,
            to_id,
            kind,
            payload,
            mode,
            created_at: Utc::now(),
        }
    }

    pub fn offer(from: UserId, to: UserId, mode: CallMode, desc: SessionDescription) -> Self {
        Self::build(
            from,
            to,
            SignalKind::Offer,
            SignalPayload::Description(desc),
            Some(mode),
        )
    }

    pub fn answer(from: UserId, to: UserId, mode: CallMode, desc: SessionDescription) -> Self {
        Self::build(
            from,
            to,
            SignalKind::Answer,
            SignalPayload::Description(desc),
            Some(mode),
        )
    }

    pub fn candidate(from: UserId, to: UserId, mode: CallMode, candidate: IceCandidate) -> Self {
        Self::build(
            from,
            to,
            SignalKind::Candidate,
            SignalPayload::Candidate(candidate),
            Some(mode),
        )
    }

    pub fn end(from: UserId, to: UserId) -> Self {
        Self::build(from, to, SignalKind::End, SignalPayload::Empty, None)
    }

    pub fn description(&self) -> Option<&SessionDescription> {
        match &self.payload {
            SignalPayload::Description(d) => Some(d),
            _ => None,
        }
    }

    pub fn ice_candidate(&self) -> Option<&IceCandidate> {
        match &self.payload {
            SignalPayload::Candidate(c) => Some(c),
            _ => None,
        }
    }

    /// Encode into the stored row shape.
    pub fn to_row(&self) -> Result<SignalRow, SignalError> {
        let data = match &self.payload {
            SignalPayload::Description(sdp) => SignalData {
                sdp: Some(sdp.clone()),
                candidate: None,
            },
            SignalPayload::Candidate(c) => SignalData {
                sdp: None,
                candidate: Some(c.clone()),
            },
            SignalPayload::Empty => SignalData::default(),
        };

        Ok(SignalRow {
            caller_id: self.from_id.clone(),
            receiver_id: self.to_id.clone(),
            kind: self.kind.tag_name().to_string(),
            signal_data: serde_json::to_string(&data)?,
            call_mode: self.mode,
            created_at: self.created_at,
        })
    }

    /// Decode a stored row, validating that the payload matches the kind.
    pub fn from_row(row: &SignalRow) -> Result<Self, SignalError> {
        let kind = SignalKind::from_tag(&row.kind)
            .ok_or_else(|| SignalError::UnknownKind(row.kind.clone()))?;

        let payload = if kind == SignalKind::End {
            SignalPayload::Empty
        } else {
            let data: SignalData = serde_json::from_str(&row.signal_data)?;
            match kind {
                SignalKind::Offer | SignalKind::Answer => {
                    let sdp = data.sdp.ok_or(SignalError::MissingPayload(kind))?;
                    let expected = if kind == SignalKind::Offer {
                        SdpType::Offer
                    } else {
                        SdpType::Answer
                    };
                    if sdp.sdp_type != expected {
                        return Err(SignalError::PayloadMismatch {
                            kind,
                            sdp_type: sdp.sdp_type,
                        });
                    }
                    SignalPayload::Description(sdp)
                }
                SignalKind::Candidate => {
                    SignalPayload::Candidate(data.candidate.ok_or(SignalError::MissingPayload(kind))?)
                }
                SignalKind::End => SignalPayload::Empty,
            }
        };

        Ok(Self {
            from_id: row.caller_id.clone(),
            to_id: row.receiver_id.clone(),
            kind,
            payload,
            mode: row.call_mode,
            created_at: row.created_at,
        })
    }
}

/// JSON body of the `signal_data` column.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SignalData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sdp: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    candidate: Option<IceCandidate>,
}

/// One row of the signaling table as stored by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalRow {
    pub caller_id: UserId,
    pub receiver_id: UserId,
    #[serde(rename = "type")]
    pub kind: String,
    /// JSON-encoded payload, kept as text like the backend column.
    pub signal_data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_mode: Option<CallMode>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("malformed signal data: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown signaling type: {0}")]
    UnknownKind(String),

    #[error("{0} message without payload")]
    MissingPayload(SignalKind),

    #[error("{kind} message carries a {sdp_type:?} description")]
    PayloadMismatch { kind: SignalKind, sdp_type: SdpType },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> UserId {
        UserId::from("alice")
    }

    fn bob() -> UserId {
        UserId::from("bob")
    }

    #[test]
    fn tag_names_round_trip() {
        for kind in SignalKind::ALL {
            assert_eq!(SignalKind::from_tag(kind.tag_name()), Some(kind));
        }
        assert_eq!(SignalKind::from_tag("ANSWER"), Some(SignalKind::Answer));
        assert_eq!(SignalKind::from_tag("preaccept"), None);
    }

    #[test]
    fn parses_browser_shaped_rows() {
        let row = SignalRow {
            caller_id: alice(),
            receiver_id: bob(),
            kind: "candidate".into(),
            signal_data: r#"{"candidate":{"candidate":"candidate:1 1 UDP 2130706431 10.0.0.2 5000 typ host","sdpMid":"0","sdpMLineIndex":0,"usernameFragment":"abcd"}}"#.into(),
            call_mode: Some(CallMode::Video),
            created_at: Utc::now(),
        };

        let msg = SignalingMessage::from_row(&row).unwrap();
        let c = msg.ice_candidate().unwrap();
        assert_eq!(c.sdp_mid.as_deref(), Some("0"));
        assert_eq!(c.sdp_m_line_index, Some(0));
        assert_eq!(c.username_fragment.as_deref(), Some("abcd"));
        assert_eq!(msg.mode, Some(CallMode::Video));
    }

    #[test]
    fn offer_row_keeps_sdp_shape() {
        let msg = SignalingMessage::offer(
            alice(),
            bob(),
            CallMode::Audio,
            SessionDescription::offer("v=0\r\n"),
        );
        let row = msg.to_row().unwrap();

        assert_eq!(row.kind, "offer");
        assert_eq!(row.call_mode, Some(CallMode::Audio));
        let json: serde_json::Value = serde_json::from_str(&row.signal_data).unwrap();
        assert_eq!(json["sdp"]["type"], "offer");
        assert_eq!(json["sdp"]["sdp"], "v=0\r\n");
        assert!(json.get("candidate").is_none());
    }

    #[test]
    fn end_row_ignores_signal_data() {
        let row = SignalRow {
            caller_id: alice(),
            receiver_id: bob(),
            kind: "end".into(),
            signal_data: "not json".into(),
            call_mode: None,
            created_at: Utc::now(),
        };

        let msg = SignalingMessage::from_row(&row).unwrap();
        assert_eq!(msg.kind, SignalKind::End);
        assert_eq!(msg.payload, SignalPayload::Empty);
        assert_eq!(SignalingMessage::end(alice(), bob()).to_row().unwrap().signal_data, "{}");
    }

    #[test]
    fn rejects_mismatched_or_missing_payloads() {
        let answer_with_offer = SignalRow {
            caller_id: alice(),
            receiver_id: bob(),
            kind: "answer".into(),
            signal_data: r#"{"sdp":{"type":"offer","sdp":"v=0"}}"#.into(),
            call_mode: None,
            created_at: Utc::now(),
        };
        assert!(matches!(
            SignalingMessage::from_row(&answer_with_offer),
            Err(SignalError::PayloadMismatch { .. })
        ));

        let empty_candidate = SignalRow {
            kind: "candidate".into(),
            signal_data: "{}".into(),
            ..answer_with_offer.clone()
        };
        assert!(matches!(
            SignalingMessage::from_row(&empty_candidate),
            Err(SignalError::MissingPayload(SignalKind::Candidate))
        ));

        let unknown = SignalRow {
            kind: "ringing".into(),
            ..answer_with_offer
        };
        assert!(matches!(
            SignalingMessage::from_row(&unknown),
            Err(SignalError::UnknownKind(_))
        ));
    }
}
