use serde::{Deserialize, Serialize};
use std::fmt;

use super::user::UserId;

/// Media requested for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CallMode {
    /// Audio only. Serialized as `voice` to match the stored `call_mode` column.
    #[default]
    #[serde(rename = "voice")]
    Audio,
    /// Audio and video.
    #[serde(rename = "video")]
    Video,
}

impl CallMode {
    pub fn has_video(&self) -> bool {
        matches!(self, Self::Video)
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "voice",
            Self::Video => "video",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "voice" | "audio" => Some(Self::Audio),
            "video" => Some(Self::Video),
            _ => None,
        }
    }
}

impl fmt::Display for CallMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the offer/answer exchange this peer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallRole {
    /// Creates and publishes the offer.
    Initiator,
    /// Applies the offer and publishes the answer.
    Responder,
}

/// Deterministic key for the signaling channel shared by two participants.
///
/// Both peers derive the same key regardless of who is calling whom.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelKey {
    low: UserId,
    high: UserId,
}

impl ChannelKey {
    pub fn new(a: &UserId, b: &UserId) -> Self {
        if a <= b {
            Self {
                low: a.clone(),
                high: b.clone(),
            }
        } else {
            Self {
                low: b.clone(),
                high: a.clone(),
            }
        }
    }

    /// Realtime channel name, e.g. `call-alice-bob`.
    pub fn channel_name(&self) -> String {
        format!("call-{}-{}", self.low, self.high)
    }

    pub fn contains(&self, id: &UserId) -> bool {
        &self.low == id || &self.high == id
    }

    /// The participant that is not `id`, if `id` belongs to this pair.
    pub fn other(&self, id: &UserId) -> Option<&UserId> {
        if &self.low == id {
            Some(&self.high)
        } else if &self.high == id {
            Some(&self.low)
        } else {
            None
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.channel_name())
    }
}

/// A request to establish a call between two participants.
///
/// Fixed for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallIntent {
    pub local_id: UserId,
    pub remote_id: UserId,
    pub mode: CallMode,
    pub role: CallRole,
}

impl CallIntent {
    pub fn outgoing(local_id: UserId, remote_id: UserId, mode: CallMode) -> Self {
        Self {
            local_id,
            remote_id,
            mode,
            role: CallRole::Initiator,
        }
    }

    pub fn incoming(local_id: UserId, remote_id: UserId, mode: CallMode) -> Self {
        Self {
            local_id,
            remote_id,
            mode,
            role: CallRole::Responder,
        }
    }

    pub fn is_initiator(&self) -> bool {
        self.role == CallRole::Initiator
    }

    pub fn channel_key(&self) -> ChannelKey {
        ChannelKey::new(&self.local_id, &self.remote_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_key_is_order_independent() {
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");

        let k1 = ChannelKey::new(&alice, &bob);
        let k2 = ChannelKey::new(&bob, &alice);

        assert_eq!(k1, k2);
        assert_eq!(k1.channel_name(), "call-alice-bob");
        assert_eq!(k1.other(&alice), Some(&bob));
        assert_eq!(k1.other(&UserId::from("carol")), None);
    }

    #[test]
    fn call_mode_uses_stored_names() {
        assert_eq!(serde_json::to_string(&CallMode::Audio).unwrap(), "\"voice\"");
        assert_eq!(serde_json::to_string(&CallMode::Video).unwrap(), "\"video\"");
        assert_eq!(CallMode::from_str_opt("VOICE"), Some(CallMode::Audio));
        assert_eq!(CallMode::from_str_opt("fax"), None);
    }

    #[test]
    fn intent_roles() {
        let out = CallIntent::outgoing("a".into(), "b".into(), CallMode::Video);
        let inc = CallIntent::incoming("b".into(), "a".into(), CallMode::Video);

        assert!(out.is_initiator());
        assert!(!inc.is_initiator());
        assert_eq!(out.channel_key(), inc.channel_key());
    }
}
