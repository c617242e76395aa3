//! Typed message envelopes.
//!
//! An [`Envelope`] is the unit the spool persists and the transport delivers.
//! Its identity, kind, destination, payload and creation time are fixed when
//! it is built; only the delivery bookkeeping (`attempt_count` and `state`)
//! moves afterwards, and only the spool moves it.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Globally unique envelope identifier.
///
/// Rendered as 32 lowercase hex digits, which is also the spool file stem and
/// the AMQP `message-id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvelopeId(Uuid);

impl EnvelopeId {
    /// Generate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EnvelopeId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for EnvelopeId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for EnvelopeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// The closed set of message kinds on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Command,
    Event,
    Task,
    Notify,
    Heartbeat,
}

impl MessageKind {
    pub const ALL: [MessageKind; 5] = [
        MessageKind::Command,
        MessageKind::Event,
        MessageKind::Task,
        MessageKind::Notify,
        MessageKind::Heartbeat,
    ];

    /// Wire tag of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Command => "command",
            MessageKind::Event => "event",
            MessageKind::Task => "task",
            MessageKind::Notify => "notify",
            MessageKind::Heartbeat => "heartbeat",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = UnknownMessageKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownMessageKind(s.to_owned()))
    }
}

/// Returned when parsing a string that is not one of the five kind tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownMessageKind(pub String);

impl fmt::Display for UnknownMessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown message kind `{}`", self.0)
    }
}

impl std::error::Error for UnknownMessageKind {}

/// Delivery state of an envelope.
///
/// `Pending → InFlight → {Delivered | Pending | Failed}`. `Delivered` and
/// `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    InFlight,
    Delivered,
    Failed,
}

impl DeliveryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryState::Delivered | DeliveryState::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: DeliveryState) -> bool {
        use DeliveryState::*;
        matches!(
            (self, next),
            (Pending, InFlight) | (InFlight, Pending) | (InFlight, Delivered) | (InFlight, Failed)
        )
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeliveryState::Pending => "pending",
            DeliveryState::InFlight => "in_flight",
            DeliveryState::Delivered => "delivered",
            DeliveryState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Message container persisted by the spool and sent by the transport.
///
/// ## Example
///
/// ```rust
/// use aorta::{Envelope, MessageKind, DeliveryState};
///
/// let envelope = Envelope::new(MessageKind::Command, "orders", b"{}".to_vec());
/// assert_eq!(envelope.state(), DeliveryState::Pending);
/// assert_eq!(envelope.attempt_count(), 0);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    id: EnvelopeId,
    correlation_id: EnvelopeId,
    kind: MessageKind,
    destination: String,
    #[serde(with = "payload_base64")]
    payload: Vec<u8>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    not_before: Option<DateTime<Utc>>,
    attempt_count: u32,
    state: DeliveryState,
}

impl Envelope {
    /// Build a new `Pending` envelope with a fresh id and correlation id.
    pub fn new(kind: MessageKind, destination: impl Into<String>, payload: Vec<u8>) -> Self {
        let id = EnvelopeId::new();
        Self {
            id,
            correlation_id: EnvelopeId::new(),
            kind,
            destination: destination.into(),
            payload,
            created_at: Utc::now(),
            not_before: None,
            attempt_count: 0,
            state: DeliveryState::Pending,
        }
    }

    /// Set the correlation id instead of the generated one.
    pub fn with_correlation_id(mut self, correlation_id: EnvelopeId) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Hold the envelope back from transmission until `not_before`.
    pub fn with_not_before(mut self, not_before: DateTime<Utc>) -> Self {
        self.not_before = Some(not_before);
        self
    }

    pub fn id(&self) -> EnvelopeId {
        self.id
    }

    pub fn correlation_id(&self) -> EnvelopeId {
        self.correlation_id
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn not_before(&self) -> Option<DateTime<Utc>> {
        self.not_before
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn state(&self) -> DeliveryState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: DeliveryState) {
        self.state = state;
    }

    pub(crate) fn record_attempt(&mut self) {
        self.attempt_count = self.attempt_count.saturating_add(1);
    }
}

mod payload_base64 {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_parse_back() {
        for kind in MessageKind::ALL {
            assert_eq!(kind.as_str().parse::<MessageKind>().unwrap(), kind);
        }
        assert!("query".parse::<MessageKind>().is_err());
    }

    #[test]
    fn envelope_id_displays_as_simple_hex() {
        let id = EnvelopeId::new();
        let rendered = id.to_string();
        assert_eq!(rendered.len(), 32);
        assert_eq!(rendered.parse::<EnvelopeId>().unwrap(), id);
    }

    #[test]
    fn terminal_states_do_not_transition() {
        for next in [
            DeliveryState::Pending,
            DeliveryState::InFlight,
            DeliveryState::Delivered,
            DeliveryState::Failed,
        ] {
            assert!(!DeliveryState::Delivered.can_transition_to(next));
            assert!(!DeliveryState::Failed.can_transition_to(next));
        }
        assert!(DeliveryState::InFlight.can_transition_to(DeliveryState::Pending));
    }

    #[test]
    fn payload_survives_json_as_base64() {
        let envelope = Envelope::new(MessageKind::Event, "audit", vec![0, 159, 146, 150]);
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("\"payload\":\"AJ+Slg==\""));
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, envelope);
    }
}
