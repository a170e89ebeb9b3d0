//! JSON wire protocol between the client and the event broker.
//!
//! Wire format (text frames):
//! ```text
//! client → broker   {"type":"subscribe",   "event_types":["job_created", ...]}
//!                   {"type":"unsubscribe", "event_types":[...]}
//!
//! broker → client   {"type":"event", "event_type":"document_change",
//!                    "event_id":"…", "source":"…", "payload":{…},
//!                    "timestamp":"2024-05-01T12:00:00Z"}
//!                   {"type":"subscription_confirmed", "event_types":[...]}
//! ```
//!
//! Unknown frame types are ignored. Event type strings that this crate does
//! not know are kept as [`EventType::Other`] so wildcard listeners still see
//! them.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::CollabError;

/// Every event type the broker delivers that this crate knows by name.
///
/// Domain events (jobs, equipment, inventory, service orders, BOM cart) are
/// delivered to dashboards; the collaboration events feed the sync engines.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventType {
    JobCreated,
    JobUpdated,
    JobCompleted,
    JobFailed,
    EquipmentStatusChanged,
    EquipmentMaintenanceDue,
    InventoryUpdated,
    InventoryLowStock,
    ServiceOrderCreated,
    ServiceOrderUpdated,
    BomCartUpdated,
    WhiteboardAction,
    WhiteboardCursor,
    DocumentChange,
    DocumentCursor,
    DocumentLock,
    /// Any event type string not listed above.
    Other(String),
}

impl EventType {
    /// Domain event types subscribed on every connect.
    pub const DOMAIN: [EventType; 11] = [
        EventType::JobCreated,
        EventType::JobUpdated,
        EventType::JobCompleted,
        EventType::JobFailed,
        EventType::EquipmentStatusChanged,
        EventType::EquipmentMaintenanceDue,
        EventType::InventoryUpdated,
        EventType::InventoryLowStock,
        EventType::ServiceOrderCreated,
        EventType::ServiceOrderUpdated,
        EventType::BomCartUpdated,
    ];

    /// Collaboration event types consumed by the sync engines.
    pub const COLLABORATION: [EventType; 5] = [
        EventType::WhiteboardAction,
        EventType::WhiteboardCursor,
        EventType::DocumentChange,
        EventType::DocumentCursor,
        EventType::DocumentLock,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            EventType::JobCreated => "job_created",
            EventType::JobUpdated => "job_updated",
            EventType::JobCompleted => "job_completed",
            EventType::JobFailed => "job_failed",
            EventType::EquipmentStatusChanged => "equipment_status_changed",
            EventType::EquipmentMaintenanceDue => "equipment_maintenance_due",
            EventType::InventoryUpdated => "inventory_updated",
            EventType::InventoryLowStock => "inventory_low_stock",
            EventType::ServiceOrderCreated => "service_order_created",
            EventType::ServiceOrderUpdated => "service_order_updated",
            EventType::BomCartUpdated => "bom_cart_updated",
            EventType::WhiteboardAction => "whiteboard_action",
            EventType::WhiteboardCursor => "whiteboard_cursor",
            EventType::DocumentChange => "document_change",
            EventType::DocumentCursor => "document_cursor",
            EventType::DocumentLock => "document_lock",
            EventType::Other(name) => name,
        }
    }

    /// The default subscription set sent on every (re)connect.
    pub fn default_subscriptions() -> Vec<String> {
        Self::DOMAIN
            .iter()
            .chain(Self::COLLABORATION.iter())
            .map(|t| t.as_str().to_string())
            .collect()
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        Self::DOMAIN
            .iter()
            .chain(Self::COLLABORATION.iter())
            .find(|t| t.as_str() == s)
            .cloned()
            .unwrap_or_else(|| EventType::Other(s.to_string()))
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event delivered by the broker. Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: String,
    pub event_type: EventType,
    pub source: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Deserialize the payload into a typed collaboration message.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, CollabError> {
        Ok(T::deserialize(&self.payload)?)
    }

    /// The `user_id` carried in the payload, if any.
    pub fn user_id(&self) -> Option<&str> {
        self.payload.get("user_id").and_then(Value::as_str)
    }
}

/// The authenticated local user as seen by the engines.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub user_name: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), user_name: user_name.into() }
    }

    pub fn is(&self, user_id: &str) -> bool {
        self.user_id == user_id
    }
}

/// Control messages sent to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { event_types: Vec<String> },
    Unsubscribe { event_types: Vec<String> },
}

impl ClientMessage {
    pub fn encode(&self) -> Result<String, CollabError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Frames received from the broker.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Event {
        event_type: String,
        event_id: String,
        #[serde(default)]
        source: String,
        #[serde(default)]
        payload: Value,
        #[serde(default = "Utc::now", deserialize_with = "timestamp::deserialize")]
        timestamp: DateTime<Utc>,
    },
    SubscriptionConfirmed {
        event_types: Vec<String>,
    },
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    pub fn decode(text: &str) -> Result<Self, CollabError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Convert an `event` frame into an [`Event`]; other frames yield `None`.
    pub fn into_event(self) -> Option<Event> {
        match self {
            ServerMessage::Event { event_type, event_id, source, payload, timestamp } => Some(Event {
                id: event_id,
                event_type: EventType::from(event_type.as_str()),
                source,
                payload,
                timestamp,
            }),
            _ => None,
        }
    }
}

/// Lenient ISO-8601 timestamps.
///
/// Accepts RFC 3339 and offset-less `YYYY-MM-DDTHH:MM:SS[.fff]` (read as
/// UTC); always writes RFC 3339 with a `Z` suffix.
pub mod timestamp {
    use super::*;

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp {raw:?}")))
    }
}
