use std::fmt::{Display, Formatter};
use std::sync::Arc;
use uuid::Uuid;

/// Identifies one logical message; stable across all parcels and receipts
///  belonging to it.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct MessageId(Uuid);

impl Display for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl MessageId {
    pub fn new() -> MessageId {
        MessageId(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> MessageId {
        MessageId(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for MessageId {
    fn default() -> Self {
        MessageId::new()
    }
}

/// Opaque identifier of a remote device as handed to us by the BLE layer.
///
/// The protocol never interprets this value, it is only used as a map key and
///  passed back to the transport callback. Cheap to clone.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct DeviceId(Arc<str>);

impl Display for DeviceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl DeviceId {
    pub fn new(raw: impl Into<Arc<str>>) -> DeviceId {
        DeviceId(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        DeviceId::new(value)
    }
}
