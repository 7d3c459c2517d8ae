use bytes::Bytes;
use felix_common::ids::ConnectionId;
use smallvec::SmallVec;
use std::fmt;

/// Store-assigned position of a message within its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msg-{}", self.0)
    }
}

/// Owner token for a message lock. One per consumer key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockId(pub u64);

/// A message as handed to the store by a producer.
///
/// ```
/// use bytes::Bytes;
/// use felix_storage::Message;
///
/// let msg = Message::new(Bytes::from_static(b"hello"))
///     .with_property("region", "eu")
///     .with_classification("gold");
/// assert_eq!(msg.property("region"), Some("eu"));
/// assert_eq!(msg.classification(), Some("gold"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct Message {
    payload: Bytes,
    // Most messages carry a handful of properties; keep them inline.
    properties: SmallVec<[(String, String); 4]>,
    discriminator: Option<String>,
    classification: Option<String>,
    producer_connection: Option<ConnectionId>,
}

impl Message {
    pub fn new(payload: Bytes) -> Self {
        Self {
            payload,
            ..Self::default()
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        let value = value.into();
        match self.properties.iter_mut().find(|(key, _)| *key == name) {
            Some(slot) => slot.1 = value,
            None => self.properties.push((name, value)),
        }
        self
    }

    pub fn with_discriminator(mut self, discriminator: impl Into<String>) -> Self {
        self.discriminator = Some(discriminator.into());
        self
    }

    pub fn with_classification(mut self, classification: impl Into<String>) -> Self {
        self.classification = Some(classification.into());
        self
    }

    pub fn from_connection(mut self, connection: ConnectionId) -> Self {
        self.producer_connection = Some(connection);
        self
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn discriminator(&self) -> Option<&str> {
        self.discriminator.as_deref()
    }

    pub fn classification(&self) -> Option<&str> {
        self.classification.as_deref()
    }

    pub fn producer_connection(&self) -> Option<ConnectionId> {
        self.producer_connection
    }
}

/// A message once the store has accepted it.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    id: MessageId,
    message: Message,
}

impl StoredMessage {
    pub fn new(id: MessageId, message: Message) -> Self {
        Self { id, message }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn payload(&self) -> &Bytes {
        self.message.payload()
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.message.property(name)
    }

    pub fn discriminator(&self) -> Option<&str> {
        self.message.discriminator()
    }

    pub fn classification(&self) -> Option<&str> {
        self.message.classification()
    }

    pub fn producer_connection(&self) -> Option<ConnectionId> {
        self.message.producer_connection()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_property_overwrites_previous_value() {
        let msg = Message::new(Bytes::from_static(b"x"))
            .with_property("k", "1")
            .with_property("k", "2");
        assert_eq!(msg.property("k"), Some("2"));
        assert_eq!(msg.property("missing"), None);
    }

    #[test]
    fn stored_message_exposes_producer_fields() {
        let conn = ConnectionId::new();
        let stored = StoredMessage::new(
            MessageId(7),
            Message::new(Bytes::from_static(b"x"))
                .with_discriminator("orders/eu")
                .from_connection(conn),
        );
        assert_eq!(stored.id(), MessageId(7));
        assert_eq!(stored.discriminator(), Some("orders/eu"));
        assert_eq!(stored.producer_connection(), Some(conn));
        assert_eq!(stored.id().to_string(), "msg-7");
    }
}
