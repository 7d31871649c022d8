//! A small STOMP 1.2 broker client.
//!
//! The harness only ever sees the traits below: a [`ConnectionFactory`] opens
//! [`Connection`]s, a connection hands out [`Session`]s, and sessions create
//! [`MessageProducer`]s and [`MessageConsumer`]s. [`StompConnectionFactory`] is
//! the implementation that talks to a real broker over TCP or TLS.

pub mod connection;
mod error;
pub mod frame;
pub mod tls;
pub mod uri;

pub use connection::{is_reserved_header, StompConnection, StompConnectionFactory};
pub use error::ClientError;

use async_trait::async_trait;
use bytes::Bytes;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

/// An addressable broker-side message target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    Queue(String),
    Topic(String),
}

impl Destination {
    pub fn name(&self) -> &str {
        match self {
            Destination::Queue(name) | Destination::Topic(name) => name,
        }
    }

    pub fn is_topic(&self) -> bool {
        matches!(self, Destination::Topic(_))
    }

    /// The destination header value understood by STOMP brokers.
    pub fn stomp_path(&self) -> String {
        match self {
            Destination::Queue(name) => format!("/queue/{name}"),
            Destination::Topic(name) => format!("/topic/{name}"),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Queue(name) => write!(f, "queue://{name}"),
            Destination::Topic(name) => write!(f, "topic://{name}"),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// How received messages are settled for every consumer of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Messages count as consumed on delivery.
    AutoAcknowledge,
    /// Messages count as consumed once acknowledged; an ack covers every
    /// earlier delivery of the subscription.
    ClientAcknowledge,
    /// Receives join the session's transaction and only take effect on commit.
    Transacted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    String(String),
    Long(i64),
    Int(i32),
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::String(value) => f.write_str(value),
            PropertyValue::Long(value) => write!(f, "{value}"),
            PropertyValue::Int(value) => write!(f, "{value}"),
        }
    }
}

/// An outgoing text message with its application properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextMessage {
    text: String,
    properties: BTreeMap<String, PropertyValue>,
}

impl TextMessage {
    pub fn new(text: impl Into<String>) -> Self {
        TextMessage {
            text: text.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn set_string_property(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.properties
            .insert(name.into(), PropertyValue::String(value.into()));
    }

    pub fn set_long_property(&mut self, name: impl Into<String>, value: i64) {
        self.properties.insert(name.into(), PropertyValue::Long(value));
    }

    pub fn set_int_property(&mut self, name: impl Into<String>, value: i32) {
        self.properties.insert(name.into(), PropertyValue::Int(value));
    }

    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    pub fn properties(&self) -> impl Iterator<Item = (&str, &PropertyValue)> {
        self.properties.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// A message delivered to a consumer.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    headers: Vec<(String, String)>,
    body: Bytes,
}

impl ReceivedMessage {
    pub fn new(headers: Vec<(String, String)>, body: impl Into<Bytes>) -> Self {
        ReceivedMessage {
            headers,
            body: body.into(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn message_id(&self) -> Option<&str> {
        self.header("message-id")
    }

    /// Identifier the broker expects back in an ACK, if the subscription needs one.
    pub fn ack_id(&self) -> Option<&str> {
        self.header("ack")
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// The body as text, failing for binary payloads.
    pub fn text(&self) -> Result<&str, ClientError> {
        if let Some(content_type) = self.header("content-type") {
            if !content_type.starts_with("text/") {
                return Err(ClientError::NotText);
            }
        }
        std::str::from_utf8(&self.body).map_err(|_| ClientError::NotText)
    }

    pub fn text_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Open an authenticated (or anonymous) connection, optionally tagged
    /// with a client identifier for durable subscriptions.
    async fn create_connection(
        &self,
        credentials: Option<&Credentials>,
        client_id: Option<&str>,
    ) -> Result<Box<dyn Connection>, ClientError>;
}

#[async_trait]
pub trait Connection: Send + Sync {
    /// Allow message delivery to this connection's consumers.
    fn start(&self);

    async fn create_session(&self, mode: SessionMode) -> Result<Box<dyn Session>, ClientError>;

    async fn close(&self) -> Result<(), ClientError>;
}

#[async_trait]
pub trait Session: Send + Sync {
    fn mode(&self) -> SessionMode;

    async fn create_producer(
        &self,
        destination: &Destination,
    ) -> Result<Box<dyn MessageProducer>, ClientError>;

    async fn create_consumer(
        &self,
        destination: &Destination,
        selector: Option<&str>,
    ) -> Result<Box<dyn MessageConsumer>, ClientError>;

    /// Create a named subscription on a topic that outlives this connection.
    async fn create_durable_subscriber(
        &self,
        topic: &Destination,
        name: &str,
        selector: Option<&str>,
    ) -> Result<Box<dyn MessageConsumer>, ClientError>;

    async fn commit(&self) -> Result<(), ClientError>;

    async fn close(&self) -> Result<(), ClientError>;
}

#[async_trait]
pub trait MessageProducer: Send + Sync {
    /// Send and wait until the broker has taken responsibility for the message.
    async fn send(&self, message: &TextMessage) -> Result<(), ClientError>;
}

#[async_trait]
pub trait MessageConsumer: Send {
    /// Wait for the next message on this subscription.
    async fn receive(&mut self) -> Result<ReceivedMessage, ClientError>;

    async fn acknowledge(&self, message: &ReceivedMessage) -> Result<(), ClientError>;
}
