//! An in-memory broker for exercising the harnesses without a network.
//!
//! Every call made through the client traits is appended to an event log
//! that tests inspect afterwards.

use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use stomp_client::{
    ClientError, Connection, ConnectionFactory, Credentials, Destination, MessageConsumer,
    MessageProducer, ReceivedMessage, Session, SessionMode, TextMessage,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Connected {
        connection: usize,
        username: Option<String>,
        client_id: Option<String>,
    },
    Started {
        connection: usize,
    },
    SessionCreated {
        connection: usize,
        mode: SessionMode,
    },
    Subscribed {
        connection: usize,
        destination: Destination,
        selector: Option<String>,
        durable_name: Option<String>,
    },
    Sent {
        connection: usize,
        destination: Destination,
        message: TextMessage,
    },
    Received {
        connection: usize,
        message_id: String,
    },
    Acknowledged {
        connection: usize,
        message_id: String,
    },
    Committed {
        connection: usize,
    },
    SessionClosed {
        connection: usize,
    },
    ConnectionClosed {
        connection: usize,
    },
}

#[derive(Default)]
struct Inner {
    events: Mutex<Vec<BrokerEvent>>,
    inbox: Mutex<VecDeque<ReceivedMessage>>,
    enqueued: AtomicUsize,
    connections: AtomicUsize,
    failing_sends: AtomicUsize,
    dropping_sends: AtomicUsize,
    dead: Mutex<HashSet<usize>>,
    refuse_connections: AtomicBool,
    hold_when_empty: AtomicBool,
}

impl Inner {
    fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, event: BrokerEvent) {
        Self::lock(&self.events).push(event);
    }
}

#[derive(Clone, Default)]
pub struct FakeBroker {
    inner: Arc<Inner>,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a text message for the next `receive` on any consumer.
    pub fn enqueue(&self, text: &str) -> String {
        self.enqueue_with_type("text/plain", text.as_bytes().to_vec())
    }

    /// Queue a binary message.
    pub fn enqueue_bytes(&self, body: &[u8]) -> String {
        self.enqueue_with_type("application/octet-stream", body.to_vec())
    }

    fn enqueue_with_type(&self, content_type: &str, body: Vec<u8>) -> String {
        let n = self.inner.enqueued.fetch_add(1, Ordering::SeqCst) + 1;
        let message_id = format!("ID:fake-{n}");
        let message = ReceivedMessage::new(
            vec![
                ("message-id".to_string(), message_id.clone()),
                ("ack".to_string(), format!("ack-{n}")),
                ("content-type".to_string(), content_type.to_string()),
            ],
            body,
        );
        Inner::lock(&self.inner.inbox).push_back(message);
        message_id
    }

    /// Make the next `n` sends fail with a broker error.
    pub fn fail_next_sends(&self, n: usize) {
        self.inner.failing_sends.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` sends lose their connection. Every later send on
    /// a lost connection fails the same way.
    pub fn drop_next_connections(&self, n: usize) {
        self.inner.dropping_sends.store(n, Ordering::SeqCst);
    }

    pub fn refuse_connections(&self) {
        self.inner.refuse_connections.store(true, Ordering::SeqCst);
    }

    /// Once the inbox is empty, `receive` waits forever instead of failing
    /// with a lost connection.
    pub fn hold_when_empty(&self) {
        self.inner.hold_when_empty.store(true, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<BrokerEvent> {
        Inner::lock(&self.inner.events).clone()
    }

    pub fn sent(&self) -> Vec<(usize, TextMessage)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                BrokerEvent::Sent {
                    connection,
                    message,
                    ..
                } => Some((connection, message)),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, matches: impl Fn(&BrokerEvent) -> bool) -> usize {
        self.events().iter().filter(|event| matches(event)).count()
    }
}

#[async_trait]
impl ConnectionFactory for FakeBroker {
    async fn create_connection(
        &self,
        credentials: Option<&Credentials>,
        client_id: Option<&str>,
    ) -> Result<Box<dyn Connection>, ClientError> {
        if self.inner.refuse_connections.load(Ordering::SeqCst) {
            return Err(ClientError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "fake broker refused the connection",
            )));
        }

        let connection = self.inner.connections.fetch_add(1, Ordering::SeqCst);
        self.inner.record(BrokerEvent::Connected {
            connection,
            username: credentials.map(|c| c.username.clone()),
            client_id: client_id.map(str::to_string),
        });
        Ok(Box::new(FakeConnection {
            id: connection,
            inner: self.inner.clone(),
        }))
    }
}

struct FakeConnection {
    id: usize,
    inner: Arc<Inner>,
}

#[async_trait]
impl Connection for FakeConnection {
    fn start(&self) {
        self.inner.record(BrokerEvent::Started { connection: self.id });
    }

    async fn create_session(&self, mode: SessionMode) -> Result<Box<dyn Session>, ClientError> {
        self.inner.record(BrokerEvent::SessionCreated {
            connection: self.id,
            mode,
        });
        Ok(Box::new(FakeSession {
            connection: self.id,
            mode,
            inner: self.inner.clone(),
        }))
    }

    async fn close(&self) -> Result<(), ClientError> {
        self.inner
            .record(BrokerEvent::ConnectionClosed { connection: self.id });
        Ok(())
    }
}

struct FakeSession {
    connection: usize,
    mode: SessionMode,
    inner: Arc<Inner>,
}

impl FakeSession {
    fn subscribe(
        &self,
        destination: &Destination,
        selector: Option<&str>,
        durable_name: Option<&str>,
    ) -> Box<dyn MessageConsumer> {
        self.inner.record(BrokerEvent::Subscribed {
            connection: self.connection,
            destination: destination.clone(),
            selector: selector.map(str::to_string),
            durable_name: durable_name.map(str::to_string),
        });
        Box::new(FakeConsumer {
            connection: self.connection,
            inner: self.inner.clone(),
        })
    }
}

#[async_trait]
impl Session for FakeSession {
    fn mode(&self) -> SessionMode {
        self.mode
    }

    async fn create_producer(
        &self,
        destination: &Destination,
    ) -> Result<Box<dyn MessageProducer>, ClientError> {
        Ok(Box::new(FakeProducer {
            connection: self.connection,
            destination: destination.clone(),
            inner: self.inner.clone(),
        }))
    }

    async fn create_consumer(
        &self,
        destination: &Destination,
        selector: Option<&str>,
    ) -> Result<Box<dyn MessageConsumer>, ClientError> {
        Ok(self.subscribe(destination, selector, None))
    }

    async fn create_durable_subscriber(
        &self,
        topic: &Destination,
        name: &str,
        selector: Option<&str>,
    ) -> Result<Box<dyn MessageConsumer>, ClientError> {
        if !topic.is_topic() {
            return Err(ClientError::InvalidDestination(topic.to_string()));
        }
        Ok(self.subscribe(topic, selector, Some(name)))
    }

    async fn commit(&self) -> Result<(), ClientError> {
        if self.mode != SessionMode::Transacted {
            return Err(ClientError::NotTransacted);
        }
        self.inner.record(BrokerEvent::Committed {
            connection: self.connection,
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), ClientError> {
        self.inner.record(BrokerEvent::SessionClosed {
            connection: self.connection,
        });
        Ok(())
    }
}

struct FakeProducer {
    connection: usize,
    destination: Destination,
    inner: Arc<Inner>,
}

#[async_trait]
impl MessageProducer for FakeProducer {
    async fn send(&self, message: &TextMessage) -> Result<(), ClientError> {
        tokio::task::yield_now().await;

        let lost =
            || ClientError::ConnectionLost("fake broker dropped the connection".to_string());
        if Inner::lock(&self.inner.dead).contains(&self.connection) {
            return Err(lost());
        }
        let drop_now = self
            .inner
            .dropping_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if drop_now {
            Inner::lock(&self.inner.dead).insert(self.connection);
            return Err(lost());
        }

        let fail = self
            .inner
            .failing_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(ClientError::Broker {
                message: "injected send failure".to_string(),
                details: String::new(),
            });
        }

        self.inner.record(BrokerEvent::Sent {
            connection: self.connection,
            destination: self.destination.clone(),
            message: message.clone(),
        });
        Ok(())
    }
}

struct FakeConsumer {
    connection: usize,
    inner: Arc<Inner>,
}

#[async_trait]
impl MessageConsumer for FakeConsumer {
    async fn receive(&mut self) -> Result<ReceivedMessage, ClientError> {
        tokio::task::yield_now().await;

        let next = Inner::lock(&self.inner.inbox).pop_front();
        match next {
            Some(message) => {
                self.inner.record(BrokerEvent::Received {
                    connection: self.connection,
                    message_id: message.message_id().unwrap_or_default().to_string(),
                });
                Ok(message)
            }
            None if self.inner.hold_when_empty.load(Ordering::SeqCst) => {
                std::future::pending().await
            }
            None => Err(ClientError::ConnectionLost(
                "fake broker inbox drained".to_string(),
            )),
        }
    }

    async fn acknowledge(&self, message: &ReceivedMessage) -> Result<(), ClientError> {
        self.inner.record(BrokerEvent::Acknowledged {
            connection: self.connection,
            message_id: message.message_id().unwrap_or_default().to_string(),
        });
        Ok(())
    }
}
