//! The STOMP implementation of the client traits.
//!
//! One [`StompConnection`] owns one socket. Writes go through a shared sink
//! behind a mutex; a reader task routes MESSAGE frames to the consumer that
//! owns the subscription and RECEIPT/ERROR frames to whoever asked for the
//! receipt.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use rustls::pki_types::ServerName;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, trace, warn, Instrument};
use uuid::Uuid;

use crate::frame::{Command, Frame, StompCodec};
use crate::tls::TlsSettings;
use crate::uri::BrokerEndpoint;
use crate::{
    ClientError, Connection, ConnectionFactory, Credentials, Destination, MessageConsumer,
    MessageProducer, ReceivedMessage, Session, SessionMode, TextMessage,
};

/// How long to wait for CONNECTED and for each requested RECEIPT.
pub const DEFAULT_RECEIPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Frame headers the client or broker own. Message properties with these
/// names are never put on the wire.
pub const RESERVED_HEADERS: &[&str] = &[
    "content-length",
    "content-type",
    "destination",
    "receipt",
    "receipt-id",
    "transaction",
    "persistent",
    "ack",
    "id",
    "subscription",
    "message-id",
    "selector",
    "login",
    "passcode",
    "host",
    "heart-beat",
    "accept-version",
];

pub fn is_reserved_header(name: &str) -> bool {
    RESERVED_HEADERS
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(name))
}

trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

type FrameStream = Framed<Box<dyn Transport>, StompCodec>;
type Delivery = Result<ReceivedMessage, ClientError>;

fn broker_error(frame: &Frame) -> ClientError {
    ClientError::Broker {
        message: frame.header("message").unwrap_or("unspecified").to_string(),
        details: String::from_utf8_lossy(&frame.body).into_owned(),
    }
}

#[derive(Clone)]
struct TlsTarget {
    connector: TlsConnector,
    server_name: String,
}

/// Opens STOMP connections to the broker named by a uri.
#[derive(Clone)]
pub struct StompConnectionFactory {
    endpoint: BrokerEndpoint,
    tls: Option<TlsTarget>,
    receipt_timeout: Duration,
}

impl StompConnectionFactory {
    /// Build a factory for `uri`. TLS uris read their certificates from the
    /// environment (see [`TlsSettings::from_env`]).
    pub fn from_uri(uri: &str) -> Result<Self, ClientError> {
        let endpoint = BrokerEndpoint::parse(uri)?;
        let tls = if endpoint.tls {
            let settings = TlsSettings::from_env()?;
            let server_name = settings
                .server_name
                .clone()
                .unwrap_or_else(|| endpoint.host.clone());
            Some(TlsTarget {
                connector: TlsConnector::from(settings.client_config()?),
                server_name,
            })
        } else {
            None
        };

        Ok(StompConnectionFactory {
            endpoint,
            tls,
            receipt_timeout: DEFAULT_RECEIPT_TIMEOUT,
        })
    }

    pub fn with_receipt_timeout(mut self, receipt_timeout: Duration) -> Self {
        self.receipt_timeout = receipt_timeout;
        self
    }

    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }

    async fn open_transport(&self) -> Result<Box<dyn Transport>, ClientError> {
        let tcp_stream = TcpStream::connect(self.endpoint.address()).await?;
        tcp_stream.set_nodelay(true)?;

        match &self.tls {
            None => Ok(Box::new(tcp_stream)),
            Some(tls) => {
                let domain = ServerName::try_from(tls.server_name.clone()).map_err(|e| {
                    ClientError::Tls(format!("invalid server name '{}': {e}", tls.server_name))
                })?;
                let tls_stream = tls.connector.connect(domain, tcp_stream).await?;
                debug!("TLS connection established");
                Ok(Box::new(tls_stream))
            }
        }
    }

    /// Open a connection and complete the CONNECT/CONNECTED handshake.
    pub async fn connect(
        &self,
        credentials: Option<&Credentials>,
        client_id: Option<&str>,
    ) -> Result<StompConnection, ClientError> {
        let address = self.endpoint.address();
        info!("Connecting to {address}");

        let transport = self.open_transport().await?;
        let mut framed = Framed::new(transport, StompCodec::new());

        let mut connect = Frame::new(Command::Connect)
            .with_header("accept-version", "1.2")
            .with_header("host", self.endpoint.host.as_str())
            .with_header("heart-beat", "0,0");
        if let Some(credentials) = credentials {
            connect = connect
                .with_header("login", credentials.username.as_str())
                .with_header("passcode", credentials.password.as_str());
        }
        if let Some(client_id) = client_id {
            connect = connect.with_header("client-id", client_id);
        }
        framed.send(connect).await?;

        let reply = match tokio::time::timeout(self.receipt_timeout, framed.next()).await {
            Ok(Some(frame)) => frame?,
            Ok(None) => {
                return Err(ClientError::ConnectionLost(
                    "broker closed the connection during the handshake".to_string(),
                ))
            }
            Err(_) => return Err(ClientError::Timeout("CONNECTED frame".to_string())),
        };

        match reply.command {
            Command::Connected => {
                debug!(
                    version = reply.header("version").unwrap_or("1.0"),
                    server = reply.header("server").unwrap_or("unknown"),
                    "STOMP session established with {address}"
                );
            }
            Command::Error => return Err(broker_error(&reply)),
            other => return Err(ClientError::UnexpectedFrame(other.to_string())),
        }

        let (sink, stream) = framed.split();
        Ok(StompConnection::spawn(sink, stream, self.receipt_timeout, address))
    }
}

#[async_trait]
impl ConnectionFactory for StompConnectionFactory {
    async fn create_connection(
        &self,
        credentials: Option<&Credentials>,
        client_id: Option<&str>,
    ) -> Result<Box<dyn Connection>, ClientError> {
        let connection = self.connect(credentials, client_id).await?;
        Ok(Box::new(connection))
    }
}

struct Shared {
    writer: Mutex<SplitSink<FrameStream, Frame>>,
    receipts: Mutex<HashMap<String, oneshot::Sender<Result<(), ClientError>>>>,
    subscriptions: Mutex<HashMap<String, mpsc::UnboundedSender<Delivery>>>,
    started: watch::Sender<bool>,
    closing: AtomicBool,
    closed: AtomicBool,
    receipt_timeout: Duration,
}

impl Shared {
    async fn write(&self, frame: Frame) -> Result<(), ClientError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::ConnectionLost("connection is closed".to_string()));
        }
        trace!(command = %frame.command, "Writing frame");
        self.writer.lock().await.send(frame).await?;
        Ok(())
    }

    /// Write a frame that asks for a receipt and wait for the broker's answer.
    async fn request(&self, mut frame: Frame) -> Result<(), ClientError> {
        let receipt = Uuid::new_v4().to_string();
        let command = frame.command;
        frame.set_header("receipt", receipt.clone());

        let (tx, rx) = oneshot::channel();
        self.receipts.lock().await.insert(receipt.clone(), tx);

        if let Err(e) = self.write(frame).await {
            self.receipts.lock().await.remove(&receipt);
            return Err(e);
        }

        match tokio::time::timeout(self.receipt_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ClientError::ConnectionLost(format!(
                "no receipt for {command}"
            ))),
            Err(_) => {
                self.receipts.lock().await.remove(&receipt);
                Err(ClientError::Timeout(format!("receipt for {command}")))
            }
        }
    }

    async fn dispatch(&self, frame: Frame) {
        match frame.command {
            Command::Message => {
                let Some(subscription) = frame.header("subscription").map(str::to_string) else {
                    warn!("Dropping MESSAGE frame without a subscription header");
                    return;
                };
                let subscriptions = self.subscriptions.lock().await;
                match subscriptions.get(&subscription) {
                    Some(tx) => {
                        let message = ReceivedMessage::new(frame.headers, frame.body);
                        if tx.send(Ok(message)).is_err() {
                            debug!("Consumer for {subscription} is gone, dropping message");
                        }
                    }
                    None => debug!("No consumer registered for {subscription}"),
                }
            }
            Command::Receipt => {
                if let Some(receipt) = frame.header("receipt-id") {
                    if let Some(tx) = self.receipts.lock().await.remove(receipt) {
                        let _ = tx.send(Ok(()));
                    }
                }
            }
            Command::Error => {
                let receipt = frame.header("receipt-id").map(str::to_string);
                let waiter = match &receipt {
                    Some(receipt) => self.receipts.lock().await.remove(receipt),
                    None => None,
                };
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(Err(broker_error(&frame)));
                    }
                    None => {
                        error!("{}", broker_error(&frame));
                        self.fail_all(|| broker_error(&frame)).await;
                    }
                }
            }
            other => debug!("Ignoring unexpected {other} frame"),
        }
    }

    /// Hand an error to every pending receipt and every consumer.
    async fn fail_all(&self, make_error: impl Fn() -> ClientError) {
        for (_, tx) in self.receipts.lock().await.drain() {
            let _ = tx.send(Err(make_error()));
        }
        for tx in self.subscriptions.lock().await.values() {
            let _ = tx.send(Err(make_error()));
        }
    }
}

async fn read_loop(mut stream: SplitStream<FrameStream>, shared: Arc<Shared>) {
    let reason = loop {
        match stream.next().await {
            Some(Ok(frame)) => shared.dispatch(frame).await,
            Some(Err(e)) => break e.to_string(),
            None => break "broker closed the connection".to_string(),
        }
    };

    shared.closed.store(true, Ordering::Release);
    if shared.closing.load(Ordering::Acquire) {
        debug!("Reader stopped: {reason}");
    } else {
        warn!("Connection lost: {reason}");
    }

    shared
        .fail_all(|| ClientError::ConnectionLost(reason.clone()))
        .await;
    // dropping the senders ends every consumer stream
    shared.subscriptions.lock().await.clear();
}

/// A live STOMP connection.
pub struct StompConnection {
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
}

impl StompConnection {
    fn spawn(
        sink: SplitSink<FrameStream, Frame>,
        stream: SplitStream<FrameStream>,
        receipt_timeout: Duration,
        address: String,
    ) -> Self {
        let (started, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            writer: Mutex::new(sink),
            receipts: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            started,
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            receipt_timeout,
        });

        let span = tracing::debug_span!("stomp.reader", %address);
        let reader = tokio::spawn(read_loop(stream, shared.clone()).instrument(span));

        StompConnection { shared, reader }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl Drop for StompConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl Connection for StompConnection {
    fn start(&self) {
        self.shared.started.send_replace(true);
    }

    async fn create_session(&self, mode: SessionMode) -> Result<Box<dyn Session>, ClientError> {
        let session = StompSession::open(self.shared.clone(), mode).await?;
        Ok(Box::new(session))
    }

    async fn close(&self) -> Result<(), ClientError> {
        if self.shared.closing.swap(true, Ordering::AcqRel) || self.is_closed() {
            return Ok(());
        }

        let outcome = self.shared.request(Frame::new(Command::Disconnect)).await;
        self.shared.closed.store(true, Ordering::Release);
        if let Err(e) = self.shared.writer.lock().await.close().await {
            debug!("Failed to shut down the socket cleanly: {e}");
        }
        self.reader.abort();

        match outcome {
            // the broker may hang up before the receipt is read
            Ok(()) | Err(ClientError::ConnectionLost(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

async fn begin_transaction(shared: &Shared) -> Result<String, ClientError> {
    let transaction = format!("tx-{}", Uuid::new_v4());
    shared
        .request(Frame::new(Command::Begin).with_header("transaction", transaction.as_str()))
        .await?;
    Ok(transaction)
}

struct StompSession {
    shared: Arc<Shared>,
    mode: SessionMode,
    transaction: Arc<Mutex<Option<String>>>,
    subscriptions: Mutex<Vec<String>>,
}

impl StompSession {
    async fn open(shared: Arc<Shared>, mode: SessionMode) -> Result<Self, ClientError> {
        let transaction = match mode {
            SessionMode::Transacted => Some(begin_transaction(&shared).await?),
            _ => None,
        };
        Ok(StompSession {
            shared,
            mode,
            transaction: Arc::new(Mutex::new(transaction)),
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    async fn subscribe(
        &self,
        destination: &Destination,
        selector: Option<&str>,
        durable_name: Option<&str>,
    ) -> Result<Box<dyn MessageConsumer>, ClientError> {
        let id = format!("sub-{}", Uuid::new_v4());
        let ack = match self.mode {
            SessionMode::AutoAcknowledge => "auto",
            SessionMode::ClientAcknowledge => "client",
            SessionMode::Transacted => "client-individual",
        };

        let mut frame = Frame::new(Command::Subscribe)
            .with_header("id", id.as_str())
            .with_header("destination", destination.stomp_path())
            .with_header("ack", ack);
        if let Some(selector) = selector {
            frame = frame.with_header("selector", selector);
        }
        if let Some(name) = durable_name {
            frame = frame
                .with_header("activemq.subscriptionName", name)
                .with_header("durable-subscription-name", name);
        }

        // register first so nothing delivered right after the receipt is lost
        let (tx, deliveries) = mpsc::unbounded_channel();
        self.shared
            .subscriptions
            .lock()
            .await
            .insert(id.clone(), tx);

        if let Err(e) = self.shared.request(frame).await {
            self.shared.subscriptions.lock().await.remove(&id);
            return Err(e);
        }
        debug!("Subscribed {id} to {destination}");
        self.subscriptions.lock().await.push(id.clone());

        Ok(Box::new(StompConsumer {
            shared: self.shared.clone(),
            id,
            mode: self.mode,
            transaction: self.transaction.clone(),
            deliveries,
            started: self.shared.started.subscribe(),
        }))
    }
}

#[async_trait]
impl Session for StompSession {
    fn mode(&self) -> SessionMode {
        self.mode
    }

    async fn create_producer(
        &self,
        destination: &Destination,
    ) -> Result<Box<dyn MessageProducer>, ClientError> {
        Ok(Box::new(StompProducer {
            shared: self.shared.clone(),
            destination: destination.clone(),
            transaction: self.transaction.clone(),
        }))
    }

    async fn create_consumer(
        &self,
        destination: &Destination,
        selector: Option<&str>,
    ) -> Result<Box<dyn MessageConsumer>, ClientError> {
        self.subscribe(destination, selector, None).await
    }

    async fn create_durable_subscriber(
        &self,
        topic: &Destination,
        name: &str,
        selector: Option<&str>,
    ) -> Result<Box<dyn MessageConsumer>, ClientError> {
        if !topic.is_topic() {
            return Err(ClientError::InvalidDestination(format!(
                "durable subscriptions need a topic, got {topic}"
            )));
        }
        self.subscribe(topic, selector, Some(name)).await
    }

    async fn commit(&self) -> Result<(), ClientError> {
        let mut transaction = self.transaction.lock().await;
        let current = transaction.take().ok_or(ClientError::NotTransacted)?;
        self.shared
            .request(Frame::new(Command::Commit).with_header("transaction", current))
            .await?;
        *transaction = Some(begin_transaction(&self.shared).await?);
        Ok(())
    }

    async fn close(&self) -> Result<(), ClientError> {
        let ids: Vec<String> = self.subscriptions.lock().await.drain(..).collect();
        for id in ids {
            self.shared.subscriptions.lock().await.remove(&id);
            let unsubscribe = Frame::new(Command::Unsubscribe).with_header("id", id.as_str());
            if let Err(e) = self.shared.write(unsubscribe).await {
                debug!("Failed to unsubscribe {id}: {e}");
            }
        }

        // an unfinished transaction is rolled back on close
        if let Some(transaction) = self.transaction.lock().await.take() {
            self.shared
                .write(Frame::new(Command::Abort).with_header("transaction", transaction))
                .await?;
        }
        Ok(())
    }
}

struct StompProducer {
    shared: Arc<Shared>,
    destination: Destination,
    transaction: Arc<Mutex<Option<String>>>,
}

#[async_trait]
impl MessageProducer for StompProducer {
    async fn send(&self, message: &TextMessage) -> Result<(), ClientError> {
        let mut frame = Frame::new(Command::Send)
            .with_header("destination", self.destination.stomp_path())
            .with_header("content-type", "text/plain")
            .with_header("persistent", "true");
        for (name, value) in message.properties() {
            if is_reserved_header(name) {
                warn!("Not sending property '{name}', it is a reserved frame header");
                continue;
            }
            frame = frame.with_header(name, value.to_string());
        }
        if let Some(transaction) = self.transaction.lock().await.as_ref() {
            frame = frame.with_header("transaction", transaction.as_str());
        }
        frame = frame.with_body(message.text().to_owned());

        self.shared.request(frame).await
    }
}

struct StompConsumer {
    shared: Arc<Shared>,
    id: String,
    mode: SessionMode,
    transaction: Arc<Mutex<Option<String>>>,
    deliveries: mpsc::UnboundedReceiver<Delivery>,
    started: watch::Receiver<bool>,
}

impl StompConsumer {
    async fn ack(&self, message: &ReceivedMessage) -> Result<(), ClientError> {
        let ack_id = message
            .ack_id()
            .or_else(|| message.message_id())
            .ok_or_else(|| ClientError::UnexpectedFrame("MESSAGE without an ack id".to_string()))?;

        let mut frame = Frame::new(Command::Ack)
            .with_header("id", ack_id)
            .with_header("subscription", self.id.as_str());
        if let Some(message_id) = message.message_id() {
            frame = frame.with_header("message-id", message_id);
        }
        if self.mode == SessionMode::Transacted {
            if let Some(transaction) = self.transaction.lock().await.as_ref() {
                frame = frame.with_header("transaction", transaction.as_str());
            }
        }
        self.shared.write(frame).await
    }
}

#[async_trait]
impl MessageConsumer for StompConsumer {
    async fn receive(&mut self) -> Result<ReceivedMessage, ClientError> {
        self.started
            .wait_for(|started| *started)
            .await
            .map(|_| ())
            .map_err(|_| ClientError::ConnectionLost("connection dropped".to_string()))?;

        let message = match self.deliveries.recv().await {
            Some(delivery) => delivery?,
            None => {
                return Err(ClientError::ConnectionLost(format!(
                    "subscription {} closed",
                    self.id
                )))
            }
        };

        // a receive inside a transacted session enlists the message in the transaction
        if self.mode == SessionMode::Transacted {
            self.ack(&message).await?;
        }
        Ok(message)
    }

    async fn acknowledge(&self, message: &ReceivedMessage) -> Result<(), ClientError> {
        match self.mode {
            SessionMode::ClientAcknowledge => self.ack(message).await,
            SessionMode::AutoAcknowledge | SessionMode::Transacted => Ok(()),
        }
    }
}
