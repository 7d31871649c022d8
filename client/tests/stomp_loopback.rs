use futures::{SinkExt, StreamExt};
use stomp_client::frame::{Command, Frame, StompCodec};
use stomp_client::{
    ClientError, ConnectionFactory, Credentials, Destination, SessionMode, StompConnectionFactory,
    TextMessage,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

type ServerSide = Framed<TcpStream, StompCodec>;

async fn listen() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, format!("tcp://127.0.0.1:{port}"))
}

async fn accept(listener: &TcpListener) -> ServerSide {
    let (stream, _) = listener.accept().await.unwrap();
    Framed::new(stream, StompCodec::new())
}

async fn expect(server: &mut ServerSide, command: Command) -> Frame {
    let frame = server
        .next()
        .await
        .expect("client hung up")
        .expect("bad frame from client");
    assert_eq!(frame.command, command, "unexpected frame {frame:?}");
    frame
}

async fn send_receipt(server: &mut ServerSide, request: &Frame) {
    let receipt = request.header("receipt").expect("no receipt requested");
    server
        .send(Frame::new(Command::Receipt).with_header("receipt-id", receipt))
        .await
        .unwrap();
}

async fn handshake(server: &mut ServerSide) -> Frame {
    let connect = expect(server, Command::Connect).await;
    server
        .send(
            Frame::new(Command::Connected)
                .with_header("version", "1.2")
                .with_header("server", "loopback"),
        )
        .await
        .unwrap();
    connect
}

async fn finish(server: &mut ServerSide) {
    let disconnect = expect(server, Command::Disconnect).await;
    send_receipt(server, &disconnect).await;
}

#[tokio::test]
async fn send_waits_for_broker_receipt() {
    let (listener, uri) = listen().await;

    let broker: JoinHandle<(Frame, Frame)> = tokio::spawn(async move {
        let mut server = accept(&listener).await;
        let connect = handshake(&mut server).await;
        let send = expect(&mut server, Command::Send).await;
        send_receipt(&mut server, &send).await;
        finish(&mut server).await;
        (connect, send)
    });

    let factory = StompConnectionFactory::from_uri(&uri).unwrap();
    let credentials = Credentials::new("admin", "secret");
    let connection = factory
        .create_connection(Some(&credentials), Some("harness-1"))
        .await
        .unwrap();
    let session = connection
        .create_session(SessionMode::AutoAcknowledge)
        .await
        .unwrap();
    let producer = session
        .create_producer(&Destination::Queue("orders".into()))
        .await
        .unwrap();

    let mut message = TextMessage::new("hello");
    message.set_long_property("AMQ_SCHEDULED_DELAY", 500);
    message.set_string_property("region", "eu");
    producer.send(&message).await.unwrap();
    connection.close().await.unwrap();

    let (connect, send) = broker.await.unwrap();
    assert_eq!(connect.header("login"), Some("admin"));
    assert_eq!(connect.header("passcode"), Some("secret"));
    assert_eq!(connect.header("client-id"), Some("harness-1"));
    assert_eq!(connect.header("accept-version"), Some("1.2"));

    assert_eq!(send.header("destination"), Some("/queue/orders"));
    assert_eq!(send.header("persistent"), Some("true"));
    assert_eq!(send.header("AMQ_SCHEDULED_DELAY"), Some("500"));
    assert_eq!(send.header("region"), Some("eu"));
    assert_eq!(&send.body[..], b"hello");
}

#[tokio::test]
async fn reserved_header_properties_stay_off_the_wire() {
    let (listener, uri) = listen().await;

    let broker: JoinHandle<Frame> = tokio::spawn(async move {
        let mut server = accept(&listener).await;
        handshake(&mut server).await;
        let send = expect(&mut server, Command::Send).await;
        send_receipt(&mut server, &send).await;
        finish(&mut server).await;
        send
    });

    let factory = StompConnectionFactory::from_uri(&uri).unwrap();
    let connection = factory.create_connection(None, None).await.unwrap();
    let session = connection
        .create_session(SessionMode::AutoAcknowledge)
        .await
        .unwrap();
    let producer = session
        .create_producer(&Destination::Queue("orders".into()))
        .await
        .unwrap();

    let mut message = TextMessage::new("hello");
    message.set_string_property("content-length", "1");
    message.set_string_property("transaction", "tx-forged");
    message.set_string_property("tenant", "acme");
    producer.send(&message).await.unwrap();
    connection.close().await.unwrap();

    let send = broker.await.unwrap();
    assert_eq!(&send.body[..], b"hello");
    assert_eq!(send.header("content-length"), None);
    assert_eq!(send.header("transaction"), None);
    assert_eq!(send.header("tenant"), Some("acme"));
}

#[tokio::test]
async fn client_ack_subscription_delivers_and_acknowledges() {
    let (listener, uri) = listen().await;

    let broker: JoinHandle<(Frame, Frame)> = tokio::spawn(async move {
        let mut server = accept(&listener).await;
        handshake(&mut server).await;
        let subscribe = expect(&mut server, Command::Subscribe).await;
        send_receipt(&mut server, &subscribe).await;

        let subscription = subscribe.header("id").unwrap().to_string();
        server
            .send(
                Frame::new(Command::Message)
                    .with_header("subscription", subscription)
                    .with_header("message-id", "ID:m-1")
                    .with_header("ack", "ack-1")
                    .with_header("content-type", "text/plain")
                    .with_body("payload"),
            )
            .await
            .unwrap();

        let ack = expect(&mut server, Command::Ack).await;
        finish(&mut server).await;
        (subscribe, ack)
    });

    let factory = StompConnectionFactory::from_uri(&uri).unwrap();
    let connection = factory.create_connection(None, None).await.unwrap();
    let session = connection
        .create_session(SessionMode::ClientAcknowledge)
        .await
        .unwrap();
    let mut consumer = session
        .create_consumer(&Destination::Queue("work".into()), Some("priority > 4"))
        .await
        .unwrap();
    connection.start();

    let message = consumer.receive().await.unwrap();
    assert_eq!(message.text().unwrap(), "payload");
    assert_eq!(message.message_id(), Some("ID:m-1"));
    consumer.acknowledge(&message).await.unwrap();
    connection.close().await.unwrap();

    let (subscribe, ack) = broker.await.unwrap();
    assert_eq!(subscribe.header("destination"), Some("/queue/work"));
    assert_eq!(subscribe.header("ack"), Some("client"));
    assert_eq!(subscribe.header("selector"), Some("priority > 4"));
    assert_eq!(ack.header("id"), Some("ack-1"));
}

#[tokio::test]
async fn durable_subscription_carries_its_name() {
    let (listener, uri) = listen().await;

    let broker: JoinHandle<(Frame, Frame)> = tokio::spawn(async move {
        let mut server = accept(&listener).await;
        let connect = handshake(&mut server).await;
        let subscribe = expect(&mut server, Command::Subscribe).await;
        send_receipt(&mut server, &subscribe).await;
        finish(&mut server).await;
        (connect, subscribe)
    });

    let factory = StompConnectionFactory::from_uri(&uri).unwrap();
    let connection = factory
        .create_connection(None, Some("auditor"))
        .await
        .unwrap();
    let session = connection
        .create_session(SessionMode::AutoAcknowledge)
        .await
        .unwrap();
    session
        .create_durable_subscriber(&Destination::Topic("events".into()), "auditorsubscription", None)
        .await
        .unwrap();
    connection.close().await.unwrap();

    let (connect, subscribe) = broker.await.unwrap();
    assert_eq!(connect.header("client-id"), Some("auditor"));
    assert_eq!(subscribe.header("destination"), Some("/topic/events"));
    assert_eq!(
        subscribe.header("activemq.subscriptionName"),
        Some("auditorsubscription")
    );
    assert_eq!(subscribe.header("selector"), None);
}

#[tokio::test]
async fn durable_subscription_on_a_queue_is_rejected() {
    let (listener, uri) = listen().await;

    let broker = tokio::spawn(async move {
        let mut server = accept(&listener).await;
        handshake(&mut server).await;
        finish(&mut server).await;
    });

    let factory = StompConnectionFactory::from_uri(&uri).unwrap();
    let connection = factory.create_connection(None, Some("c")).await.unwrap();
    let session = connection
        .create_session(SessionMode::AutoAcknowledge)
        .await
        .unwrap();
    let err = session
        .create_durable_subscriber(&Destination::Queue("jobs".into()), "csubscription", None)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, ClientError::InvalidDestination(_)));

    connection.close().await.unwrap();
    broker.await.unwrap();
}

#[tokio::test]
async fn transacted_session_begins_and_commits() {
    let (listener, uri) = listen().await;

    let broker: JoinHandle<Vec<Frame>> = tokio::spawn(async move {
        let mut server = accept(&listener).await;
        handshake(&mut server).await;
        let mut seen = Vec::new();

        let begin = expect(&mut server, Command::Begin).await;
        send_receipt(&mut server, &begin).await;
        let send = expect(&mut server, Command::Send).await;
        send_receipt(&mut server, &send).await;
        let commit = expect(&mut server, Command::Commit).await;
        send_receipt(&mut server, &commit).await;
        let next_begin = expect(&mut server, Command::Begin).await;
        send_receipt(&mut server, &next_begin).await;

        seen.extend([begin, send, commit, next_begin]);
        finish(&mut server).await;
        seen
    });

    let factory = StompConnectionFactory::from_uri(&uri).unwrap();
    let connection = factory.create_connection(None, None).await.unwrap();
    let session = connection
        .create_session(SessionMode::Transacted)
        .await
        .unwrap();
    let producer = session
        .create_producer(&Destination::Topic("prices".into()))
        .await
        .unwrap();
    producer.send(&TextMessage::new("tick")).await.unwrap();
    session.commit().await.unwrap();
    connection.close().await.unwrap();

    let seen = broker.await.unwrap();
    let first_tx = seen[0].header("transaction").unwrap();
    assert_eq!(seen[1].header("transaction"), Some(first_tx));
    assert_eq!(seen[2].header("transaction"), Some(first_tx));
    assert_ne!(seen[3].header("transaction"), Some(first_tx));
}

#[tokio::test]
async fn refused_login_surfaces_the_broker_error() {
    let (listener, uri) = listen().await;

    let broker = tokio::spawn(async move {
        let mut server = accept(&listener).await;
        expect(&mut server, Command::Connect).await;
        server
            .send(
                Frame::new(Command::Error)
                    .with_header("message", "User name [bob] or password is invalid.")
                    .with_body("Authentication failed"),
            )
            .await
            .unwrap();
    });

    let factory = StompConnectionFactory::from_uri(&uri).unwrap();
    let err = factory
        .create_connection(Some(&Credentials::new("bob", "nope")), None)
        .await
        .err()
        .unwrap();
    match err {
        ClientError::Broker { message, details } => {
            assert!(message.contains("password is invalid"));
            assert_eq!(details, "Authentication failed");
        }
        other => panic!("expected a broker error, got {other:?}"),
    }
    broker.await.unwrap();
}

#[tokio::test]
async fn broker_hangup_fails_pending_receive() {
    let (listener, uri) = listen().await;

    let broker = tokio::spawn(async move {
        let mut server = accept(&listener).await;
        handshake(&mut server).await;
        let subscribe = expect(&mut server, Command::Subscribe).await;
        send_receipt(&mut server, &subscribe).await;
        drop(server);
    });

    let factory = StompConnectionFactory::from_uri(&uri).unwrap();
    let connection = factory.create_connection(None, None).await.unwrap();
    let session = connection
        .create_session(SessionMode::AutoAcknowledge)
        .await
        .unwrap();
    let mut consumer = session
        .create_consumer(&Destination::Queue("gone".into()), None)
        .await
        .unwrap();
    connection.start();
    broker.await.unwrap();

    let err = consumer.receive().await.err().unwrap();
    assert!(matches!(err, ClientError::ConnectionLost(_)));
}
