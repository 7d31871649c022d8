use harness_common::fake::{BrokerEvent, FakeBroker};
use harness_common::{BrokerTarget, HarnessContext, HarnessError, WorkerSpec};
use harness_consumer::{bad_consume_no_ack, bad_consume_no_commit_tx, bad_consume_pending, consume};
use std::sync::Arc;
use std::time::Duration;
use stomp_client::{Destination, SessionMode};
use tokio::time::Instant;

fn context(broker: &FakeBroker) -> HarnessContext {
    HarnessContext::new(Arc::new(broker.clone()), None)
}

fn target(destination: Destination) -> BrokerTarget {
    BrokerTarget {
        uri: "tcp://localhost:61613".to_string(),
        destination,
    }
}

fn jobs() -> BrokerTarget {
    target(Destination::Queue("jobs".to_string()))
}

fn count_acks(broker: &FakeBroker) -> usize {
    broker.count(|event| matches!(event, BrokerEvent::Acknowledged { .. }))
}

fn count_received(broker: &FakeBroker) -> usize {
    broker.count(|event| matches!(event, BrokerEvent::Received { .. }))
}

fn count_closed(broker: &FakeBroker) -> usize {
    broker.count(|event| matches!(event, BrokerEvent::ConnectionClosed { .. }))
}

fn subscriptions(broker: &FakeBroker) -> Vec<(Destination, Option<String>, Option<String>)> {
    broker
        .events()
        .into_iter()
        .filter_map(|event| match event {
            BrokerEvent::Subscribed {
                destination,
                selector,
                durable_name,
                ..
            } => Some((destination, selector, durable_name)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn every_message_is_acked_before_the_next_receive() {
    let broker = FakeBroker::new();
    let ids: Vec<String> = (0..3).map(|i| broker.enqueue(&format!("m{i}"))).collect();

    let completed = consume(&context(&broker), &jobs(), &WorkerSpec::default())
        .await
        .unwrap();
    assert!(completed);

    let flow: Vec<BrokerEvent> = broker
        .events()
        .into_iter()
        .filter(|event| {
            matches!(
                event,
                BrokerEvent::Received { .. } | BrokerEvent::Acknowledged { .. }
            )
        })
        .collect();

    let expected: Vec<BrokerEvent> = ids
        .iter()
        .flat_map(|id| {
            [
                BrokerEvent::Received {
                    connection: 0,
                    message_id: id.clone(),
                },
                BrokerEvent::Acknowledged {
                    connection: 0,
                    message_id: id.clone(),
                },
            ]
        })
        .collect();
    assert_eq!(flow, expected);

    let events = broker.events();
    assert!(events.contains(&BrokerEvent::SessionCreated {
        connection: 0,
        mode: SessionMode::ClientAcknowledge,
    }));
    assert!(events.contains(&BrokerEvent::Started { connection: 0 }));
    assert_eq!(count_closed(&broker), 1);
}

#[tokio::test]
async fn one_connection_per_worker() {
    let broker = FakeBroker::new();
    for i in 0..6 {
        broker.enqueue(&format!("m{i}"));
    }

    let spec = WorkerSpec {
        workers: 3,
        ..Default::default()
    };
    assert!(consume(&context(&broker), &jobs(), &spec).await.unwrap());

    assert_eq!(
        broker.count(|event| matches!(event, BrokerEvent::Connected { .. })),
        3
    );
    assert_eq!(count_received(&broker), 6);
    assert_eq!(count_acks(&broker), 6);
    assert_eq!(count_closed(&broker), 3);
}

#[tokio::test]
async fn client_id_on_a_topic_makes_a_durable_subscription() {
    let broker = FakeBroker::new();
    let spec = WorkerSpec {
        workers: 1,
        client_id: Some("auditor".to_string()),
        selector: Some("color = 'red'".to_string()),
    };
    let topic = target(Destination::Topic("events".to_string()));

    assert!(consume(&context(&broker), &topic, &spec).await.unwrap());

    assert_eq!(
        subscriptions(&broker),
        vec![(
            Destination::Topic("events".to_string()),
            Some("color = 'red'".to_string()),
            Some("auditorsubscription".to_string()),
        )]
    );
    assert!(broker.events().contains(&BrokerEvent::Connected {
        connection: 0,
        username: None,
        client_id: Some("auditor".to_string()),
    }));
}

#[tokio::test]
async fn durable_subscription_drops_a_trivial_selector() {
    let topic = target(Destination::Topic("events".to_string()));
    for selector in [None, Some(" x ".to_string()), Some("   ".to_string())] {
        let broker = FakeBroker::new();
        let spec = WorkerSpec {
            workers: 1,
            client_id: Some("auditor".to_string()),
            selector,
        };

        assert!(consume(&context(&broker), &topic, &spec).await.unwrap());

        assert_eq!(
            subscriptions(&broker),
            vec![(
                Destination::Topic("events".to_string()),
                None,
                Some("auditorsubscription".to_string()),
            )]
        );
    }
}

#[tokio::test]
async fn client_id_on_a_queue_makes_a_plain_consumer() {
    let broker = FakeBroker::new();
    let spec = WorkerSpec {
        workers: 1,
        client_id: Some("auditor".to_string()),
        selector: Some(" x ".to_string()),
    };

    assert!(consume(&context(&broker), &jobs(), &spec).await.unwrap());

    assert_eq!(
        subscriptions(&broker),
        vec![(Destination::Queue("jobs".to_string()), None, None)]
    );
}

#[tokio::test(start_paused = true)]
async fn consume_gives_up_waiting_after_the_ceiling() {
    let broker = FakeBroker::new();
    broker.hold_when_empty();

    let started = Instant::now();
    let completed = consume(&context(&broker), &jobs(), &WorkerSpec::default())
        .await
        .unwrap();

    assert!(!completed);
    assert_eq!(started.elapsed(), Duration::from_secs(60 * 60));
}

#[tokio::test]
async fn worker_count_is_validated() {
    let broker = FakeBroker::new();
    let spec = WorkerSpec {
        workers: 0,
        ..Default::default()
    };
    let err = consume(&context(&broker), &jobs(), &spec).await.unwrap_err();
    assert!(matches!(err, HarnessError::Configuration(_)));
    assert!(broker.events().is_empty());
}

#[tokio::test]
async fn worker_that_cannot_connect_still_counts_down() {
    let broker = FakeBroker::new();
    broker.refuse_connections();
    assert!(consume(&context(&broker), &jobs(), &WorkerSpec::default())
        .await
        .unwrap());
}

#[tokio::test]
async fn no_ack_consumer_never_acknowledges() {
    let broker = FakeBroker::new();
    for i in 0..3 {
        broker.enqueue(&format!("m{i}"));
    }
    broker.enqueue_bytes(&[0, 1, 2]);

    bad_consume_no_ack(&context(&broker), &jobs()).await.unwrap();

    assert_eq!(count_received(&broker), 4);
    assert_eq!(count_acks(&broker), 0);
    assert_eq!(count_closed(&broker), 0);
}

#[tokio::test(start_paused = true)]
async fn pending_consumer_stalls_after_the_first_message() {
    let broker = FakeBroker::new();
    broker.enqueue("first");
    broker.enqueue("second");

    let ctx = context(&broker);
    let outcome =
        tokio::time::timeout(Duration::from_secs(600), bad_consume_pending(&ctx, &jobs())).await;

    assert!(outcome.is_err(), "pending consumer returned");
    assert_eq!(count_received(&broker), 1);
    assert_eq!(count_acks(&broker), 0);
}

#[tokio::test]
async fn transacted_consumer_never_commits() {
    let broker = FakeBroker::new();
    broker.enqueue("a");
    broker.enqueue("b");

    bad_consume_no_commit_tx(&context(&broker), &jobs())
        .await
        .unwrap();

    let events = broker.events();
    assert!(events.contains(&BrokerEvent::SessionCreated {
        connection: 0,
        mode: SessionMode::Transacted,
    }));
    assert_eq!(count_received(&broker), 2);
    assert_eq!(
        broker.count(|event| matches!(event, BrokerEvent::Committed { .. })),
        0
    );
    assert_eq!(count_closed(&broker), 0);
}

#[tokio::test]
async fn bad_consumer_setup_failure_is_reported() {
    let broker = FakeBroker::new();
    broker.refuse_connections();
    let err = bad_consume_no_ack(&context(&broker), &jobs())
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::Protocol(_)));
}
