use harness_common::fake::{BrokerEvent, FakeBroker};
use harness_common::HarnessContext;
use harness_producer::sender::{SenderArgs, SenderController, SenderMessage, LOREM_IPSUM};
use ractor::Actor;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use stomp_client::Destination;

#[tokio::test]
async fn senders_loop_per_queue_until_stopped() {
    let broker = FakeBroker::new();
    let args = SenderArgs {
        ctx: HarnessContext::new(Arc::new(broker.clone()), None),
        threads: 2,
        prefix: "TEST".to_string(),
    };

    let (controller, handle) = Actor::spawn(None, SenderController, args)
        .await
        .expect("Expected sender controller to start");

    // a second start while running changes nothing
    controller.send_message(SenderMessage::Start).unwrap();

    let mut sent = 0;
    for _ in 0..500 {
        sent = controller
            .call(SenderMessage::SentCount, Some(Duration::from_secs(5)))
            .await
            .unwrap()
            .unwrap();
        if sent >= 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert!(sent >= 4, "senders made no progress");

    controller.stop(None);
    handle.await.unwrap();

    let events = broker.events();
    let queues: HashSet<Destination> = events
        .iter()
        .filter_map(|event| match event {
            BrokerEvent::Sent {
                destination,
                message,
                ..
            } => {
                assert_eq!(message.text(), LOREM_IPSUM);
                Some(destination.clone())
            }
            _ => None,
        })
        .collect();
    assert!(queues.is_subset(&HashSet::from([
        Destination::Queue("TEST1".to_string()),
        Destination::Queue("TEST2".to_string()),
    ])));

    let connections = events
        .iter()
        .filter(|event| matches!(event, BrokerEvent::Connected { .. }))
        .count();
    let closed = events
        .iter()
        .filter(|event| matches!(event, BrokerEvent::ConnectionClosed { .. }))
        .count();
    assert_eq!(connections, 2);
    assert_eq!(closed, 2);
}

#[tokio::test]
async fn too_many_senders_fail_to_start() {
    let broker = FakeBroker::new();
    let args = SenderArgs {
        ctx: HarnessContext::new(Arc::new(broker.clone()), None),
        threads: 0,
        prefix: "TEST".to_string(),
    };

    assert!(Actor::spawn(None, SenderController, args).await.is_err());
    assert!(broker.events().is_empty());
}
