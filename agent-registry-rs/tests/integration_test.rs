use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use agent_registry::{BrokerError, MessageBroker, Priority};
use error_handling_rs::ErrorKind;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_producers_single_consumer() {
    let broker = Arc::new(MessageBroker::new());
    broker.register("aggregator").await.unwrap();

    let producers = 8;
    let per_producer = 50;
    let mut handles = Vec::new();
    for p in 0..producers {
        let broker = broker.clone();
        handles.push(tokio::spawn(async move {
            let from = format!("producer-{p}");
            for i in 0..per_producer {
                broker
                    .send(&from, "aggregator", format!("{i}"), HashMap::new(), Priority::Normal)
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let mut received = Vec::new();
    while broker.wait("aggregator", Duration::from_millis(50)).await.unwrap() {
        received.extend(broker.receive("aggregator", 64).await.unwrap());
    }
    assert_eq!(received.len(), producers * per_producer);

    // Per-producer FIFO survives interleaving.
    for p in 0..producers {
        let from = format!("producer-{p}");
        let sequence: Vec<usize> = received
            .iter()
            .filter(|m| m.from == from)
            .map(|m| m.content.parse().unwrap())
            .collect();
        assert_eq!(sequence, (0..per_producer).collect::<Vec<_>>());
    }
}

#[tokio::test]
async fn test_high_priority_overtakes_backlog() {
    let broker = MessageBroker::new();
    broker.register("implementer").await.unwrap();

    for i in 0..20 {
        broker
            .send("user", "implementer", format!("chore-{i}"), HashMap::new(), Priority::Low)
            .await
            .unwrap();
    }
    broker
        .send("improvement_engine", "implementer", "urgent", HashMap::new(), Priority::High)
        .await
        .unwrap();

    let next = broker.receive("implementer", 1).await.unwrap();
    assert_eq!(next[0].content, "urgent");
    assert_eq!(next[0].priority, Priority::High);
}

#[tokio::test]
async fn test_unknown_recipient_maps_to_error_kind() {
    let broker = MessageBroker::new();
    let err = broker
        .send("a", "nobody", "hi", HashMap::new(), Priority::Normal)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::UnknownRecipient(_)));

    let shared: error_handling_rs::Error = err.into();
    assert_eq!(shared.kind, ErrorKind::UnknownRecipient);
}
