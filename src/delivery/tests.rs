use super::*;

use std::sync::Mutex;

use async_trait::async_trait;

use crate::bus::{Acknowledger, BusError, Message};
use crate::dlq::{DeadLetterInfo, RETRY_COUNT_HEADER};

#[derive(Debug, Clone, PartialEq)]
enum Settlement {
    Acked,
    Rejected(Message),
}

#[derive(Clone, Default)]
struct RecordingAcker {
    settlements: Arc<Mutex<Vec<Settlement>>>,
    fail: bool,
}

impl RecordingAcker {
    fn settlements(&self) -> Vec<Settlement> {
        self.settlements.lock().unwrap().clone()
    }
}

#[async_trait]
impl Acknowledger for RecordingAcker {
    async fn ack(&self) -> crate::bus::Result<()> {
        if self.fail {
            return Err(BusError::Ack("channel closed".to_string()));
        }
        self.settlements.lock().unwrap().push(Settlement::Acked);
        Ok(())
    }

    async fn reject(&self, message: Message) -> crate::bus::Result<()> {
        if self.fail {
            return Err(BusError::Ack("channel closed".to_string()));
        }
        self.settlements
            .lock()
            .unwrap()
            .push(Settlement::Rejected(message));
        Ok(())
    }
}

fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(4))
}

fn delivery(acker: &RecordingAcker) -> Delivery {
    Delivery::new(
        Message::new("trip", "trip-created", b"{}".to_vec()),
        Box::new(acker.clone()),
    )
}

/// Handler failing its first `failures` invocations.
fn flaky(failures: u32, calls: Arc<AtomicU32>) -> impl MessageHandler {
    move |_message: Arc<Message>| {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            if n <= failures {
                Err(HandlerError::failed(std::io::Error::other(format!(
                    "transient failure {}",
                    n
                ))))
            } else {
                Ok(())
            }
        }
    }
}

#[tokio::test]
async fn test_success_first_try_acks_once() {
    let acker = RecordingAcker::default();
    let calls = Arc::new(AtomicU32::new(0));
    let stats = ConsumerStats::default();

    let outcome = process_delivery(
        "q",
        delivery(&acker),
        &flaky(0, calls.clone()),
        fast_policy(3),
        &stats,
    )
    .await;

    assert_eq!(outcome, DeliveryOutcome::Acked { attempts: 1 });
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(acker.settlements(), vec![Settlement::Acked]);
}

#[tokio::test]
async fn test_success_on_last_attempt_acks_without_dead_letter() {
    let acker = RecordingAcker::default();
    let calls = Arc::new(AtomicU32::new(0));
    let stats = ConsumerStats::default();

    let outcome = process_delivery(
        "q",
        delivery(&acker),
        &flaky(2, calls.clone()),
        fast_policy(3),
        &stats,
    )
    .await;

    assert_eq!(outcome, DeliveryOutcome::Acked { attempts: 3 });
    assert_eq!(acker.settlements(), vec![Settlement::Acked]);

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.acked, 1);
    assert_eq!(snapshot.dead_lettered, 0);
    assert_eq!(snapshot.handler_failures, 2);
}

#[tokio::test]
async fn test_always_failing_handler_is_dead_lettered_after_max_attempts() {
    let acker = RecordingAcker::default();
    let calls = Arc::new(AtomicU32::new(0));
    let stats = ConsumerStats::default();

    let outcome = process_delivery(
        "q",
        delivery(&acker),
        &flaky(u32::MAX, calls.clone()),
        fast_policy(3),
        &stats,
    )
    .await;

    assert_eq!(outcome, DeliveryOutcome::DeadLettered { attempts: 3 });
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let settlements = acker.settlements();
    assert_eq!(settlements.len(), 1);
    let Settlement::Rejected(rejected) = &settlements[0] else {
        panic!("expected a rejection, got {:?}", settlements);
    };
    assert_eq!(rejected.body, b"{}".to_vec());

    let info = DeadLetterInfo::from_headers(&rejected.headers).unwrap();
    assert_eq!(info.retry_count, 3);
    assert_eq!(info.origin_exchange, "trip");
    assert_eq!(info.original_routing_key, "trip-created");
    assert!(info.reason.contains("transient failure 3"), "{}", info.reason);

    assert_eq!(stats.snapshot().dead_lettered, 1);
}

#[tokio::test]
async fn test_single_attempt_policy_never_retries() {
    let acker = RecordingAcker::default();
    let calls = Arc::new(AtomicU32::new(0));
    let stats = ConsumerStats::default();

    let outcome = process_delivery(
        "q",
        delivery(&acker),
        &flaky(u32::MAX, calls.clone()),
        RetryPolicy::no_retry(),
        &stats,
    )
    .await;

    assert_eq!(outcome, DeliveryOutcome::DeadLettered { attempts: 1 });
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let Settlement::Rejected(rejected) = &acker.settlements()[0] else {
        panic!("expected a rejection");
    };
    assert_eq!(
        rejected.header(RETRY_COUNT_HEADER).and_then(|v| v.as_int()),
        Some(1)
    );
}

#[tokio::test]
async fn test_malformed_payload_uses_retry_budget() {
    let acker = RecordingAcker::default();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let handler = move |message: Arc<Message>| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move {
            let _: serde_json::Value = serde_json::from_slice(&message.body[..1])?;
            Ok::<(), HandlerError>(())
        }
    };
    let stats = ConsumerStats::default();

    let outcome = process_delivery("q", delivery(&acker), &handler, fast_policy(2), &stats).await;

    assert_eq!(outcome, DeliveryOutcome::DeadLettered { attempts: 2 });
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_settlement_failure_is_not_counted() {
    let acker = RecordingAcker {
        fail: true,
        ..Default::default()
    };
    let calls = Arc::new(AtomicU32::new(0));
    let stats = ConsumerStats::default();

    let outcome = process_delivery(
        "q",
        delivery(&acker),
        &flaky(0, calls),
        fast_policy(3),
        &stats,
    )
    .await;

    assert_eq!(outcome, DeliveryOutcome::Acked { attempts: 1 });
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.acked, 0);
    assert_eq!(snapshot.outstanding, 0);
}

#[tokio::test]
async fn test_stats_track_outstanding() {
    let acker = RecordingAcker::default();
    let stats = ConsumerStats::default();

    for _ in 0..3 {
        let calls = Arc::new(AtomicU32::new(0));
        process_delivery("q", delivery(&acker), &flaky(0, calls), fast_policy(1), &stats).await;
    }

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.delivered, 3);
    assert_eq!(snapshot.acked, 3);
    assert_eq!(snapshot.outstanding, 0);
    assert_eq!(snapshot.max_outstanding, 1);
}
