use bot_resilience::queue::{EnqueueOutcome, PriorityMessageQueue};
use bot_resilience::{Error, InboundMessage, Priority, ResilienceConfig, Responder, ResponseNotice};
use std::sync::Arc;
use tokio::sync::mpsc;

fn queue(max: usize) -> PriorityMessageQueue {
    PriorityMessageQueue::new(ResilienceConfig::new().with_max_queue_size(max).into_shared())
}

fn channel() -> (Arc<dyn Responder>, mpsc::UnboundedReceiver<ResponseNotice>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(tx), rx)
}

fn msg(payload: &str, priority: Priority) -> InboundMessage {
    InboundMessage::new("user", "guild", payload, priority)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<ResponseNotice>) -> Vec<ResponseNotice> {
    let mut out = Vec::new();
    while let Ok(n) = rx.try_recv() {
        out.push(n);
    }
    out
}

#[tokio::test]
async fn test_processing_order_is_priority_major() {
    let q = queue(10);
    let (r, _rx) = channel();
    for (payload, p) in [
        ("low", Priority::Low),
        ("high", Priority::High),
        ("medium", Priority::Medium),
    ] {
        q.enqueue(msg(payload, p), r.clone()).await;
    }

    let mut order = Vec::new();
    q.process(|m| {
        order.push(m.payload.clone());
        async { Ok(String::from("done")) }
    })
    .await;
    assert_eq!(order, ["high", "medium", "low"]);
}

#[tokio::test]
async fn test_full_queue_of_low_evicts_oldest_for_high() {
    let q = queue(100);
    let mut low_receivers = Vec::new();
    for i in 0..100 {
        let (r, rx) = channel();
        let outcome = q.enqueue(msg(&format!("low-{i}"), Priority::Low), r).await;
        assert!(outcome.is_queued());
        low_receivers.push(rx);
    }
    assert_eq!(q.len(), 100);

    let (r, mut high_rx) = channel();
    let outcome = q.enqueue(msg("urgent", Priority::High), r).await;
    assert!(matches!(outcome, EnqueueOutcome::QueuedAfterEviction { position: 1, .. }));
    assert_eq!(q.len(), 100);

    let oldest = drain(&mut low_receivers[0]);
    assert_eq!(oldest.len(), 2);
    let text = oldest[1].text();
    assert!(text.contains("overloaded") && text.contains("dropped"), "{text}");

    for rx in low_receivers.iter_mut().skip(1) {
        assert_eq!(drain(rx).len(), 1, "only the queued acknowledgement");
    }
    let high = drain(&mut high_rx);
    assert!(high[0].text().contains("queued"));
}

#[tokio::test]
async fn test_length_never_exceeds_capacity() {
    let q = queue(5);
    let (r, _rx) = channel();
    for i in 0..50 {
        let p = Priority::ALL[i % 3];
        q.enqueue(msg(&i.to_string(), p), r.clone()).await;
        assert!(q.len() <= 5);
    }
    let snap = q.snapshot();
    assert_eq!(snap.size, 5);
    assert_eq!(snap.high, 5);
}

#[tokio::test]
async fn test_every_accepted_message_gets_exactly_one_terminal_notice() {
    let q = queue(4);
    let mut receivers = Vec::new();
    let priorities = [
        Priority::Low,
        Priority::Low,
        Priority::Medium,
        Priority::Medium,
        Priority::High,
        Priority::High,
        Priority::Low,
    ];
    for (i, p) in priorities.into_iter().enumerate() {
        let (r, rx) = channel();
        q.enqueue(msg(&format!("m{i}"), p), r).await;
        receivers.push(rx);
    }

    // Deliver some, fail others until they give up.
    for _ in 0..5 {
        q.process(|m| async move {
            if m.payload.ends_with('5') {
                Ok("ok".to_string())
            } else {
                Err(Error::upstream("flaky"))
            }
        })
        .await;
    }
    q.drain_for_shutdown().await;

    for (i, rx) in receivers.iter_mut().enumerate() {
        let notices = drain(rx);
        let terminal = notices.iter().filter(|n| n.is_terminal()).count();
        assert_eq!(terminal, 1, "message m{i} got {notices:?}");
    }
    assert!(q.is_empty());
}
