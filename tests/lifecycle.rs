use bot_resilience::{
    CircuitStateKind, DegradationMode, FnProcessor, InboundMessage, Priority, ResilienceConfig,
    ResilienceEvent, ResilienceManager, Responder, ResponseNotice,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_test::assert_ok;

fn flaky_manager(
    cfg: ResilienceConfig,
    up: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
) -> ResilienceManager {
    ResilienceManager::builder()
        .config(cfg)
        .processor(Arc::new(FnProcessor(move |m: InboundMessage| {
            calls.fetch_add(1, Ordering::SeqCst);
            let up = up.load(Ordering::SeqCst);
            async move {
                if up {
                    Ok(format!("ok: {}", m.payload))
                } else {
                    Err(bot_resilience::Error::upstream("language model down"))
                }
            }
        })))
        .build()
        .unwrap()
}

fn channel() -> (Arc<dyn Responder>, mpsc::UnboundedReceiver<ResponseNotice>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(tx), rx)
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_notifies_every_pending_message() {
    let m = flaky_manager(
        ResilienceConfig::default(),
        Arc::new(AtomicBool::new(false)),
        Arc::new(AtomicUsize::new(0)),
    );
    assert_ok!(m.initialize().await);

    let mut receivers = Vec::new();
    for i in 0..3 {
        let (r, rx) = channel();
        let outcome = m
            .handle_message(&format!("u{i}"), "g", "hi", r, Priority::Medium)
            .await;
        assert!(outcome.queued);
        receivers.push(rx);
    }
    assert_eq!(m.queue().len(), 3);

    m.shutdown().await;
    for rx in receivers.iter_mut() {
        assert!(matches!(rx.try_recv(), Ok(ResponseNotice::Queued { .. })));
        let last = rx.try_recv().unwrap();
        assert!(last.text().contains("shutting down"), "{last:?}");
    }

    let (r, mut rx) = channel();
    let outcome = m.handle_message("late", "g", "hi", r, Priority::High).await;
    assert!(outcome.handled);
    assert!(matches!(rx.recv().await, Some(ResponseNotice::ShuttingDown { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_queue_loop_delivers_after_dependency_recovers() {
    let up = Arc::new(AtomicBool::new(false));
    let calls = Arc::new(AtomicUsize::new(0));
    let m = flaky_manager(ResilienceConfig::default(), up.clone(), calls.clone());
    m.initialize().await.unwrap();

    let (r, mut rx) = channel();
    m.handle_message("u", "g", "question", r, Priority::High).await;
    assert!(matches!(rx.recv().await, Some(ResponseNotice::Queued { .. })));

    up.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(5_100)).await;
    assert_eq!(
        rx.recv().await,
        Some(ResponseNotice::Delivered {
            reply: "ok: question".into()
        })
    );
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    m.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_recovery_loop_half_opens_and_live_traffic_closes() {
    let cfg = ResilienceConfig::new()
        .with_reset_timeout(Duration::from_secs(10))
        .with_success_threshold(1);
    let calls = Arc::new(AtomicUsize::new(0));
    let m = flaky_manager(cfg, Arc::new(AtomicBool::new(true)), calls.clone());
    m.registry().force_state("language-model", CircuitStateKind::Open);
    m.initialize().await.unwrap();

    // First recovery round at 30s: reset timeout elapsed, no probe configured.
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(m.registry().state_of("language-model"), CircuitStateKind::HalfOpen);
    let diag = m.diagnostics().await;
    assert_eq!(diag.recovery["language-model"].attempts, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // The first real call on probation closes it.
    let (r, mut rx) = channel();
    let outcome = m.handle_message("u", "g", "hi", r, Priority::Medium).await;
    assert!(outcome.handled);
    assert!(matches!(rx.recv().await, Some(ResponseNotice::Delivered { .. })));
    assert_eq!(m.registry().state_of("language-model"), CircuitStateKind::Closed);
    m.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_health_loop_publishes_mode_changes() {
    let m = flaky_manager(
        ResilienceConfig::default(),
        Arc::new(AtomicBool::new(true)),
        Arc::new(AtomicUsize::new(0)),
    );
    let mut events = m.subscribe();
    m.initialize().await.unwrap();
    m.registry().force_state("language-model", CircuitStateKind::Open);

    let mut mode_change = None;
    for _ in 0..4 {
        match tokio::time::timeout(Duration::from_secs(31), events.recv()).await {
            Ok(Ok(ResilienceEvent::ModeChanged { from, to, reason })) => {
                mode_change = Some((from, to, reason));
                break;
            }
            Ok(Ok(_)) => continue,
            other => panic!("no event: {other:?}"),
        }
    }
    let (from, to, reason) = mode_change.unwrap();
    assert_eq!(from, DegradationMode::Normal);
    assert_eq!(to, DegradationMode::Severe);
    assert!(reason.contains("language-model"));
    m.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_without_initialize_still_drains() {
    let m = flaky_manager(
        ResilienceConfig::default(),
        Arc::new(AtomicBool::new(false)),
        Arc::new(AtomicUsize::new(0)),
    );
    let (r, mut rx) = channel();
    m.handle_message("u", "g", "hi", r, Priority::Low).await;
    m.shutdown().await;
    assert!(matches!(rx.recv().await, Some(ResponseNotice::Queued { .. })));
    assert!(matches!(rx.recv().await, Some(ResponseNotice::ShuttingDown { .. })));
}
