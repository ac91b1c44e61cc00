//! Helpers for observing progress events and waiting on conditions

use media_relay::TransferEvent;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

/// Everything currently queued on the receiver
pub fn drain_events(rx: &mut UnboundedReceiver<TransferEvent>) -> Vec<TransferEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Count events matching `pred`
pub fn count_events(events: &[TransferEvent], pred: impl Fn(&TransferEvent) -> bool) -> usize {
    events.iter().filter(|e| pred(e)).count()
}

/// Poll `condition` until it holds, panicking after `timeout`
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) {
    let reached = tokio::time::timeout(timeout, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "condition not reached within {timeout:?}");
}
