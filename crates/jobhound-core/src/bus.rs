use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::notifications::DeliveryState;
use crate::sync::SyncState;

const DEFAULT_CAPACITY: usize = 256;

/// Everything the core reports to observers (UI log stream, metrics, tests).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoreEvent {
    SyncStateChanged {
        account_id: String,
        state: SyncState,
        detail: Option<String>,
    },
    MessageAllocated {
        message_id: String,
        company_id: Option<String>,
        manual: bool,
    },
    NotificationStateChanged {
        notification_id: String,
        state: DeliveryState,
        retry_count: i64,
        terminal: bool,
    },
    SchedulerStarted {
        interval_secs: u64,
        endpoint: Option<String>,
    },
    SchedulerStopped,
    TickCompleted {
        at: DateTime<Utc>,
        accounts_synced: usize,
        accounts_failed: usize,
        delivered: usize,
        failed: usize,
    },
}

/// Fan-out channel for [`CoreEvent`]s.
///
/// Publishing never waits: with no subscribers the event is dropped, and a slow
/// subscriber skips the oldest events once it falls `capacity` behind.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: CoreEvent) {
        // An error only means nobody is listening right now.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::RecvError;

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.publish(CoreEvent::SchedulerStopped);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn every_subscriber_sees_each_event() {
        let bus = EventBus::default();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish(CoreEvent::SyncStateChanged {
            account_id: "acc-1".into(),
            state: SyncState::Fetching,
            detail: None,
        });

        for rx in [&mut first, &mut second] {
            match rx.recv().await.expect("event") {
                CoreEvent::SyncStateChanged { account_id, state, .. } => {
                    assert_eq!(account_id, "acc-1");
                    assert_eq!(state, SyncState::Fetching);
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for _ in 0..5 {
            bus.publish(CoreEvent::SchedulerStopped);
        }
        match rx.recv().await {
            Err(RecvError::Lagged(skipped)) => assert_eq!(skipped, 3),
            other => panic!("expected lag, got {other:?}"),
        }
        assert_eq!(rx.recv().await.expect("event"), CoreEvent::SchedulerStopped);
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let value = serde_json::to_value(CoreEvent::MessageAllocated {
            message_id: "m1".into(),
            company_id: Some("c1".into()),
            manual: true,
        })
        .expect("serialize");
        assert_eq!(value["type"], "message_allocated");
        assert_eq!(value["company_id"], "c1");
    }
}
