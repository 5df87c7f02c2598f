use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::dispatcher::{DeliveryChannel, DeliveryError};
use super::queue::NotificationItem;

#[derive(Debug, Default)]
struct Script {
    per_item: HashMap<String, VecDeque<Result<(), DeliveryError>>>,
    any_item: VecDeque<Result<(), DeliveryError>>,
    sent: Vec<(String, NotificationItem)>,
    delay: Option<Duration>,
}

/// In-memory channel that replays scripted results. Results scripted for a
/// specific item win over the shared queue; with nothing scripted a send
/// succeeds.
#[derive(Debug, Default, Clone)]
pub struct ScriptedChannel {
    inner: Arc<Mutex<Script>>,
}

impl ScriptedChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn script(&self, item_id: &str, result: Result<(), DeliveryError>) {
        self.inner
            .lock()
            .await
            .per_item
            .entry(item_id.to_string())
            .or_default()
            .push_back(result);
    }

    pub async fn push(&self, result: Result<(), DeliveryError>) {
        self.inner.lock().await.any_item.push_back(result);
    }

    /// Holds every later send for `delay` before it resolves.
    pub async fn set_send_delay(&self, delay: Duration) {
        self.inner.lock().await.delay = Some(delay).filter(|d| !d.is_zero());
    }

    /// Every `(endpoint, item)` handed to the channel, in call order.
    pub async fn sent(&self) -> Vec<(String, NotificationItem)> {
        self.inner.lock().await.sent.clone()
    }
}

#[async_trait]
impl DeliveryChannel for ScriptedChannel {
    async fn send(&self, endpoint: &str, item: &NotificationItem) -> Result<(), DeliveryError> {
        let delay = {
            let mut script = self.inner.lock().await;
            script.sent.push((endpoint.to_string(), item.clone()));
            script.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut script = self.inner.lock().await;
        let scripted = script
            .per_item
            .get_mut(&item.id)
            .and_then(VecDeque::pop_front);
        match scripted {
            Some(result) => result,
            None => script.any_item.pop_front().unwrap_or(Ok(())),
        }
    }
}
