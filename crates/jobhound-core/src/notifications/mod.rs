pub mod dispatcher;
pub mod mock;
pub mod queue;

pub use dispatcher::{
    DeliveryChannel, DeliveryError, DispatchReport, Dispatcher, WebhookChannel, classify_status,
    webhook_body,
};
pub use mock::ScriptedChannel;
pub use queue::{
    DeliveryState, EnqueueOutcome, NewNotification, NotificationError, NotificationItem,
    NotificationPayload, NotificationQueue, RetryPolicy, SourceKind,
};
