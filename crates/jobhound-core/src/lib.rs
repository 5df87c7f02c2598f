pub mod accounts;
pub mod allocation;
pub mod backoff;
pub mod bus;
pub mod calendar;
pub mod companies;
pub mod config;
pub mod db;
pub mod error;
pub mod extraction;
pub mod gmail;
pub mod messages;
pub mod migrations;
pub mod notifications;
pub mod patterns;
pub mod scheduler;
pub mod sync;
pub mod telemetry;

pub use accounts::{Account, AccountConfig, AccountError, AccountRepository, AccountState};
pub use allocation::{AllocationError, AllocationStore, ReallocationReport};
pub use bus::{CoreEvent, EventBus};
pub use calendar::{
    CalendarError, CalendarRepository, CompanyEvent, EntryDeadline, NewCompanyEvent,
    NewEntryDeadline,
};
pub use companies::{Company, CompanyError, CompanyRepository};
pub use config::{
    Config, ConfigError, DeliveryConfig, ExtractionConfig, SchedulerConfig, SyncConfig,
};
pub use db::{Database, DbError};
pub use error::ErrorKind;
pub use extraction::{EventExtractor, ExtractedEvent, ExtractionError, HttpEventExtractor};
pub use messages::{
    Allocation, AllocationSource, AttachmentRef, EmailMessage, MessageError, MessageRepository,
    Page,
};
pub use notifications::{
    DeliveryChannel, DeliveryError, DeliveryState, Dispatcher, NotificationError,
    NotificationItem, NotificationQueue, RetryPolicy, WebhookChannel,
};
pub use patterns::{CompanyPattern, NewCompanyPattern, PatternError, PatternRepository};
pub use scheduler::{
    Scheduler, SchedulerError, SchedulerStatus, TickReport, TriggerEvaluator, validate_endpoint,
};
pub use sync::{AccountProviderResolver, SyncError, SyncReport, SyncWorker};
pub use telemetry::{TelemetryError, TelemetryGuard, init_logging, init_telemetry};
