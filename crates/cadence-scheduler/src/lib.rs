//! `cadence-scheduler`: durable publication scheduling on SQLite.
//!
//! # Overview
//!
//! Items are persisted to a SQLite `schedule_items` table. The
//! [`engine::SchedulerEngine`] scans for due items on a fixed interval,
//! claims each one with a conditional UPDATE (so any number of engines may
//! share a database and an item is only ever executed once per claim), and
//! queues it for a bounded pool of [`worker::PublishWorker`]s. A worker
//! publishes to every target platform, logs each platform result to
//! `publish_attempts`, and writes the aggregate outcome back.
//!
//! # Lifecycle
//!
//! | Status      | Meaning                                              |
//! |-------------|------------------------------------------------------|
//! | `pending`   | Created, waiting for its first run (or a retry)      |
//! | `active`    | Recurring item armed for its next occurrence         |
//! | `paused`    | Recurring item suspended by its owner                |
//! | `in_flight` | Claimed; a worker owns it                            |
//! | `failed`    | Retry budget for the occurrence exhausted            |
//! | `completed` | Published, or the recurrence window ran out          |
//! | `cancelled` | Cancelled by its owner                               |
//!
//! # Recurrence patterns
//!
//! `once`, `daily`, `weekly`, `monthly` (day clamped to month length) and
//! `custom` (every N units, one hour by default). See [`recurrence`].

pub mod clock;
pub mod db;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod publisher;
pub mod recurrence;
pub mod retry;
pub mod store;
pub mod transition;
pub mod types;
pub mod webhook;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{SchedulerEngine, SchedulerHandle};
pub use error::{Result, SchedulerError};
pub use publisher::{PublishError, PublishReceipt, PublishRequest, Publisher, PublisherRegistry};
pub use retry::RetryPolicy;
pub use store::{Applied, ItemStore};
pub use types::{
    ItemFilter, ItemKind, ItemStats, ItemStatus, ItemUpdate, NewItem, PublishAttempt, Recurrence,
    RecurrencePattern, ScheduleItem,
};
