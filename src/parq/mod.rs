//! Passive/Active Remote Queueing.
//!
//! The server side keeps one [`Scheduler`] owning every size-tiered queue,
//! queued entry and per-source aggregate. The client side keeps a
//! [`remote::RemoteQueueTracker`] describing where our own downloads stand in
//! other peers' queues.

mod admission;
pub mod callback;
mod entry;
mod error;
mod eta;
mod headers;
pub mod persistent;
mod queues;
pub mod remote;
mod scheduler;
mod source;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::wire::header::parse_version;

pub use admission::{Admission, ReleaseOutcome, ReleasePhase, RequestContext};
pub use callback::{CallbackOutcome, CallbackRequest, CallbackTransport, TickReport};
pub use entry::{CallbackFlags, EntryHandle, QueuedEntry};
pub use error::ParqError;
pub use queues::{select_tier, SizeTieredQueue};
pub use scheduler::{QueueStanding, Scheduler, UploadRequest};
pub use source::SourceAggregate;

pub const LARGE_FILE_SIZE: u64 = 300 * 1024 * 1024;
pub const MAX_QUEUE_SIZE: usize = 4_000;
pub const ACTIVE_QUEUE_SIZE: usize = 20;
pub const MIN_LIFETIME_SECS: i64 = 90;
pub const EXPIRE_GRACE_SECS: i64 = 90;
pub const MAX_RETRY_DELAY_SECS: i64 = 1_200;
pub const BAN_WINDOW_SECS: i64 = 600;
pub const CALLBACK_PERIOD_SECS: i64 = 600;
pub const MAX_CALLBACK_ATTEMPTS: u32 = 144;
pub const MAX_CALLBACK_REFUSALS: u32 = 2;
pub const MAX_OUTBOUND_CONNECTIONS: usize = 100;
pub const STARTUP_DELAY_TICKS: u64 = 10;
pub const SAVE_INTERVAL_TICKS: u64 = 60;
pub const DEAD_SCAN_INTERVAL_SECS: i64 = 60;
/// ETA reported when no upload slot is configured at all.
pub const UNKNOWN_ETA: u64 = u64::MAX;

/// Queueing protocol version a peer advertised through `X-Queue`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
}

impl ProtocolVersion {
    /// Peer sent no `X-Queue` header.
    pub const NONE: Self = Self { major: 0, minor: 0 };
    pub const LEGACY: Self = Self { major: 0, minor: 1 };
    pub const CURRENT: Self = Self { major: 1, minor: 0 };

    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        parse_version(raw).map(|(major, minor)| Self { major, minor })
    }

    pub fn speaks_queueing(self) -> bool {
        self > Self::NONE
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub max_uploads: usize,
    pub max_uploads_per_source: usize,
    pub max_queue_size: usize,
    pub active_queue_size: usize,
    pub large_file_size: u64,
    pub min_lifetime_secs: i64,
    pub expire_grace_secs: i64,
    pub max_retry_delay_secs: i64,
    pub ban_window_secs: i64,
    pub keep_dead_entries: bool,
    pub dynamic_slot_borrowing: bool,
    pub startup_delay_ticks: u64,
    pub save_interval_ticks: u64,
    pub dead_scan_interval_secs: i64,
    pub callback_period_secs: i64,
    pub max_callback_attempts: u32,
    pub max_callback_refusals: u32,
    pub max_outbound_connections: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_uploads: 4,
            max_uploads_per_source: 1,
            max_queue_size: MAX_QUEUE_SIZE,
            active_queue_size: ACTIVE_QUEUE_SIZE,
            large_file_size: LARGE_FILE_SIZE,
            min_lifetime_secs: MIN_LIFETIME_SECS,
            expire_grace_secs: EXPIRE_GRACE_SECS,
            max_retry_delay_secs: MAX_RETRY_DELAY_SECS,
            ban_window_secs: BAN_WINDOW_SECS,
            keep_dead_entries: true,
            dynamic_slot_borrowing: false,
            startup_delay_ticks: STARTUP_DELAY_TICKS,
            save_interval_ticks: SAVE_INTERVAL_TICKS,
            dead_scan_interval_secs: DEAD_SCAN_INTERVAL_SECS,
            callback_period_secs: CALLBACK_PERIOD_SECS,
            max_callback_attempts: MAX_CALLBACK_ATTEMPTS,
            max_callback_refusals: MAX_CALLBACK_REFUSALS,
            max_outbound_connections: MAX_OUTBOUND_CONNECTIONS,
        }
    }
}

impl SchedulerConfig {
    pub fn from_app_config(app_config: &AppConfig) -> Self {
        let uploads = &app_config.uploads;
        let parq = &app_config.parq;
        let callbacks = &app_config.callbacks;

        Self {
            max_uploads: uploads.max_uploads,
            max_uploads_per_source: uploads.max_uploads_per_source,
            max_queue_size: parq.max_queue_size,
            active_queue_size: parq.active_queue_size,
            ban_window_secs: parq.ban_window_secs,
            keep_dead_entries: parq.keep_dead_entries,
            dynamic_slot_borrowing: parq.dynamic_slot_borrowing,
            startup_delay_ticks: parq.startup_delay_ticks,
            save_interval_ticks: parq.save_interval_ticks,
            dead_scan_interval_secs: parq.dead_scan_interval_secs,
            callback_period_secs: callbacks.period_secs,
            max_callback_attempts: callbacks.max_attempts,
            max_callback_refusals: callbacks.max_refused,
            max_outbound_connections: callbacks.max_outbound_connections,
            ..Self::default()
        }
    }
}

/// What the transfer layer currently knows about outbound traffic.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UplinkStatus {
    /// Outbound bandwidth in bytes per second; `None` when not accounted.
    pub outbound_bandwidth: Option<u64>,
    pub running_uploads: usize,
    /// Upload contexts currently registered, outbound callbacks included.
    pub registered_uploads: usize,
    pub library_rebuilding: bool,
}

#[cfg(test)]
mod tests {
    use super::ProtocolVersion;

    #[test]
    fn protocol_versions_order_by_major_then_minor() {
        assert!(ProtocolVersion::NONE < ProtocolVersion::LEGACY);
        assert!(ProtocolVersion::LEGACY < ProtocolVersion::CURRENT);
        assert!(!ProtocolVersion::NONE.speaks_queueing());
        assert!(ProtocolVersion::LEGACY.speaks_queueing());
    }

    #[test]
    fn parses_and_renders_versions() {
        assert_eq!(ProtocolVersion::parse("1.0"), Some(ProtocolVersion::CURRENT));
        assert_eq!(ProtocolVersion::parse("junk"), None);
        assert_eq!(ProtocolVersion::new(0, 1).to_string(), "0.1");
    }
}
