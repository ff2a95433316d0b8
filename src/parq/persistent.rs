use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::logging::{LogLevel, Logger};
use crate::storage::{StorageError, StorageFacade};
use crate::utils::timing::measure_execution;

use super::scheduler::Scheduler;
use super::SchedulerConfig;

/// Queue state of one entry as it survives a restart.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedEntry {
    pub queue_no: usize,
    pub position: usize,
    /// Unix seconds.
    pub entered: i64,
    /// Seconds left before expiry at save time.
    pub expire_in: i64,
    pub id: String,
    pub size: u64,
    pub contact: Option<SocketAddr>,
    pub ip: IpAddr,
    pub name: String,
}

impl PersistedEntry {
    fn validate(&self) -> Result<(), PersistenceError> {
        if self.id.is_empty() || !self.id.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(PersistenceError::Parse {
                id: self.id.clone(),
                detail: "identifier must be a non-empty hex string".to_owned(),
            });
        }
        if i32::try_from(self.expire_in).is_err() {
            return Err(PersistenceError::Parse {
                id: self.id.clone(),
                detail: format!("expiry offset {}s is out of range", self.expire_in),
            });
        }
        if self.name.is_empty() {
            return Err(PersistenceError::Parse {
                id: self.id.clone(),
                detail: "resource name is empty".to_owned(),
            });
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum PersistenceError {
    Storage(StorageError),
    Parse { id: String, detail: String },
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Storage(source) => write!(f, "queue persistence error: {source}"),
            Self::Parse { id, detail } => {
                write!(f, "invalid persisted queue entry '{id}': {detail}")
            }
        }
    }
}

impl std::error::Error for PersistenceError {}

impl Scheduler {
    /// Records of every entry worth restoring, last queue first and in
    /// arrival order within a queue. Entries that already finished an upload
    /// are left out.
    pub fn snapshot_records(&self, now: DateTime<Utc>) -> Vec<PersistedEntry> {
        let mut records = Vec::with_capacity(self.entries.len());

        for (tier, queue) in self.queues.iter().enumerate().rev() {
            for handle in &queue.by_position {
                let Some(entry) = self.entries.get(handle) else {
                    continue;
                };
                if entry.had_slot && !entry.has_slot {
                    continue;
                }

                records.push(PersistedEntry {
                    queue_no: tier + 1,
                    position: entry.position,
                    entered: entry.entered_at.timestamp(),
                    expire_in: (entry.expire_at - now).num_seconds(),
                    id: entry.id.clone(),
                    size: entry.file_size,
                    contact: entry.contact,
                    ip: entry.remote_ip,
                    name: entry.name.clone(),
                });
            }
        }

        records
    }

    /// Feeds saved records through the normal creation path, keeping their
    /// identifiers, and schedules a QUEUE callback for each. Returns how many
    /// entries were restored.
    pub fn restore_records(&mut self, records: Vec<PersistedEntry>, now: DateTime<Utc>) -> usize {
        let mut restored = 0;

        for record in records {
            if let Err(error) = record.validate() {
                self.logger.warn(Some("parq::persistent"), &error.to_string());
                continue;
            }
            if self.by_id.contains_key(&record.id) {
                self.logger.warn(
                    Some("parq::persistent"),
                    &format!("skipping duplicate persisted entry {}", record.id),
                );
                continue;
            }

            let Some(expire_at) = Duration::try_seconds(record.expire_in)
                .and_then(|offset| now.checked_add_signed(offset))
            else {
                self.logger.warn(
                    Some("parq::persistent"),
                    &format!(
                        "skipping persisted entry {} with unusable expiry offset {}s",
                        record.id, record.expire_in
                    ),
                );
                continue;
            };

            let handle = self.create_entry(record.ip, &record.name, record.size, now);
            let Some(entry) = self.entries.get_mut(&handle) else {
                continue;
            };

            entry.entered_at = Utc
                .timestamp_opt(record.entered, 0)
                .single()
                .unwrap_or(now);
            entry.expire_at = expire_at;
            entry.retry_at = entry.retry_at.min(expire_at);
            entry.contact = record.contact;

            let generated = std::mem::replace(&mut entry.id, record.id.clone());
            if self.by_id.get(&generated) == Some(&handle) {
                self.by_id.remove(&generated);
            }
            self.by_id.insert(record.id, handle);

            self.schedule_callback(handle);
            restored += 1;
        }

        restored
    }
}

/// Scheduler bound to the storage it is saved to and restored from.
pub struct PersistentScheduler {
    scheduler: Scheduler,
}

impl PersistentScheduler {
    pub fn bootstrap(
        config: SchedulerConfig,
        storage: &StorageFacade,
        logger: Arc<Logger>,
        now: DateTime<Utc>,
    ) -> Result<Self, PersistenceError> {
        let loaded = storage.load_entries().map_err(PersistenceError::Storage)?;
        for rejected in &loaded.rejected {
            logger.warn(
                Some("parq::persistent"),
                &format!("skipping unreadable persisted entry: {rejected}"),
            );
        }
        let records = loaded.entries;
        let persisted = records.len();

        let mut scheduler = Scheduler::new(config, Arc::clone(&logger));
        let restored = scheduler.restore_records(records, now);

        logger.log(
            LogLevel::Info,
            Some("parq::persistent"),
            "Queue state loaded from persistence",
            Some(json!({
                "engine": storage.engine().as_str(),
                "persisted": persisted,
                "rejected": loaded.rejected.len(),
                "restored": restored,
                "queues": scheduler.queue_count(),
                "pending_callbacks": scheduler.pending_callbacks()
            })),
        );

        Ok(Self { scheduler })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    /// Replaces the stored state with the current one. Returns the number
    /// of records written.
    pub fn persist_current_state(
        &self,
        storage: &StorageFacade,
        now: DateTime<Utc>,
    ) -> Result<usize, PersistenceError> {
        let logger = Arc::clone(&self.scheduler.logger);
        measure_execution("parq.persist", Some("parq::persistent"), &logger, || {
            let records = self.scheduler.snapshot_records(now);
            storage
                .replace_entries(&records, now)
                .map_err(PersistenceError::Storage)?;
            storage.flush().map_err(PersistenceError::Storage)?;
            Ok(records.len())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;

    use crate::config::{AppConfig, StorageConfig};
    use crate::logging::Logger;
    use crate::parq::scheduler::tests::{
        ip, quiet_logger, request, scheduler_with, single_slot_config, start_time, MIB,
    };
    use crate::storage::{StorageFacade, RECOVERY_FILE_NAME};
    use crate::wire::headers::HeaderMap;

    use super::{PersistedEntry, PersistentScheduler};

    fn unique_temp_path(label: &str) -> String {
        std::env::temp_dir()
            .join(format!(
                "parqd-persistent-test-{label}-{}-{}",
                std::process::id(),
                chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
            ))
            .to_string_lossy()
            .to_string()
    }

    fn test_storage(path: &str, engine: &str, logger: &Logger) -> StorageFacade {
        let app_config = AppConfig {
            storage: StorageConfig {
                engine: engine.to_owned(),
                path: path.to_owned(),
                ..StorageConfig::default()
            },
            ..AppConfig::default()
        };
        StorageFacade::initialize(&app_config, logger).expect("storage should initialize")
    }

    #[test]
    fn snapshot_skips_finished_uploads_and_orders_last_queue_first() {
        let mut scheduler = scheduler_with(crate::parq::SchedulerConfig {
            max_uploads: 2,
            ..single_slot_config()
        });
        let headers = HeaderMap::new();
        let now = start_time();

        let small = scheduler
            .resolve(&request(ip(1), "small", MIB, &headers), now)
            .expect("entry should be created");
        let large = scheduler
            .resolve(&request(ip(2), "large", 400 * MIB, &headers), now)
            .expect("entry should be created");
        let finished = scheduler
            .resolve(&request(ip(3), "done", MIB, &headers), now)
            .expect("entry should be created");
        scheduler.mark_granted(finished).expect("grant should succeed");
        scheduler.release(finished, crate::parq::ReleasePhase::Finished, now);

        let records = scheduler.snapshot_records(now);
        let names: Vec<&str> = records.iter().map(|record| record.name.as_str()).collect();

        assert_eq!(names, vec!["small", "large"]);
        assert_eq!(records[0].queue_no, 2);
        assert_eq!(records[1].queue_no, 1);
        assert_eq!(records[0].id, scheduler.entry(small).expect("entry").id());
        assert_eq!(records[1].id, scheduler.entry(large).expect("entry").id());
        assert_eq!(records[1].expire_in, 150);
    }

    #[test]
    fn restore_keeps_identity_and_schedules_callbacks() {
        let mut original = scheduler_with(single_slot_config());
        let now = start_time();
        let reachable = HeaderMap::new()
            .with("X-Queue", "1.0")
            .with("X-Node", "10.9.0.1:6346");
        let handle = original
            .resolve(&request(ip(1), "movie", 10 * MIB, &reachable), now)
            .expect("entry should be created");
        let id = original.entry(handle).expect("entry").id().to_owned();
        let records = original.snapshot_records(now);

        let later = now + Duration::seconds(30);
        let mut restored = scheduler_with(single_slot_config());
        assert_eq!(restored.restore_records(records, later), 1);

        let handle = restored.find_by_id(&id).expect("identifier should survive");
        let entry = restored.entry(handle).expect("entry");
        assert_eq!(entry.name(), "movie");
        assert_eq!(entry.entered_at(), now);
        assert_eq!(entry.expire_at(), later + Duration::seconds(150));
        assert!(entry.flags().pending);
        assert_eq!(restored.pending_callbacks(), 1);
        assert_eq!(restored.find(ip(1), "movie"), Some(handle));
    }

    #[test]
    fn restore_skips_invalid_and_duplicate_records() {
        let mut scheduler = scheduler_with(single_slot_config());
        let record = PersistedEntry {
            queue_no: 1,
            position: 1,
            entered: start_time().timestamp(),
            expire_in: 60,
            id: "ABCDEF0123456789ABCDEF0123456789".to_owned(),
            size: MIB,
            contact: None,
            ip: ip(1),
            name: "a".to_owned(),
        };
        let invalid = PersistedEntry {
            id: "not hex".to_owned(),
            ..record.clone()
        };
        let duplicate = PersistedEntry {
            name: "b".to_owned(),
            ..record.clone()
        };

        let restored = scheduler.restore_records(vec![record, invalid, duplicate], start_time());

        assert_eq!(restored, 1);
        assert_eq!(scheduler.entry_count(), 1);
        assert_eq!(scheduler.pending_callbacks(), 0);
    }

    #[test]
    fn restore_rejects_unusable_expiry_and_keeps_retry_before_expiry() {
        let mut scheduler = scheduler_with(single_slot_config());
        let now = start_time();
        let stale = PersistedEntry {
            queue_no: 1,
            position: 1,
            entered: now.timestamp(),
            expire_in: -30,
            id: "ABCDEF0123456789ABCDEF0123456789".to_owned(),
            size: MIB,
            contact: None,
            ip: ip(1),
            name: "stale".to_owned(),
        };
        let hostile = PersistedEntry {
            expire_in: i64::MAX,
            id: "0123456789ABCDEF0123456789ABCDEF".to_owned(),
            ip: ip(2),
            name: "hostile".to_owned(),
            ..stale.clone()
        };

        assert!(hostile.validate().is_err());
        assert_eq!(scheduler.restore_records(vec![stale, hostile], now), 1);

        let handle = scheduler.find(ip(1), "stale").expect("stale entry should be restored");
        let entry = scheduler.entry(handle).expect("entry");
        assert_eq!(entry.expire_at(), now - Duration::seconds(30));
        assert!(entry.retry_at() <= entry.expire_at());
        assert!(scheduler.find(ip(2), "hostile").is_none());
    }

    #[test]
    fn bootstrap_survives_out_of_range_expiry_in_recovery_file() {
        let path = unique_temp_path("hostile-expiry");
        let logger = quiet_logger();
        let storage = test_storage(&path, "recovery_file", &logger);
        std::fs::write(
            storage.data_path().join(RECOVERY_FILE_NAME),
            "QUEUE: 1\nPOS: 1\nENTERED: 10\nEXPIRE: 9223372036854775807\nID: AA\nSIZE: 5\n\
             XIP: 0.0.0.0\nXPORT: 0\nIP: 10.0.0.2\nNAME: hostile\n\n\
             QUEUE: 1\nPOS: 2\nENTERED: 10\nEXPIRE: 60\nID: BB\nSIZE: 5\n\
             XIP: 0.0.0.0\nXPORT: 0\nIP: 10.0.0.3\nNAME: fine\n",
        )
        .expect("recovery file should be written");

        let restored =
            PersistentScheduler::bootstrap(single_slot_config(), &storage, logger, start_time())
                .expect("bootstrap should pass");

        assert_eq!(restored.scheduler().entry_count(), 1);
        assert!(restored.scheduler().find(ip(3), "fine").is_some());

        drop(storage);
        let _ = std::fs::remove_dir_all(path);
    }

    #[test]
    fn state_survives_a_restart_through_each_engine() {
        for engine in ["recovery_file", "sled"] {
            let path = unique_temp_path(engine);
            let logger = quiet_logger();
            let storage = test_storage(&path, engine, &logger);
            let now = start_time();

            let mut first = PersistentScheduler::bootstrap(
                single_slot_config(),
                &storage,
                Arc::clone(&logger),
                now,
            )
            .expect("bootstrap should pass");
            assert_eq!(first.scheduler().entry_count(), 0);

            let headers = HeaderMap::new()
                .with("X-Queue", "1.0")
                .with("X-Node", "10.9.0.7:6346");
            for n in 1..=3 {
                first
                    .scheduler_mut()
                    .resolve(&request(ip(n), "shared file.bin", MIB, &headers), now)
                    .expect("entry should be created");
            }
            let written = first
                .persist_current_state(&storage, now)
                .expect("persist should pass");
            assert_eq!(written, 3);
            drop(first);
            drop(storage);

            let storage = test_storage(&path, engine, &logger);
            let second =
                PersistentScheduler::bootstrap(single_slot_config(), &storage, logger, now)
                    .expect("bootstrap should pass");
            assert_eq!(second.scheduler().entry_count(), 3);
            assert_eq!(second.scheduler().pending_callbacks(), 3);
            let third = second
                .scheduler()
                .find(ip(3), "shared file.bin")
                .expect("entry should be restored");
            assert_eq!(
                second.scheduler().entry(third).expect("entry").position(),
                3
            );

            drop(storage);
            let _ = std::fs::remove_dir_all(path);
        }
    }
}
