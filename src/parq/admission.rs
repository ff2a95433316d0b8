use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use crate::logging::LogLevel;

use super::entry::EntryHandle;
use super::scheduler::Scheduler;
use super::ParqError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Upload slots currently in use on this node.
    pub used_slots: usize,
    pub chunk_size: u64,
    /// The request arrives on a connection opened by our QUEUE callback.
    pub answering_callback: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Granted,
    /// `actively` means the peer may keep its connection open and wait.
    Queued { actively: bool },
}

/// How an upload exchange ended, from the transfer layer's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleasePhase {
    /// We answered "busy"; the queue already accounted for it.
    BusyReply,
    /// Peer never sent a request on a connection our QUEUE callback opened.
    AwaitingCallbackReply,
    /// Slot holder keeps the connection between two requests.
    KeepAliveIdle,
    Finished,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    NotQueued,
    Retained,
    Removed,
}

impl Scheduler {
    /// Decides whether `handle` may take one of `free_slots` now.
    pub fn may_grant(&self, handle: EntryHandle, free_slots: i64) -> bool {
        let Some(entry) = self.entries.get(&handle) else {
            return false;
        };
        if free_slots <= 0 {
            return false;
        }

        let uploading = self
            .sources
            .get(&entry.remote_ip)
            .map(|source| source.uploading)
            .unwrap_or(0);
        if uploading >= self.config.max_uploads_per_source {
            return false;
        }

        let own = &self.queues[entry.tier];
        if let Some(last) = self.queues.last() {
            if !last.active && last.alive > 0 && own.active {
                return false;
            }
        }

        let mut ceiling: Option<usize> = None;
        let mut occupied_queues = 0;
        for queue in self.queues.iter().rev() {
            if queue.wants_slot() {
                let candidate = queue.active_uploads + 1;
                ceiling = Some(ceiling.map_or(candidate, |current| current.min(candidate)));
            }
            if queue.alive > 0 {
                occupied_queues += 1;
            }
        }

        let spare_slots = if self.config.dynamic_slot_borrowing {
            self.config.max_uploads.saturating_sub(occupied_queues)
        } else {
            0
        };

        match ceiling {
            Some(ceiling) if ceiling + spare_slots > own.active_uploads => {}
            _ => return false,
        }

        let mut tolerated_blockers = spare_slots;
        for other_handle in &own.by_rank {
            if *other_handle == handle {
                return true;
            }
            let Some(other) = self.entries.get(other_handle) else {
                continue;
            };
            if other.remote_ip == entry.remote_ip {
                return true;
            }
            if other.has_slot {
                continue;
            }

            let other_uploading = self
                .sources
                .get(&other.remote_ip)
                .map(|source| source.uploading)
                .unwrap_or(0);
            if other_uploading > 0 {
                continue;
            }

            if tolerated_blockers == 0 {
                return false;
            }
            tolerated_blockers -= 1;
        }

        self.logger.warn(
            Some("parq::admission"),
            &format!(
                "entry {} not found in rank order of queue #{}",
                entry.id,
                entry.tier + 1
            ),
        );
        false
    }

    /// Handles one upload request for an already resolved entry.
    pub fn request(
        &mut self,
        handle: EntryHandle,
        context: RequestContext,
        now: DateTime<Utc>,
    ) -> Result<Admission, ParqError> {
        if !self.entries.contains_key(&handle) {
            return Err(ParqError::UnknownEntry);
        }

        let counter = self.request_counts.entry(handle).or_insert(0);
        let is_rerequest = *counter > 0;
        *counter += 1;

        let previous_retry = self.entries[&handle].retry_at;
        self.schedule_retry(handle, now);

        let ban_window = Duration::seconds(self.config.ban_window_secs);
        let Some(entry) = self.entries.get_mut(&handle) else {
            return Err(ParqError::UnknownEntry);
        };
        entry.chunk_size = context.chunk_size;
        entry.updated_at = now;

        if is_rerequest
            && !entry.has_slot
            && previous_retry > now
            && !entry.flags.sent
            && !context.answering_callback
        {
            let early_by_secs = (previous_retry - now).num_seconds();
            let id = entry.id.clone();
            let payload = json!({
                "id": id,
                "remote_ip": entry.remote_ip.to_string(),
                "name": entry.name,
                "early_by_secs": early_by_secs
            });

            if entry.ban_until.map_or(false, |until| until > now) {
                self.logger.log(
                    LogLevel::Warn,
                    Some("parq::admission"),
                    "Removing entry that re-requested too early while banned",
                    Some(payload),
                );
                self.force_remove(handle, now);
                return Err(ParqError::PolicyViolation {
                    id,
                    early_by_secs,
                    removed: true,
                });
            }

            entry.ban_until = Some(now + ban_window);
            self.logger.log(
                LogLevel::Warn,
                Some("parq::admission"),
                "Entry re-requested too early",
                Some(payload),
            );
            return Err(ParqError::PolicyViolation {
                id,
                early_by_secs,
                removed: false,
            });
        }

        if entry.flags.sent {
            entry.queue_sent = 0;
            entry.flags.sent = false;
        }

        if entry.has_slot {
            return Ok(Admission::Granted);
        }

        let queue_position = entry.queue_position;
        let speaks_queueing = entry.version.speaks_queueing();
        let free_slots = self.config.max_uploads as i64 - context.used_slots as i64;

        if self.may_grant(handle, free_slots) {
            return Ok(Admission::Granted);
        }

        Ok(Admission::Queued {
            actively: queue_position <= self.config.active_queue_size && speaks_queueing,
        })
    }

    /// Dynamic slot allocation: lets an entry through even though every
    /// regular slot is taken, as long as it would otherwise be next.
    pub fn request_force(&self, handle: EntryHandle, used_slots: usize) -> bool {
        if self.config.max_uploads as i64 - used_slots as i64 > 0 {
            return false;
        }
        self.may_grant(handle, 1)
    }

    pub fn mark_granted(&mut self, handle: EntryHandle) -> Result<(), ParqError> {
        let entry = self
            .entries
            .get_mut(&handle)
            .ok_or(ParqError::UnknownEntry)?;
        if entry.has_slot {
            return Ok(());
        }

        entry.has_slot = true;
        entry.had_slot = true;
        let tier = entry.tier;
        let address = entry.remote_ip;

        self.queues[tier].active_uploads += 1;
        if let Some(source) = self.sources.get_mut(&address) {
            source.uploading += 1;
        }

        self.queues[tier].rerank(&mut self.entries);
        self.recompute_eta(tier);
        Ok(())
    }

    /// Called when an upload exchange ends.
    pub fn release(
        &mut self,
        handle: EntryHandle,
        phase: ReleasePhase,
        now: DateTime<Utc>,
    ) -> ReleaseOutcome {
        let ban_window = Duration::seconds(self.config.ban_window_secs);
        let Some(entry) = self.entries.get_mut(&handle) else {
            return ReleaseOutcome::NotQueued;
        };

        if phase == ReleasePhase::BusyReply {
            return ReleaseOutcome::Retained;
        }

        if phase == ReleasePhase::AwaitingCallbackReply {
            entry.queue_refused += 1;
        } else if entry.flags.sent {
            entry.queue_refused = 0;
        }
        entry.flags.sent = false;

        if entry.has_slot && phase == ReleasePhase::KeepAliveIdle {
            return ReleaseOutcome::Retained;
        }

        let held_slot = entry.has_slot;
        let penalised = entry
            .disconnect_penalty_until
            .map_or(false, |until| until > now);
        let tier = entry.tier;
        let address = entry.remote_ip;
        let id = entry.id.clone();

        if held_slot {
            entry.has_slot = false;
            if !penalised {
                entry.disconnect_penalty_until = Some(now + ban_window);
            }
        }

        if held_slot && penalised {
            self.release_slot_counters(tier, address);
            self.logger.log(
                LogLevel::Warn,
                Some("parq::admission"),
                "Removing entry after too many disconnections",
                Some(json!({
                    "id": id,
                    "remote_ip": address.to_string()
                })),
            );
            self.retire(handle);
            self.notify_next_waiting(tier, handle);
            return ReleaseOutcome::Removed;
        }

        entry.retry_at = now;
        entry.expire_at = now + Duration::seconds(1);

        if held_slot {
            self.release_slot_counters(tier, address);
        }
        self.queues[tier].rerank(&mut self.entries);
        self.recompute_eta(tier);
        if held_slot {
            self.notify_next_waiting(tier, handle);
        }

        ReleaseOutcome::Retained
    }

    /// Releases bookkeeping and drops the entry for good.
    pub fn force_remove(&mut self, handle: EntryHandle, now: DateTime<Utc>) {
        if self.release(handle, ReleasePhase::Finished, now) != ReleaseOutcome::Removed {
            self.retire(handle);
        }
    }

    fn release_slot_counters(&mut self, tier: usize, address: std::net::IpAddr) {
        let queue = &mut self.queues[tier];
        queue.active_uploads = queue.active_uploads.saturating_sub(1);
        if let Some(source) = self.sources.get_mut(&address) {
            source.uploading = source.uploading.saturating_sub(1);
        }
    }

    /// A freed slot wakes the first entry still waiting in the queue.
    fn notify_next_waiting(&mut self, tier: usize, released: EntryHandle) {
        let next = self.queues[tier]
            .by_rank
            .iter()
            .copied()
            .filter(|candidate| *candidate != released)
            .find(|candidate| {
                self.entries
                    .get(candidate)
                    .map_or(false, |entry| !entry.has_slot)
            });

        let Some(next) = next else {
            return;
        };
        let blocked = self
            .entries
            .get(&next)
            .map_or(true, |entry| entry.flags.blocks_callback());
        if !blocked {
            self.schedule_callback(next);
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use crate::parq::scheduler::tests::{
        ip, request, scheduler_with, single_slot_config, start_time, MIB,
    };
    use crate::parq::{
        Admission, EntryHandle, ParqError, ReleaseOutcome, ReleasePhase, RequestContext,
        SchedulerConfig,
    };
    use crate::wire::headers::HeaderMap;

    fn used(used_slots: usize) -> RequestContext {
        RequestContext {
            used_slots,
            chunk_size: 4_096,
            answering_callback: false,
        }
    }

    fn queue_headers(contact: &str) -> HeaderMap {
        HeaderMap::new()
            .with("X-Queue", "1.0")
            .with("X-Node", contact)
    }

    #[test]
    fn first_request_is_granted_and_followers_are_queued_behind_it() {
        let mut scheduler = scheduler_with(single_slot_config());
        let now = start_time();
        let headers = [
            queue_headers("10.9.0.1:6346"),
            queue_headers("10.9.0.2:6346"),
            queue_headers("10.9.0.3:6346"),
        ];

        let first = scheduler
            .resolve(&request(ip(1), "movie", 10 * MIB, &headers[0]), now)
            .expect("entry should be created");
        assert_eq!(
            scheduler.request(first, used(0), now),
            Ok(Admission::Granted)
        );
        scheduler.mark_granted(first).expect("grant should succeed");

        let second = scheduler
            .resolve(&request(ip(2), "movie", 10 * MIB, &headers[1]), now)
            .expect("entry should be created");
        let third = scheduler
            .resolve(&request(ip(3), "movie", 10 * MIB, &headers[2]), now)
            .expect("entry should be created");

        assert_eq!(
            scheduler.request(second, used(1), now),
            Ok(Admission::Queued { actively: true })
        );
        assert_eq!(
            scheduler.request(third, used(1), now),
            Ok(Admission::Queued { actively: true })
        );

        let standing = |handle: EntryHandle| scheduler.standing_of(handle, now).expect("standing");
        assert_eq!(standing(second).position, 1);
        assert_eq!(standing(third).position, 2);
        assert_eq!(standing(second).relative_position, 2);
        assert_eq!(standing(second).queue_size, 3);
        assert_eq!(standing(second).retry_in_secs, 60);
        assert_eq!(standing(third).retry_in_secs, 105);
    }

    #[test]
    fn plain_clients_are_queued_passively() {
        let mut scheduler = scheduler_with(single_slot_config());
        let now = start_time();
        let plain = HeaderMap::new();

        let holder = scheduler
            .resolve(&request(ip(1), "f", MIB, &plain), now)
            .expect("entry should be created");
        scheduler.mark_granted(holder).expect("grant should succeed");
        let waiting = scheduler
            .resolve(&request(ip(2), "f", MIB, &plain), now)
            .expect("entry should be created");

        assert_eq!(
            scheduler.request(waiting, used(1), now),
            Ok(Admission::Queued { actively: false })
        );
    }

    #[test]
    fn fairness_prefers_the_queue_with_fewer_active_uploads() {
        let mut scheduler = scheduler_with(SchedulerConfig {
            max_uploads: 2,
            startup_delay_ticks: 0,
            ..SchedulerConfig::default()
        });
        let headers = HeaderMap::new();
        let now = start_time();

        let large_a = scheduler
            .resolve(&request(ip(1), "large-a", 400 * MIB, &headers), now)
            .expect("entry should be created");
        scheduler.mark_granted(large_a).expect("grant should succeed");
        let large_b = scheduler
            .resolve(&request(ip(2), "large-b", 400 * MIB, &headers), now)
            .expect("entry should be created");
        let small = scheduler
            .resolve(&request(ip(3), "small", MIB, &headers), now)
            .expect("entry should be created");

        assert!(!scheduler.may_grant(large_b, 1));
        assert!(scheduler.may_grant(small, 1));
    }

    #[test]
    fn source_at_its_upload_limit_is_denied() {
        let mut scheduler = scheduler_with(SchedulerConfig {
            max_uploads: 3,
            max_uploads_per_source: 1,
            ..SchedulerConfig::default()
        });
        let headers = HeaderMap::new();
        let now = start_time();

        let uploading = scheduler
            .resolve(&request(ip(1), "a", MIB, &headers), now)
            .expect("entry should be created");
        scheduler.mark_granted(uploading).expect("grant should succeed");
        let second = scheduler
            .resolve(&request(ip(1), "b", MIB, &headers), now)
            .expect("entry should be created");

        assert!(!scheduler.may_grant(second, 2));
        assert!(!scheduler.may_grant(second, 0));
    }

    #[test]
    fn idle_earlier_source_blocks_unless_slots_may_be_borrowed() {
        let config = SchedulerConfig {
            max_uploads: 2,
            ..SchedulerConfig::default()
        };
        let headers = HeaderMap::new();
        let now = start_time();

        let mut strict = scheduler_with(config.clone());
        let earlier = strict
            .resolve(&request(ip(1), "f", MIB, &headers), now)
            .expect("entry should be created");
        let later = strict
            .resolve(&request(ip(2), "f", MIB, &headers), now)
            .expect("entry should be created");
        assert!(!strict.may_grant(later, 2));
        assert!(strict.may_grant(earlier, 2));

        let mut borrowing = scheduler_with(SchedulerConfig {
            dynamic_slot_borrowing: true,
            ..config
        });
        borrowing
            .resolve(&request(ip(1), "f", MIB, &headers), now)
            .expect("entry should be created");
        let later = borrowing
            .resolve(&request(ip(2), "f", MIB, &headers), now)
            .expect("entry should be created");
        assert!(borrowing.may_grant(later, 2));
    }

    #[test]
    fn earlier_entry_from_same_source_lets_request_through() {
        let mut scheduler = scheduler_with(SchedulerConfig {
            max_uploads: 2,
            ..SchedulerConfig::default()
        });
        let headers = HeaderMap::new();
        let now = start_time();

        scheduler
            .resolve(&request(ip(1), "a", MIB, &headers), now)
            .expect("entry should be created");
        let second_file = scheduler
            .resolve(&request(ip(1), "b", MIB, &headers), now)
            .expect("entry should be created");

        assert!(scheduler.may_grant(second_file, 1));
    }

    #[test]
    fn early_rerequest_is_banned_then_removed() {
        let mut scheduler = scheduler_with(single_slot_config());
        let headers = HeaderMap::new();
        let now = start_time();

        let holder = scheduler
            .resolve(&request(ip(1), "f", MIB, &headers), now)
            .expect("entry should be created");
        scheduler.mark_granted(holder).expect("grant should succeed");
        let eager = scheduler
            .resolve(&request(ip(2), "f", MIB, &headers), now)
            .expect("entry should be created");
        assert!(matches!(
            scheduler.request(eager, used(1), now),
            Ok(Admission::Queued { .. })
        ));

        let first_violation = scheduler.request(eager, used(1), now + Duration::seconds(10));
        assert!(matches!(
            first_violation,
            Err(ParqError::PolicyViolation { removed: false, early_by_secs: 50, .. })
        ));
        assert!(scheduler.entry(eager).expect("entry").ban_until().is_some());

        let second_violation = scheduler.request(eager, used(1), now + Duration::seconds(20));
        assert!(matches!(
            second_violation,
            Err(ParqError::PolicyViolation { removed: true, .. })
        ));
        assert!(scheduler.entry(eager).is_none());
        assert!(scheduler.find(ip(2), "f").is_none());
    }

    #[test]
    fn early_request_answering_our_callback_is_accepted() {
        let mut scheduler = scheduler_with(single_slot_config());
        let headers = HeaderMap::new();
        let now = start_time();

        let holder = scheduler
            .resolve(&request(ip(1), "f", MIB, &headers), now)
            .expect("entry should be created");
        scheduler.mark_granted(holder).expect("grant should succeed");
        let waiting = scheduler
            .resolve(&request(ip(2), "f", MIB, &headers), now)
            .expect("entry should be created");
        scheduler
            .request(waiting, used(1), now)
            .expect("first request should be queued");

        let answer = RequestContext {
            answering_callback: true,
            ..used(1)
        };
        assert!(scheduler
            .request(waiting, answer, now + Duration::seconds(5))
            .is_ok());
    }

    #[test]
    fn releasing_a_slot_schedules_callback_for_next_waiting_entry() {
        let mut scheduler = scheduler_with(single_slot_config());
        let now = start_time();
        let holder_headers = queue_headers("10.9.0.1:6346");
        let waiting_headers = queue_headers("10.9.0.2:6346");

        let holder = scheduler
            .resolve(&request(ip(1), "f", MIB, &holder_headers), now)
            .expect("entry should be created");
        scheduler.mark_granted(holder).expect("grant should succeed");
        let waiting = scheduler
            .resolve(&request(ip(2), "f", MIB, &waiting_headers), now)
            .expect("entry should be created");

        let outcome = scheduler.release(holder, ReleasePhase::Finished, now);

        assert_eq!(outcome, ReleaseOutcome::Retained);
        assert_eq!(scheduler.pending_callbacks(), 1);
        assert!(scheduler.entry(waiting).expect("entry").flags().pending);
        let released = scheduler.entry(holder).expect("entry");
        assert!(!released.has_slot());
        assert!(released.had_slot());
        assert_eq!(released.retry_at(), now);
        assert_eq!(released.expire_at(), now + Duration::seconds(1));
        assert_eq!(scheduler.queue(1).expect("queue").active_uploads(), 0);
        assert_eq!(scheduler.source(ip(1)).expect("source").uploading(), 0);
    }

    #[test]
    fn repeated_disconnect_within_ban_window_removes_entry() {
        let mut scheduler = scheduler_with(single_slot_config());
        let headers = HeaderMap::new();
        let now = start_time();

        let handle = scheduler
            .resolve(&request(ip(1), "f", MIB, &headers), now)
            .expect("entry should be created");
        scheduler.mark_granted(handle).expect("grant should succeed");
        assert_eq!(
            scheduler.release(handle, ReleasePhase::Finished, now),
            ReleaseOutcome::Retained
        );

        scheduler.mark_granted(handle).expect("grant should succeed");
        assert_eq!(
            scheduler.release(handle, ReleasePhase::Finished, now + Duration::seconds(30)),
            ReleaseOutcome::Removed
        );
        assert!(scheduler.entry(handle).is_none());
        assert!(scheduler.source(ip(1)).is_none());
        assert_eq!(scheduler.queue(1).expect("queue").active_uploads(), 0);
    }

    #[test]
    fn keep_alive_and_busy_replies_leave_slot_untouched() {
        let mut scheduler = scheduler_with(single_slot_config());
        let headers = HeaderMap::new();
        let now = start_time();

        let handle = scheduler
            .resolve(&request(ip(1), "f", MIB, &headers), now)
            .expect("entry should be created");
        scheduler.mark_granted(handle).expect("grant should succeed");

        assert_eq!(
            scheduler.release(handle, ReleasePhase::KeepAliveIdle, now),
            ReleaseOutcome::Retained
        );
        assert_eq!(
            scheduler.release(handle, ReleasePhase::BusyReply, now),
            ReleaseOutcome::Retained
        );
        assert!(scheduler.entry(handle).expect("entry").has_slot());
    }

    #[test]
    fn ignored_callback_counts_as_refusal() {
        let mut scheduler = scheduler_with(single_slot_config());
        let headers = HeaderMap::new();
        let now = start_time();

        let handle = scheduler
            .resolve(&request(ip(1), "f", MIB, &headers), now)
            .expect("entry should be created");
        scheduler.release(handle, ReleasePhase::AwaitingCallbackReply, now);
        scheduler.release(handle, ReleasePhase::AwaitingCallbackReply, now);

        assert_eq!(scheduler.entry(handle).expect("entry").queue_refused(), 2);
    }

    #[test]
    fn forced_request_only_applies_when_regular_slots_are_exhausted() {
        let mut scheduler = scheduler_with(single_slot_config());
        let headers = HeaderMap::new();
        let now = start_time();

        let holder = scheduler
            .resolve(&request(ip(1), "f", MIB, &headers), now)
            .expect("entry should be created");

        assert!(!scheduler.request_force(holder, 0));
        assert!(scheduler.request_force(holder, 1));
    }

    #[test]
    fn force_remove_drops_entry_and_indexes() {
        let mut scheduler = scheduler_with(single_slot_config());
        let headers = HeaderMap::new();
        let now = start_time();

        let handle = scheduler
            .resolve(&request(ip(1), "f", MIB, &headers), now)
            .expect("entry should be created");
        let id = scheduler.entry(handle).expect("entry").id().to_owned();
        scheduler.force_remove(handle, now);

        assert!(scheduler.entry(handle).is_none());
        assert!(scheduler.find_by_id(&id).is_none());
        assert_eq!(
            scheduler.release(handle, ReleasePhase::Finished, now),
            ReleaseOutcome::NotQueued
        );
    }

    #[test]
    fn slot_holder_follow_up_requests_are_granted() {
        let mut scheduler = scheduler_with(single_slot_config());
        let headers = HeaderMap::new();
        let now = start_time();

        let holder = scheduler
            .resolve(&request(ip(1), "f", MIB, &headers), now)
            .expect("entry should be created");
        assert_eq!(
            scheduler.request(holder, used(0), now),
            Ok(Admission::Granted)
        );
        scheduler.mark_granted(holder).expect("grant should succeed");

        for offset in [5, 10, 20] {
            let idle_at = now + Duration::seconds(offset);
            assert_eq!(
                scheduler.release(holder, ReleasePhase::KeepAliveIdle, idle_at),
                ReleaseOutcome::Retained
            );
            assert_eq!(
                scheduler.request(holder, used(1), idle_at + Duration::seconds(5)),
                Ok(Admission::Granted)
            );
        }

        let entry = scheduler.entry(holder).expect("slot holder should stay queued");
        assert!(entry.has_slot());
        assert!(entry.ban_until().is_none());
        assert_eq!(scheduler.source(ip(1)).expect("source").uploading(), 1);
        assert_eq!(scheduler.used_slots(), 1);
    }

    #[test]
    fn per_source_cap_holds_across_grant_and_release_sequences() {
        let max_uploads = 4;
        let cap = 2;
        let mut scheduler = scheduler_with(SchedulerConfig {
            max_uploads,
            max_uploads_per_source: cap,
            ..single_slot_config()
        });
        let headers = HeaderMap::new();
        let start = start_time();
        let requests = [
            (ip(1), "a"),
            (ip(1), "b"),
            (ip(1), "c"),
            (ip(1), "d"),
            (ip(2), "e"),
        ];

        let mut handles: Vec<EntryHandle> = requests
            .iter()
            .map(|(address, name)| {
                scheduler
                    .resolve(&request(*address, name, MIB, &headers), start)
                    .expect("entry should be created")
            })
            .collect();

        let mut seed: u64 = 0x2545_F491;
        for step in 0..300_i64 {
            seed = seed
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            let index = (seed >> 33) as usize % handles.len();
            let now = start + Duration::seconds(step * 7);

            if scheduler.entry(handles[index]).is_none() {
                let (address, name) = requests[index];
                handles[index] = scheduler
                    .resolve(&request(address, name, MIB, &headers), now)
                    .expect("entry should be recreated");
            }
            let handle = handles[index];

            let used_slots: usize = [ip(1), ip(2)]
                .iter()
                .filter_map(|address| scheduler.source(*address))
                .map(|source| source.uploading())
                .sum();
            let free_slots = max_uploads as i64 - used_slots as i64;

            match (seed >> 40) % 5 {
                0 | 1 => {
                    if scheduler.may_grant(handle, free_slots) {
                        scheduler.mark_granted(handle).expect("grant should succeed");
                    }
                }
                2 | 3 => {
                    scheduler.release(handle, ReleasePhase::Finished, now);
                }
                _ => scheduler.force_remove(handle, now),
            }

            for address in [ip(1), ip(2)] {
                let Some(source) = scheduler.source(address) else {
                    continue;
                };
                let holders = source
                    .entries()
                    .iter()
                    .filter(|handle| {
                        scheduler
                            .entry(**handle)
                            .map_or(false, |entry| entry.has_slot())
                    })
                    .count();
                assert_eq!(source.uploading(), holders, "step {step}");
                assert!(source.uploading() <= cap, "step {step}");
                if source.uploading() == cap {
                    for waiting in source.entries() {
                        assert!(!scheduler.may_grant(*waiting, max_uploads as i64), "step {step}");
                    }
                }
            }
        }
    }
}
