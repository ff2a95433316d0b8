use chrono::{DateTime, Utc};

use super::entry::EntryHandle;
use super::scheduler::Scheduler;
use super::ProtocolVersion;

fn seconds_until(moment: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (moment - now).num_seconds().max(0)
}

impl Scheduler {
    /// Reply headers telling a queued peer where it stands.
    ///
    /// Peers speaking the legacy 0.1 protocol and queued actively get the
    /// single `X-Queue` form. Everybody else gets `X-Queue`, `X-Queued` and
    /// `Retry-After`, shortened to the identifier and lifetime when the full
    /// block would not fit in `max_len` bytes. Returns `None` when the entry
    /// is unknown or currently holds a slot.
    pub fn queued_reply_headers(
        &mut self,
        handle: EntryHandle,
        actively: bool,
        max_len: usize,
        now: DateTime<Utc>,
    ) -> Option<String> {
        let entry = self.entries.get(&handle)?;
        if entry.has_slot {
            return None;
        }

        let length = self.queues[entry.tier].size();
        let retry_in = seconds_until(entry.retry_at, now);
        let lifetime = seconds_until(entry.expire_at, now);

        if entry.version == ProtocolVersion::LEGACY && actively {
            return Some(format!(
                "X-Queue: position={}, length={length}, limit=1, pollMin={retry_in}, pollMax={lifetime}\r\n",
                entry.queue_position
            ));
        }

        let version = ProtocolVersion::CURRENT;
        let mut block = format!(
            "X-Queue: {version}\r\n\
             X-Queued: position={}; ID={}; length={length}; ETA={}; lifetime={lifetime}\r\n\
             Retry-After: {retry_in}\r\n",
            entry.queue_position, entry.id, entry.eta
        );
        if block.len() > max_len {
            block = format!(
                "X-Queue: {version}\r\nX-Queued: ID={}; lifetime={lifetime}\r\n",
                entry.id
            );
        }

        if let Some(entry) = self.entries.get_mut(&handle) {
            entry.flags.id_sent = true;
        }
        Some(block)
    }

    /// Identifier handed to a slot holder that understands queueing, so a
    /// broken transfer can resume without queueing again.
    pub fn granted_reply_headers(&mut self, handle: EntryHandle) -> Option<String> {
        let entry = self.entries.get_mut(&handle)?;
        if entry.version.major < 1 {
            return None;
        }

        entry.flags.id_sent = true;
        Some(format!(
            "X-Queue: {}\r\nX-Queued: ID={}\r\n",
            ProtocolVersion::CURRENT,
            entry.id
        ))
    }
}

#[cfg(test)]
mod tests {
    use crate::parq::scheduler::tests::{
        ip, request, scheduler_with, single_slot_config, start_time, MIB,
    };
    use crate::wire::header::{attribute_value, parse_leading_integer};
    use crate::wire::headers::{HeaderLookup, HeaderMap};

    #[test]
    fn current_protocol_reply_carries_position_id_and_retry() {
        let mut scheduler = scheduler_with(single_slot_config());
        let now = start_time();
        let headers = HeaderMap::new().with("X-Queue", "1.0");

        let holder = scheduler
            .resolve(&request(ip(1), "f", MIB, &headers), now)
            .expect("entry should be created");
        scheduler.mark_granted(holder).expect("grant should succeed");
        let waiting = scheduler
            .resolve(&request(ip(2), "f", MIB, &headers), now)
            .expect("entry should be created");

        let block = scheduler
            .queued_reply_headers(waiting, true, 512, now)
            .expect("queued entry should get headers");
        let reply = HeaderMap::parse_block(&block);
        let id = scheduler.entry(waiting).expect("entry").id().to_owned();

        assert_eq!(reply.header("X-Queue"), Some("1.0"));
        let queued = reply.header("X-Queued").expect("X-Queued should be present");
        assert_eq!(attribute_value(queued, "position"), Some("1"));
        assert_eq!(attribute_value(queued, "ID"), Some(id.as_str()));
        assert_eq!(attribute_value(queued, "length"), Some("2"));
        assert_eq!(
            parse_leading_integer(attribute_value(queued, "lifetime").expect("lifetime")),
            150
        );
        assert_eq!(reply.header("Retry-After"), Some("60"));
        assert!(scheduler.entry(waiting).expect("entry").flags().id_sent);
        assert!(scheduler.queued_reply_headers(holder, true, 512, now).is_none());
    }

    #[test]
    fn reported_length_counts_dead_entries_like_standing() {
        let mut scheduler = scheduler_with(single_slot_config());
        let now = start_time();
        let headers = HeaderMap::new().with("X-Queue", "1.0");

        let gone = scheduler
            .resolve(&request(ip(1), "f", MIB, &headers), now)
            .expect("entry should be created");
        let waiting = scheduler
            .resolve(&request(ip(2), "f", MIB, &headers), now)
            .expect("entry should be created");
        scheduler.mark_dead(gone);

        let block = scheduler
            .queued_reply_headers(waiting, true, 512, now)
            .expect("queued entry should get headers");
        let reply = HeaderMap::parse_block(&block);
        let queued = reply.header("X-Queued").expect("X-Queued should be present");
        let standing = scheduler.standing_of(waiting, now).expect("standing");

        assert_eq!(attribute_value(queued, "length"), Some("2"));
        assert_eq!(attribute_value(queued, "position"), Some("1"));
        assert_eq!(standing.queue_size, 2);
        assert_eq!(scheduler.queue(1).expect("queue").alive(), 1);
    }

    #[test]
    fn tight_budget_falls_back_to_short_form() {
        let mut scheduler = scheduler_with(single_slot_config());
        let now = start_time();
        let headers = HeaderMap::new().with("X-Queue", "1.0");
        let handle = scheduler
            .resolve(&request(ip(1), "f", MIB, &headers), now)
            .expect("entry should be created");

        let block = scheduler
            .queued_reply_headers(handle, true, 64, now)
            .expect("queued entry should get headers");
        let reply = HeaderMap::parse_block(&block);
        let queued = reply.header("X-Queued").expect("X-Queued should be present");

        assert!(attribute_value(queued, "ID").is_some());
        assert!(attribute_value(queued, "lifetime").is_some());
        assert!(attribute_value(queued, "position").is_none());
        assert!(reply.header("Retry-After").is_none());
    }

    #[test]
    fn legacy_peer_queued_actively_gets_poll_window() {
        let mut scheduler = scheduler_with(single_slot_config());
        let now = start_time();
        let headers = HeaderMap::new().with("X-Queue", "0.1");
        let handle = scheduler
            .resolve(&request(ip(1), "f", MIB, &headers), now)
            .expect("entry should be created");

        let block = scheduler
            .queued_reply_headers(handle, true, 512, now)
            .expect("queued entry should get headers");

        assert_eq!(
            block,
            "X-Queue: position=1, length=1, limit=1, pollMin=60, pollMax=150\r\n"
        );
        assert!(!scheduler.entry(handle).expect("entry").flags().id_sent);

        let passive = scheduler
            .queued_reply_headers(handle, false, 512, now)
            .expect("queued entry should get headers");
        assert!(passive.contains("X-Queued: position=1; ID="));
    }

    #[test]
    fn granted_reply_only_for_current_protocol_peers() {
        let mut scheduler = scheduler_with(single_slot_config());
        let now = start_time();
        let current = HeaderMap::new().with("X-Queue", "1.0");
        let plain = HeaderMap::new();

        let aware = scheduler
            .resolve(&request(ip(1), "f", MIB, &current), now)
            .expect("entry should be created");
        let unaware = scheduler
            .resolve(&request(ip(2), "f", MIB, &plain), now)
            .expect("entry should be created");

        let id = scheduler.entry(aware).expect("entry").id().to_owned();
        assert_eq!(
            scheduler.granted_reply_headers(aware),
            Some(format!("X-Queue: 1.0\r\nX-Queued: ID={id}\r\n"))
        );
        assert!(scheduler.granted_reply_headers(unaware).is_none());
    }
}
