//! Outbound QUEUE callbacks and the periodic maintenance tick.

use std::io;
use std::net::{IpAddr, SocketAddr};

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use crate::logging::LogLevel;
use crate::wire::queue_line::QueueLine;

use super::entry::{EntryHandle, QueuedEntry};
use super::scheduler::Scheduler;
use super::{Admission, ParqError, ReleasePhase, RequestContext, SchedulerConfig};

/// One QUEUE notification to deliver to a queued peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallbackRequest {
    pub parq_id: String,
    pub target: SocketAddr,
    pub line: String,
}

/// Completion reported back by a [`CallbackTransport`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallbackOutcome {
    Delivered { parq_id: String },
    Failed { parq_id: String, reason: String },
}

/// Capability to open a connection to a peer and write one line to it.
pub trait CallbackTransport {
    /// Callback connections started but not yet completed.
    fn in_flight(&self) -> usize;

    /// Starts delivery. An error means the attempt could not even begin.
    fn start(&mut self, request: CallbackRequest) -> io::Result<()>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub skipped_startup: bool,
    pub expired: usize,
    pub callbacks_scheduled: usize,
    pub retired_queues: usize,
    pub save_due: bool,
}

fn callback_due(config: &SchedulerConfig, entry: &QueuedEntry, now: DateTime<Utc>) -> bool {
    let period = Duration::seconds(config.callback_period_secs);

    !entry.has_slot
        && !entry.flags.blocks_callback()
        && !entry.flags.sent
        && entry
            .last_queue_sent
            .map_or(true, |sent| now - sent > period)
        && entry.queue_sent < config.max_callback_attempts
        && entry.queue_refused < config.max_callback_refusals
}

impl Scheduler {
    /// Periodic maintenance: schedules callbacks for expired entries, lets
    /// silent entries die and keeps the queue list in step with the slot
    /// count.
    pub fn tick(&mut self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();

        self.ticks += 1;
        if self.ticks <= self.config.startup_delay_ticks {
            report.skipped_startup = true;
            return report;
        }

        let scan_dead = self.last_dead_scan.map_or(true, |last| {
            now - last >= Duration::seconds(self.config.dead_scan_interval_secs)
        });
        if scan_dead {
            self.last_dead_scan = Some(now);
        }

        let grace = Duration::seconds(self.config.expire_grace_secs);
        for tier in 0..self.queues.len() {
            let queue = &self.queues[tier];
            let mut due: Vec<EntryHandle> = Vec::new();

            if scan_dead {
                due.extend(queue.dead.iter().copied().filter(|handle| {
                    self.entries
                        .get(handle)
                        .map_or(false, |entry| callback_due(&self.config, entry, now))
                }));
            }
            due.extend(queue.by_rank.iter().copied().filter(|handle| {
                self.entries.get(handle).map_or(false, |entry| {
                    entry.expire_at <= now && callback_due(&self.config, entry, now)
                })
            }));

            for handle in due {
                if self.schedule_callback(handle) {
                    report.callbacks_scheduled += 1;
                }
            }

            let expired: Vec<EntryHandle> = self.queues[tier]
                .by_rank
                .iter()
                .copied()
                .filter(|handle| {
                    self.entries.get(handle).map_or(false, |entry| {
                        entry.alive
                            && entry.expire_at + grace < now
                            && !entry.has_slot
                            && !entry.flags.pending
                    })
                })
                .collect();

            for handle in expired {
                if let Some(entry) = self.entries.get(&handle) {
                    self.logger.log(
                        LogLevel::Debug,
                        Some("parq::callback"),
                        "Queued entry timed out",
                        Some(json!({
                            "id": entry.id,
                            "queue_no": tier + 1,
                            "position": entry.position,
                            "relative_position": entry.relative_position,
                            "remote_ip": entry.remote_ip.to_string(),
                            "name": entry.name
                        })),
                    );
                }
                self.mark_dead(handle);
                report.expired += 1;
            }
        }

        let max_uploads = self.config.max_uploads;
        for (index, queue) in self.queues.iter_mut().enumerate() {
            queue.active = index < max_uploads;
        }

        if self.queues.len() > 1 {
            let drained = self
                .queues
                .last()
                .map_or(false, |queue| !queue.active && queue.size() == 0);
            if drained {
                self.queues.pop();
                report.retired_queues = 1;
                self.logger.debug(
                    Some("parq::callback"),
                    &format!("destroyed drained queue #{}", self.queues.len() + 1),
                );
            }
        }

        let active_ticks = self.ticks - self.config.startup_delay_ticks;
        report.save_due = self.config.save_interval_ticks > 0
            && active_ticks % self.config.save_interval_ticks == 0;

        report
    }

    /// Appends an entry to the outbound callback FIFO. Returns whether it
    /// was queued.
    pub(crate) fn schedule_callback(&mut self, handle: EntryHandle) -> bool {
        let Some(entry) = self.entries.get_mut(&handle) else {
            return false;
        };
        if entry.flags.blocks_callback() {
            return false;
        }

        if entry.contact.is_none() {
            entry.flags.unreachable = true;
            self.logger.debug(
                Some("parq::callback"),
                &ParqError::CallbackUnreachable {
                    id: entry.id.clone(),
                }
                .to_string(),
            );
            return false;
        }

        entry.flags.pending = true;
        self.callbacks.push_back(handle);
        true
    }

    /// Drains the callback FIFO while the outbound connection budget allows.
    /// Returns how many deliveries were started.
    pub fn dispatch_callbacks(
        &mut self,
        now: DateTime<Utc>,
        transport: &mut dyn CallbackTransport,
        advertised: SocketAddr,
    ) -> usize {
        if self.uplink.library_rebuilding {
            return 0;
        }

        let mut started = 0;
        while self.uplink.registered_uploads + transport.in_flight()
            < self.config.max_outbound_connections
        {
            let Some(handle) = self.callbacks.pop_front() else {
                break;
            };
            let Some(entry) = self.entries.get_mut(&handle) else {
                continue;
            };
            entry.flags.pending = false;

            let Some(target) = entry.contact else {
                entry.flags.unreachable = true;
                continue;
            };

            entry.last_queue_sent = Some(now);
            entry.queue_sent += 1;
            let attempt = entry.queue_sent;
            let request = CallbackRequest {
                parq_id: entry.id.clone(),
                target,
                line: QueueLine::new(entry.id.clone(), advertised).encode(),
            };

            match transport.start(request) {
                Ok(()) => {
                    started += 1;
                    self.logger.log(
                        LogLevel::Debug,
                        Some("parq::callback"),
                        "Sending QUEUE callback",
                        Some(json!({
                            "id": entry.id,
                            "attempt": attempt,
                            "target": target.to_string(),
                            "name": entry.name
                        })),
                    );
                }
                Err(error) => {
                    entry.flags.unreachable = true;
                    self.logger.log(
                        LogLevel::Warn,
                        Some("parq::callback"),
                        "Could not start QUEUE callback",
                        Some(json!({
                            "id": entry.id,
                            "attempt": attempt,
                            "target": target.to_string(),
                            "error": error.to_string()
                        })),
                    );
                }
            }
        }

        started
    }

    /// Applies a completion reported by the transport. Completions for
    /// entries that no longer exist are dropped.
    pub fn on_callback_outcome(&mut self, outcome: CallbackOutcome) {
        let parq_id = match &outcome {
            CallbackOutcome::Delivered { parq_id } | CallbackOutcome::Failed { parq_id, .. } => {
                parq_id
            }
        };

        let Some(entry) = self
            .by_id
            .get(parq_id.as_str())
            .copied()
            .and_then(|handle| self.entries.get_mut(&handle))
        else {
            self.logger.debug(
                Some("parq::callback"),
                &format!("discarding stale callback completion for {parq_id}"),
            );
            return;
        };

        match outcome {
            CallbackOutcome::Delivered { .. } => {
                entry.flags.sent = true;
            }
            CallbackOutcome::Failed { reason, .. } => {
                entry.flags.unreachable = true;
                let error = ParqError::CallbackUnreachable {
                    id: entry.id.clone(),
                };
                self.logger.log(
                    LogLevel::Warn,
                    Some("parq::callback"),
                    &error.to_string(),
                    Some(json!({ "reason": reason })),
                );
            }
        }
    }

    /// Matches a connection a peer opened in answer to our QUEUE line,
    /// first by the identifier it presents, then by an entry from the same
    /// address still waiting for its answer.
    pub fn adopt_callback_reply(
        &self,
        peer_ip: IpAddr,
        asserted_id: Option<&str>,
    ) -> Option<EntryHandle> {
        if let Some(handle) = asserted_id.and_then(|id| self.find_by_id(id)) {
            return Some(handle);
        }

        self.sources.get(&peer_ip)?.entries.iter().copied().find(|handle| {
            self.entries
                .get(handle)
                .map_or(false, |entry| entry.flags.sent && !entry.has_slot)
        })
    }

    /// Runs the request a peer sent over a connection our QUEUE line
    /// opened. `None` when the connection matches no entry.
    pub fn answer_callback(
        &mut self,
        peer_ip: IpAddr,
        asserted_id: Option<&str>,
        chunk_size: u64,
        now: DateTime<Utc>,
    ) -> Option<(EntryHandle, Result<Admission, ParqError>)> {
        let handle = self.adopt_callback_reply(peer_ip, asserted_id)?;
        let context = RequestContext {
            used_slots: self.used_slots(),
            chunk_size,
            answering_callback: true,
        };
        Some((handle, self.request(handle, context, now)))
    }

    /// A connection our QUEUE line opened closed without a request; counts
    /// as a refusal for the entry waiting on it.
    pub fn callback_unanswered(
        &mut self,
        peer_ip: IpAddr,
        now: DateTime<Utc>,
    ) -> Option<EntryHandle> {
        let handle = self.adopt_callback_reply(peer_ip, None)?;
        self.release(handle, ReleasePhase::AwaitingCallbackReply, now);
        Some(handle)
    }
}
