use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::logging::{LogLevel, Logger};
use crate::wire::header::scan_attribute;
use crate::wire::headers::HeaderLookup;

use super::entry::{CallbackFlags, EntryHandle, QueuedEntry};
use super::queues::{select_tier, EntryArena, SizeTieredQueue};
use super::source::SourceAggregate;
use super::{ParqError, ProtocolVersion, SchedulerConfig, UplinkStatus, UNKNOWN_ETA};

/// One incoming upload request, as seen by the queueing layer.
pub struct UploadRequest<'a> {
    pub remote_ip: IpAddr,
    pub name: &'a str,
    pub file_size: u64,
    pub headers: &'a dyn HeaderLookup,
}

/// Everything a caller may want to report about a queued entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueStanding {
    pub id: String,
    pub queue_no: usize,
    pub position: usize,
    pub relative_position: usize,
    /// Entries in the queue, dead ones included, as sent in `length=`.
    pub queue_size: usize,
    pub eta: u64,
    pub retry_in_secs: i64,
    pub lifetime_secs: i64,
    pub has_slot: bool,
    pub id_sent: bool,
}

/// Owner of every queue, entry and per-source aggregate.
pub struct Scheduler {
    pub(crate) config: SchedulerConfig,
    pub(crate) logger: Arc<Logger>,
    pub(crate) uplink: UplinkStatus,
    pub(crate) queues: Vec<SizeTieredQueue>,
    pub(crate) entries: EntryArena,
    pub(crate) request_counts: HashMap<EntryHandle, u32>,
    pub(crate) by_id: HashMap<String, EntryHandle>,
    pub(crate) by_request: HashMap<(IpAddr, String), EntryHandle>,
    pub(crate) sources: HashMap<IpAddr, SourceAggregate>,
    pub(crate) callbacks: VecDeque<EntryHandle>,
    pub(crate) ticks: u64,
    pub(crate) last_dead_scan: Option<DateTime<Utc>>,
    next_handle: u64,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, logger: Arc<Logger>) -> Self {
        Self {
            config,
            logger,
            uplink: UplinkStatus::default(),
            queues: vec![SizeTieredQueue::new()],
            entries: HashMap::new(),
            request_counts: HashMap::new(),
            by_id: HashMap::new(),
            by_request: HashMap::new(),
            sources: HashMap::new(),
            callbacks: VecDeque::new(),
            ticks: 0,
            last_dead_scan: None,
            next_handle: 1,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn uplink(&self) -> UplinkStatus {
        self.uplink
    }

    /// Throughput changes move every ETA.
    pub fn update_uplink(&mut self, status: UplinkStatus) {
        if self.uplink == status {
            return;
        }
        self.uplink = status;
        for tier in 0..self.queues.len() {
            self.recompute_eta(tier);
        }
    }

    /// Queues beyond the new slot count are deactivated on the next tick.
    pub fn set_max_uploads(&mut self, max_uploads: usize) {
        if self.config.max_uploads == max_uploads {
            return;
        }

        self.logger.log(
            LogLevel::Info,
            Some("parq::scheduler"),
            "Upload slot count changed",
            Some(json!({
                "previous": self.config.max_uploads,
                "current": max_uploads
            })),
        );
        self.config.max_uploads = max_uploads;
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    /// 1-based queue lookup.
    pub fn queue(&self, queue_no: usize) -> Option<&SizeTieredQueue> {
        queue_no.checked_sub(1).and_then(|index| self.queues.get(index))
    }

    pub fn entry(&self, handle: EntryHandle) -> Option<&QueuedEntry> {
        self.entries.get(&handle)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn source(&self, address: IpAddr) -> Option<&SourceAggregate> {
        self.sources.get(&address)
    }

    pub fn find(&self, address: IpAddr, name: &str) -> Option<EntryHandle> {
        self.by_request.get(&(address, name.to_owned())).copied()
    }

    pub fn find_by_id(&self, id: &str) -> Option<EntryHandle> {
        self.by_id.get(id).copied()
    }

    /// Upload slots currently held across all queues.
    pub fn used_slots(&self) -> usize {
        self.queues.iter().map(|queue| queue.active_uploads).sum()
    }

    pub fn pending_callbacks(&self) -> usize {
        self.callbacks.len()
    }

    /// Chooses the queue for a resource size, creating queues up to the slot
    /// count and reactivating the chosen one. Returns the 0-based index.
    pub fn select_queue(&mut self, file_size: u64) -> usize {
        let tier = select_tier(
            file_size,
            self.config.max_uploads,
            self.config.large_file_size,
        );

        while self.queues.len() < self.config.max_uploads.max(1) {
            self.queues.push(SizeTieredQueue::new());
        }

        let index = (tier - 1).min(self.queues.len() - 1);
        self.queues[index].active = true;
        index
    }

    /// Whether a new entry for `file_size` would be rejected. A full queue
    /// with dead entries gives up its oldest dead entry instead.
    pub fn is_queue_full(&mut self, file_size: u64) -> bool {
        let index = self.select_queue(file_size);
        let queue = &self.queues[index];
        if queue.size() < self.config.max_queue_size {
            return false;
        }

        let oldest_dead = queue.dead.front().copied();
        match oldest_dead {
            Some(oldest_dead) => {
                self.logger.debug(
                    Some("parq::scheduler"),
                    &format!(
                        "queue #{} full, evicting oldest dead entry to make room",
                        index + 1
                    ),
                );
                self.retire(oldest_dead);
                false
            }
            None => true,
        }
    }

    /// Finds the entry a request belongs to, creating one when needed.
    pub fn resolve(
        &mut self,
        request: &UploadRequest<'_>,
        now: DateTime<Utc>,
    ) -> Result<EntryHandle, ParqError> {
        let handle = match self
            .find_by_queued_id(request.headers)
            .or_else(|| self.find(request.remote_ip, request.name))
        {
            Some(handle) => handle,
            None => {
                if self.is_queue_full(request.file_size) {
                    let index = self.select_queue(request.file_size);
                    let size = self.queues[index].size();
                    self.logger.log(
                        LogLevel::Warn,
                        Some("parq::scheduler"),
                        "Rejecting request, queue is full",
                        Some(json!({
                            "queue_no": index + 1,
                            "size": size,
                            "remote_ip": request.remote_ip.to_string(),
                            "name": request.name
                        })),
                    );
                    return Err(ParqError::ResourceExhausted {
                        queue_no: index + 1,
                        size,
                    });
                }
                self.create_entry(request.remote_ip, request.name, request.file_size, now)
            }
        };

        self.refresh_from_request(handle, request);
        Ok(handle)
    }

    fn find_by_queued_id(&self, headers: &dyn HeaderLookup) -> Option<EntryHandle> {
        let queued = headers.header("X-Queued")?;
        let scan = scan_attribute(queued, "ID");
        if scan.malformed > 0 {
            self.logger.warn(
                Some("parq::headers"),
                &format!("X-Queued carries {} malformed ID attribute(s)", scan.malformed),
            );
        }

        let Some(id) = scan.value else {
            let error = ParqError::ProtocolMalformed {
                detail: format!("X-Queued without ID: '{queued}'"),
            };
            self.logger.warn(Some("parq::headers"), &error.to_string());
            return None;
        };

        let handle = self.find_by_id(id)?;
        let entry = self.entries.get(&handle)?;
        if entry.had_slot {
            return None;
        }
        Some(handle)
    }

    fn refresh_from_request(&mut self, handle: EntryHandle, request: &UploadRequest<'_>) {
        let Some(tier) = self.entries.get(&handle).map(|entry| entry.tier) else {
            return;
        };

        self.queues[tier].remove_dead(handle);
        self.rekey_request(handle, request.remote_ip, request.name);

        let revived = match self.entries.get_mut(&handle) {
            Some(entry) if !entry.alive => {
                entry.alive = true;
                true
            }
            _ => false,
        };
        if revived {
            self.queues[tier].rerank(&mut self.entries);
            self.recompute_eta(tier);
            self.logger.debug(
                Some("parq::scheduler"),
                &format!("revived dead entry in queue #{}", tier + 1),
            );
        }

        let version = request
            .headers
            .header("X-Queue")
            .and_then(ProtocolVersion::parse)
            .unwrap_or(ProtocolVersion::NONE);
        let contact = if version.major >= 1 {
            request
                .headers
                .header("X-Node")
                .or_else(|| request.headers.header("X-Listen-IP"))
                .and_then(parse_contact)
        } else {
            None
        };

        if let Some(entry) = self.entries.get_mut(&handle) {
            entry.version = version;
            if let Some(contact) = contact {
                entry.contact = Some(contact);
                entry.flags.unreachable = false;
            }
        }
    }

    /// Keeps the (address, name) index in step with the latest request.
    fn rekey_request(&mut self, handle: EntryHandle, address: IpAddr, name: &str) {
        let Some(entry) = self.entries.get_mut(&handle) else {
            return;
        };
        if entry.lookup_ip == address && entry.name == name {
            return;
        }

        let old_key = (entry.lookup_ip, entry.name.clone());
        if self.by_request.get(&old_key) == Some(&handle) {
            self.by_request.remove(&old_key);
        }

        entry.lookup_ip = address;
        entry.name = name.to_owned();
        self.by_request.insert((address, name.to_owned()), handle);
    }

    pub(crate) fn create_entry(
        &mut self,
        address: IpAddr,
        name: &str,
        file_size: u64,
        now: DateTime<Utc>,
    ) -> EntryHandle {
        let tier = self.select_queue(file_size);
        let handle = EntryHandle(self.next_handle);
        self.next_handle += 1;

        let eta = self.provisional_eta(tier);
        let id = Uuid::new_v4().simple().to_string().to_ascii_uppercase();

        let entry = QueuedEntry {
            handle,
            id: id.clone(),
            remote_ip: address,
            lookup_ip: address,
            name: name.to_owned(),
            file_size,
            chunk_size: 0,
            tier,
            position: 0,
            relative_position: 0,
            queue_position: 0,
            eta,
            entered_at: now,
            updated_at: now,
            retry_at: now,
            expire_at: now,
            ban_until: None,
            disconnect_penalty_until: None,
            last_queue_sent: None,
            queue_sent: 0,
            queue_refused: 0,
            alive: true,
            has_slot: false,
            had_slot: false,
            flags: CallbackFlags::default(),
            contact: None,
            version: ProtocolVersion::NONE,
        };

        self.entries.insert(handle, entry);
        self.queues[tier].by_position.push(handle);
        self.by_id.insert(id, handle);
        self.by_request.insert((address, name.to_owned()), handle);
        self.sources
            .entry(address)
            .or_insert_with(|| SourceAggregate::new(address))
            .entries
            .push(handle);

        self.queues[tier].rerank(&mut self.entries);
        self.schedule_retry(handle, now);
        self.recompute_eta(tier);

        if let Some(entry) = self.entries.get(&handle) {
            self.logger.log(
                LogLevel::Debug,
                Some("parq::scheduler"),
                "Queued new entry",
                Some(json!({
                    "id": entry.id,
                    "queue_no": tier + 1,
                    "position": entry.position,
                    "relative_position": entry.relative_position,
                    "remote_ip": address.to_string(),
                    "name": name,
                    "file_size": file_size
                })),
            );
        }

        handle
    }

    /// ETA a new entry inherits from the last entry of its queue.
    fn provisional_eta(&self, tier: usize) -> u64 {
        if self.config.max_uploads == 0 {
            return UNKNOWN_ETA;
        }

        let Some(previous) = self.queues[tier]
            .by_position
            .last()
            .and_then(|handle| self.entries.get(handle))
        else {
            return 0;
        };

        if !previous.alive {
            return previous.eta;
        }

        let transfer = match self.uplink.outbound_bandwidth {
            Some(bandwidth) if bandwidth > 0 => previous.file_size / bandwidth,
            _ => previous.file_size / self.config.max_uploads as u64,
        };
        previous.eta.saturating_add(transfer)
    }

    /// Seconds a client at reported `position` should wait before retrying.
    pub fn retry_delay_secs(&self, position: usize) -> i64 {
        let steps = position.max(1) as i64 - 1;
        (60 + 45 * steps).min(self.config.max_retry_delay_secs)
    }

    pub(crate) fn schedule_retry(&mut self, handle: EntryHandle, now: DateTime<Utc>) {
        let Some(position) = self.entries.get(&handle).map(|entry| entry.queue_position) else {
            return;
        };
        let delay = self.retry_delay_secs(position);
        let lifetime = self.config.min_lifetime_secs;

        if let Some(entry) = self.entries.get_mut(&handle) {
            entry.retry_at = now + Duration::seconds(delay);
            entry.expire_at = entry.retry_at + Duration::seconds(lifetime);
        }
    }

    /// Removes an entry and every reference to it.
    pub(crate) fn retire(&mut self, handle: EntryHandle) {
        let Some(entry) = self.entries.remove(&handle) else {
            return;
        };
        self.request_counts.remove(&handle);

        let queue = &mut self.queues[entry.tier];
        queue.by_position.retain(|existing| *existing != handle);
        queue.remove_dead(handle);
        if entry.has_slot {
            queue.active_uploads = queue.active_uploads.saturating_sub(1);
        }
        queue.rerank(&mut self.entries);

        self.callbacks.retain(|existing| *existing != handle);

        if let Some(source) = self.sources.get_mut(&entry.remote_ip) {
            source.remove(handle);
            if entry.has_slot {
                source.uploading = source.uploading.saturating_sub(1);
            }
            if source.total() == 0 {
                self.sources.remove(&entry.remote_ip);
            }
        }

        if self.by_id.get(&entry.id) == Some(&handle) {
            self.by_id.remove(&entry.id);
        }
        let request_key = (entry.lookup_ip, entry.name.clone());
        if self.by_request.get(&request_key) == Some(&handle) {
            self.by_request.remove(&request_key);
        }

        self.recompute_eta(entry.tier);

        self.logger.log(
            LogLevel::Debug,
            Some("parq::scheduler"),
            "Retired queued entry",
            Some(json!({
                "id": entry.id,
                "queue_no": entry.tier + 1,
                "was_alive": entry.alive,
                "remote_ip": entry.remote_ip.to_string(),
                "name": entry.name
            })),
        );
    }

    /// Moves an alive entry to the dead list, or retires it outright when
    /// dead entries are not kept.
    pub(crate) fn mark_dead(&mut self, handle: EntryHandle) {
        let Some(entry) = self.entries.get_mut(&handle) else {
            return;
        };
        if !entry.alive {
            return;
        }
        entry.alive = false;
        let tier = entry.tier;

        if !self.config.keep_dead_entries {
            self.retire(handle);
            return;
        }

        self.queues[tier].rerank(&mut self.entries);
        self.queues[tier].dead.push_back(handle);
        self.recompute_eta(tier);
    }

    pub fn standing(&self, address: IpAddr, name: &str, now: DateTime<Utc>) -> Option<QueueStanding> {
        self.find(address, name)
            .and_then(|handle| self.standing_of(handle, now))
    }

    pub fn standing_of(&self, handle: EntryHandle, now: DateTime<Utc>) -> Option<QueueStanding> {
        let entry = self.entries.get(&handle)?;
        let queue = &self.queues[entry.tier];

        Some(QueueStanding {
            id: entry.id.clone(),
            queue_no: entry.tier + 1,
            position: entry.queue_position,
            relative_position: entry.relative_position,
            queue_size: queue.size(),
            eta: entry.eta,
            retry_in_secs: (entry.retry_at - now).num_seconds(),
            lifetime_secs: (entry.expire_at - now).num_seconds(),
            has_slot: entry.has_slot,
            id_sent: entry.flags.id_sent,
        })
    }

    /// Whether the request is known to the queue without holding a slot.
    pub fn is_queued(&self, address: IpAddr, name: &str) -> bool {
        self.find(address, name)
            .and_then(|handle| self.entries.get(&handle))
            .map(|entry| !entry.has_slot)
            .unwrap_or(false)
    }
}

/// `ip:port` contact advertised by a peer; unspecified addresses and port 0
/// cannot be called back.
pub(crate) fn parse_contact(raw: &str) -> Option<SocketAddr> {
    let contact: SocketAddr = raw.trim().parse().ok()?;
    if contact.port() == 0 || contact.ip().is_unspecified() {
        return None;
    }
    Some(contact)
}
