//! Client side: where our own downloads stand in other peers' queues.

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::logging::{LogLevel, Logger};
use crate::wire::header::{attribute_value, parse_leading_integer};
use crate::wire::headers::HeaderLookup;
use crate::wire::queue_line::QueueLine;

use super::{ParqError, ProtocolVersion};

pub type DownloadId = u64;

/// Seconds of retry delay added per queue position.
pub const RETRY_SECS_PER_POSITION: i64 = 30;
/// Retry at least this long before the remote lifetime runs out.
pub const RETRY_SAFETY_SECS: i64 = 40;
/// Lifetime used when a peer advertises one shorter than its retry delay.
pub const MIN_SANE_LIFETIME_SECS: u32 = 300;

/// Latest queue status a remote peer reported for one of our downloads.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemoteQueueStatus {
    pub version: ProtocolVersion,
    pub position: u32,
    pub length: u32,
    pub eta: u32,
    pub lifetime: u32,
    pub retry_delay: u32,
    pub id: Option<String>,
}

impl RemoteQueueStatus {
    /// Seconds to wait before asking again: 30 s per position, never before
    /// the advertised retry delay, and comfortably before the lifetime ends.
    pub fn next_retry_secs(&self) -> u32 {
        let mut retry = i64::from(self.position) * RETRY_SECS_PER_POSITION;
        let latest = i64::from(self.lifetime) - RETRY_SAFETY_SECS;
        if retry > latest {
            retry = latest;
        }
        if retry < i64::from(self.retry_delay) {
            retry = i64::from(self.retry_delay);
        }
        u32::try_from(retry.max(0)).unwrap_or(u32::MAX)
    }
}

/// What the download layer knows about its downloads, as needed to match
/// inbound QUEUE callbacks.
pub trait DownloadDirectory {
    /// Downloads waiting on `server`, oldest first.
    fn waiting_on(&self, server: SocketAddr) -> Vec<DownloadId>;
    fn is_running(&self, download: DownloadId) -> bool;
    fn redirect(&mut self, download: DownloadId, server: SocketAddr);
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct BookedDownload {
    server: SocketAddr,
    running: bool,
}

/// In-memory [`DownloadDirectory`].
#[derive(Clone, Debug, Default)]
pub struct DownloadBook {
    downloads: BTreeMap<DownloadId, BookedDownload>,
}

impl DownloadBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, download: DownloadId, server: SocketAddr) {
        self.downloads.insert(
            download,
            BookedDownload {
                server,
                running: false,
            },
        );
    }

    pub fn set_running(&mut self, download: DownloadId, running: bool) {
        if let Some(booked) = self.downloads.get_mut(&download) {
            booked.running = running;
        }
    }

    pub fn server_of(&self, download: DownloadId) -> Option<SocketAddr> {
        self.downloads.get(&download).map(|booked| booked.server)
    }

    pub fn remove(&mut self, download: DownloadId) {
        self.downloads.remove(&download);
    }

    pub fn len(&self) -> usize {
        self.downloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.downloads.is_empty()
    }
}

impl DownloadDirectory for DownloadBook {
    fn waiting_on(&self, server: SocketAddr) -> Vec<DownloadId> {
        self.downloads
            .iter()
            .filter(|(_, booked)| booked.server == server && !booked.running)
            .map(|(download, _)| *download)
            .collect()
    }

    fn is_running(&self, download: DownloadId) -> bool {
        self.downloads
            .get(&download)
            .map_or(false, |booked| booked.running)
    }

    fn redirect(&mut self, download: DownloadId, server: SocketAddr) {
        if let Some(booked) = self.downloads.get_mut(&download) {
            booked.server = server;
        }
    }
}

/// `Retry-After` carries either delta seconds or an HTTP date.
pub fn parse_retry_after(raw: &str, now: DateTime<Utc>) -> u32 {
    let raw = raw.trim();
    if raw.starts_with(|c: char| c.is_ascii_digit()) {
        return parse_leading_integer(raw);
    }

    match DateTime::parse_from_rfc2822(raw) {
        Ok(moment) => {
            let delta = (moment.with_timezone(&Utc) - now).num_seconds().max(0);
            u32::try_from(delta).unwrap_or(u32::MAX)
        }
        Err(_) => 0,
    }
}

fn integer_attribute(header: &str, attribute: &str) -> u32 {
    attribute_value(header, attribute)
        .map(parse_leading_integer)
        .unwrap_or(0)
}

pub struct RemoteQueueTracker {
    logger: Arc<Logger>,
    records: HashMap<DownloadId, RemoteQueueStatus>,
    by_id: HashMap<String, DownloadId>,
    server_versions: HashMap<SocketAddr, ProtocolVersion>,
}

impl RemoteQueueTracker {
    pub fn new(logger: Arc<Logger>) -> Self {
        Self {
            logger,
            records: HashMap::new(),
            by_id: HashMap::new(),
            server_versions: HashMap::new(),
        }
    }

    pub fn status(&self, download: DownloadId) -> Option<&RemoteQueueStatus> {
        self.records.get(&download)
    }

    pub fn find_by_id(&self, id: &str) -> Option<DownloadId> {
        self.by_id.get(id).copied()
    }

    pub fn tracked(&self) -> usize {
        self.records.len()
    }

    pub fn server_version(&self, server: SocketAddr) -> Option<ProtocolVersion> {
        self.server_versions.get(&server).copied()
    }

    /// Reads the queue status out of a busy reply. Returns the seconds to
    /// wait before retrying, or `None` when the peer does not queue at all.
    pub fn parse_queue_status(
        &mut self,
        download: DownloadId,
        server: SocketAddr,
        headers: &dyn HeaderLookup,
        now: DateTime<Utc>,
    ) -> Result<Option<u32>, ParqError> {
        let Some(queue_header) = headers.header("X-Queue") else {
            return Ok(None);
        };

        let version = ProtocolVersion::parse(queue_header).unwrap_or(ProtocolVersion::LEGACY);
        self.server_versions.insert(server, version);

        let mut status = self.records.get(&download).cloned().unwrap_or_default();
        status.version = version;

        let fields = match version.major {
            0 => {
                status.retry_delay = integer_attribute(queue_header, "pollMin");
                status.lifetime = integer_attribute(queue_header, "pollMax");
                queue_header
            }
            1 => {
                let Some(queued) = headers.header("X-Queued") else {
                    let error = ParqError::ProtocolMalformed {
                        detail: format!("{server} advertised queueing {version} without X-Queued"),
                    };
                    self.logger.warn(Some("parq::remote"), &error.to_string());
                    return Err(error);
                };

                status.lifetime = integer_attribute(queued, "lifetime");
                status.retry_delay = headers
                    .header("Retry-After")
                    .map(|raw| parse_retry_after(raw, now))
                    .unwrap_or(0);

                if status.lifetime < status.retry_delay {
                    status.lifetime = status.retry_delay.max(MIN_SANE_LIFETIME_SECS);
                    self.logger.warn(
                        Some("parq::remote"),
                        &format!("invalid lifetime from {server}, using {}", status.lifetime),
                    );
                }

                if let Some(id) = attribute_value(queued, "ID").filter(|id| !id.is_empty()) {
                    self.update_id(download, &mut status, id);
                }
                queued
            }
            _ => {
                let error = ParqError::ProtocolMalformed {
                    detail: format!("unhandled queueing version {version} from {server}"),
                };
                self.logger.warn(Some("parq::remote"), &error.to_string());
                return Err(error);
            }
        };

        status.position = integer_attribute(fields, "position");
        status.length = integer_attribute(fields, "length");
        status.eta = integer_attribute(fields, "ETA");

        let retry = status.next_retry_secs();
        self.logger.log(
            LogLevel::Debug,
            Some("parq::remote"),
            "Remote queue status updated",
            Some(json!({
                "download": download,
                "server": server.to_string(),
                "version": version.to_string(),
                "position": status.position,
                "length": status.length,
                "retry_in_secs": retry,
                "retry_delay": status.retry_delay,
                "lifetime": status.lifetime
            })),
        );

        self.records.insert(download, status);
        Ok(Some(retry))
    }

    fn update_id(&mut self, download: DownloadId, status: &mut RemoteQueueStatus, id: &str) {
        if status.id.as_deref() == Some(id) {
            return;
        }
        if let Some(previous) = status.id.take() {
            if self.by_id.get(&previous) == Some(&download) {
                self.by_id.remove(&previous);
            }
        }
        status.id = Some(id.to_owned());
        self.by_id.insert(id.to_owned(), download);
    }

    /// Headers to add to a request sent to `server`.
    pub fn request_headers(
        &self,
        download: DownloadId,
        server: SocketAddr,
        advertised: Option<SocketAddr>,
    ) -> String {
        let mut block = format!("X-Queue: {}\r\n", ProtocolVersion::CURRENT);

        let speaks_current = self
            .server_versions
            .get(&server)
            .map_or(false, |version| version.major == 1);
        if speaks_current {
            if let Some(status) = self.records.get(&download) {
                if let Some(id) = &status.id {
                    block.push_str(&format!(
                        "X-Queued: position={}; ID={id}\r\n",
                        status.position
                    ));
                }
            }
        }

        if let Some(advertised) = advertised.filter(|address| {
            address.port() != 0 && !address.ip().is_unspecified()
        }) {
            block.push_str(&format!("X-Node: {advertised}\r\n"));
        }

        block
    }

    /// Handles a QUEUE line a peer sent us. The identifier selects the
    /// download; failing that, a download waiting on the announced address
    /// without queue information adopts it. Returns the download to resume.
    pub fn queue_ack(
        &mut self,
        line: &str,
        peer_ip: IpAddr,
        directory: &mut dyn DownloadDirectory,
    ) -> Result<Option<DownloadId>, ParqError> {
        let queue_line = QueueLine::parse(line).map_err(|error| ParqError::ProtocolMalformed {
            detail: format!("{error} from {peer_ip}"),
        })?;

        let mut download = self.find_by_id(&queue_line.id);
        if download.is_none() {
            self.logger.warn(
                Some("parq::remote"),
                &format!("could not locate QUEUE id '{}' from {peer_ip}", queue_line.id),
            );

            if let Some(contact) = queue_line.contact {
                let elected = directory
                    .waiting_on(contact)
                    .into_iter()
                    .find(|candidate| !self.records.contains_key(candidate));
                if let Some(elected) = elected {
                    self.logger.log(
                        LogLevel::Info,
                        Some("parq::remote"),
                        "Elected untracked download for QUEUE callback",
                        Some(json!({
                            "download": elected,
                            "server": contact.to_string(),
                            "id": queue_line.id
                        })),
                    );
                    let mut status = RemoteQueueStatus::default();
                    self.update_id(elected, &mut status, &queue_line.id);
                    self.records.insert(elected, status);
                    download = Some(elected);
                }
            }
        }

        let Some(download) = download else {
            return Ok(None);
        };

        if directory.is_running(download) {
            self.logger.warn(
                Some("parq::remote"),
                &format!("QUEUE callback for download {download} which is already running"),
            );
            return Ok(None);
        }

        if let Some(contact) = queue_line.contact {
            directory.redirect(download, contact);
            let version = self
                .server_versions
                .entry(contact)
                .or_insert(ProtocolVersion::CURRENT);
            if *version < ProtocolVersion::CURRENT {
                *version = ProtocolVersion::CURRENT;
            }
        }

        Ok(Some(download))
    }

    /// Moves the queue record of `from` to its clone `to`.
    pub fn reparent(&mut self, from: DownloadId, to: DownloadId) {
        let Some(status) = self.records.remove(&from) else {
            return;
        };
        if let Some(id) = &status.id {
            self.by_id.insert(id.clone(), to);
        }
        self.records.insert(to, status);
    }

    /// Forgets a download that completed or was abandoned.
    pub fn remove(&mut self, download: DownloadId) {
        let Some(status) = self.records.remove(&download) else {
            return;
        };
        if let Some(id) = status.id {
            if self.by_id.get(&id) == Some(&download) {
                self.by_id.remove(&id);
            }
        }
    }

    /// Queued and keeping the connection open.
    pub fn is_active_queued(&self, download: DownloadId, keep_alive: bool) -> bool {
        keep_alive && self.position(download) > 0
    }

    /// Queued and expected to reconnect later.
    pub fn is_passive_queued(&self, download: DownloadId, keep_alive: bool) -> bool {
        !keep_alive && self.position(download) > 0
    }

    fn position(&self, download: DownloadId) -> u32 {
        self.records
            .get(&download)
            .map_or(0, |status| status.position)
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use chrono::Duration;

    use crate::parq::scheduler::tests::{quiet_logger, start_time};
    use crate::parq::{ParqError, ProtocolVersion};
    use crate::wire::headers::HeaderMap;

    use super::{
        parse_retry_after, DownloadBook, DownloadDirectory, RemoteQueueStatus, RemoteQueueTracker,
    };

    fn server() -> SocketAddr {
        "198.51.100.4:6346".parse().expect("address should parse")
    }

    fn tracker() -> RemoteQueueTracker {
        RemoteQueueTracker::new(quiet_logger())
    }

    #[test]
    fn current_protocol_status_is_tracked_with_identifier() {
        let mut tracker = tracker();
        let headers = HeaderMap::new()
            .with("X-Queue", "1.0")
            .with(
                "X-Queued",
                "position=4; ID=C0FFEE00112233445566778899AABBCC; length=9; ETA=300; lifetime=600",
            )
            .with("Retry-After", "60");

        let retry = tracker
            .parse_queue_status(7, server(), &headers, start_time())
            .expect("status should parse");

        assert_eq!(retry, Some(120));
        let status = tracker.status(7).expect("download should be tracked");
        assert_eq!(status.position, 4);
        assert_eq!(status.length, 9);
        assert_eq!(status.eta, 300);
        assert_eq!(status.lifetime, 600);
        assert_eq!(status.retry_delay, 60);
        assert_eq!(
            tracker.find_by_id("C0FFEE00112233445566778899AABBCC"),
            Some(7)
        );
        assert_eq!(tracker.server_version(server()), Some(ProtocolVersion::CURRENT));
    }

    #[test]
    fn legacy_status_reads_poll_window_from_x_queue() {
        let mut tracker = tracker();
        let headers = HeaderMap::new().with(
            "X-Queue",
            "position=2, length=5, limit=1, pollMin=45, pollMax=120",
        );

        let retry = tracker
            .parse_queue_status(1, server(), &headers, start_time())
            .expect("status should parse");

        assert_eq!(retry, Some(60));
        let status = tracker.status(1).expect("download should be tracked");
        assert_eq!(status.version, ProtocolVersion::LEGACY);
        assert_eq!(status.retry_delay, 45);
        assert_eq!(status.lifetime, 120);
        assert!(status.id.is_none());
    }

    #[test]
    fn missing_x_queued_under_current_protocol_is_malformed() {
        let mut tracker = tracker();
        let headers = HeaderMap::new().with("X-Queue", "1.0");

        let result = tracker.parse_queue_status(1, server(), &headers, start_time());

        assert!(matches!(result, Err(ParqError::ProtocolMalformed { .. })));
        assert!(tracker.status(1).is_none());
        assert_eq!(
            tracker
                .parse_queue_status(1, server(), &HeaderMap::new(), start_time())
                .expect("plain busy reply should parse"),
            None
        );
    }

    #[test]
    fn short_lifetime_is_clamped_upwards() {
        let mut tracker = tracker();
        let headers = HeaderMap::new()
            .with("X-Queue", "1.0")
            .with("X-Queued", "position=1; ID=AB; lifetime=10")
            .with("Retry-After", "90");

        let retry = tracker
            .parse_queue_status(3, server(), &headers, start_time())
            .expect("status should parse");

        assert_eq!(tracker.status(3).expect("tracked").lifetime, 300);
        assert_eq!(retry, Some(90));
    }

    #[test]
    fn retry_is_clamped_into_the_allowed_window() {
        let far_back = RemoteQueueStatus {
            position: 50,
            lifetime: 600,
            retry_delay: 60,
            ..RemoteQueueStatus::default()
        };
        assert_eq!(far_back.next_retry_secs(), 560);

        let front = RemoteQueueStatus {
            position: 1,
            lifetime: 600,
            retry_delay: 60,
            ..RemoteQueueStatus::default()
        };
        assert_eq!(front.next_retry_secs(), 60);
    }

    #[test]
    fn retry_after_accepts_seconds_and_http_dates() {
        let now = start_time();
        assert_eq!(parse_retry_after("120", now), 120);
        assert_eq!(parse_retry_after("Wed, 01 May 2024 12:05:00 GMT", now), 300);
        assert_eq!(parse_retry_after("Wed, 01 May 2024 11:00:00 GMT", now), 0);
        assert_eq!(parse_retry_after("soon", now), 0);
        assert_eq!(
            parse_retry_after(&(now + Duration::seconds(30)).to_rfc2822(), now),
            30
        );
    }

    #[test]
    fn request_headers_include_identifier_and_contact() {
        let mut tracker = tracker();
        let advertised: SocketAddr = "203.0.113.9:6346".parse().expect("address should parse");
        assert_eq!(
            tracker.request_headers(1, server(), Some(advertised)),
            "X-Queue: 1.0\r\nX-Node: 203.0.113.9:6346\r\n"
        );

        let headers = HeaderMap::new()
            .with("X-Queue", "1.0")
            .with("X-Queued", "position=3; ID=ABCD; lifetime=600")
            .with("Retry-After", "60");
        tracker
            .parse_queue_status(1, server(), &headers, start_time())
            .expect("status should parse");

        let unspecified: SocketAddr = "0.0.0.0:6346".parse().expect("address should parse");
        assert_eq!(
            tracker.request_headers(1, server(), Some(unspecified)),
            "X-Queue: 1.0\r\nX-Queued: position=3; ID=ABCD\r\n"
        );
    }

    #[test]
    fn queue_callback_matches_by_identifier_or_adopts_waiting_download() {
        let mut tracker = tracker();
        let mut book = DownloadBook::new();
        book.add(1, server());
        book.add(2, server());
        let headers = HeaderMap::new()
            .with("X-Queue", "1.0")
            .with("X-Queued", "position=3; ID=AAAA; lifetime=600")
            .with("Retry-After", "60");
        tracker
            .parse_queue_status(1, server(), &headers, start_time())
            .expect("status should parse");

        let peer = server().ip();
        let by_id = tracker
            .queue_ack("QUEUE AAAA 198.51.100.4:6346\r\n", peer, &mut book)
            .expect("line should parse");
        assert_eq!(by_id, Some(1));

        let moved: SocketAddr = "198.51.100.4:7000".parse().expect("address should parse");
        book.add(3, moved);
        let elected = tracker
            .queue_ack("QUEUE BBBB 198.51.100.4:7000", peer, &mut book)
            .expect("line should parse");
        assert_eq!(elected, Some(3));
        assert_eq!(tracker.find_by_id("BBBB"), Some(3));

        book.set_running(1, true);
        assert_eq!(
            tracker
                .queue_ack("QUEUE AAAA 198.51.100.4:6346", peer, &mut book)
                .expect("line should parse"),
            None
        );

        let unknown_peer: SocketAddr = "192.0.2.50:6346".parse().expect("address should parse");
        assert_eq!(
            tracker
                .queue_ack("QUEUE CCCC 192.0.2.50:6346", unknown_peer.ip(), &mut book)
                .expect("line should parse"),
            None
        );
        assert!(tracker
            .queue_ack("HELLO", peer, &mut book)
            .is_err());
    }

    #[test]
    fn redirect_follows_the_announced_address() {
        let mut tracker = tracker();
        let mut book = DownloadBook::new();
        book.add(5, server());
        let headers = HeaderMap::new()
            .with("X-Queue", "1.0")
            .with("X-Queued", "position=1; ID=FEED; lifetime=600");
        tracker
            .parse_queue_status(5, server(), &headers, start_time())
            .expect("status should parse");

        let moved: SocketAddr = "198.51.100.77:6346".parse().expect("address should parse");
        tracker
            .queue_ack("QUEUE FEED 198.51.100.77:6346", moved.ip(), &mut book)
            .expect("line should parse");

        assert_eq!(book.server_of(5), Some(moved));
        assert!(book.waiting_on(moved).contains(&5));
        assert_eq!(tracker.server_version(moved), Some(ProtocolVersion::CURRENT));
    }

    #[test]
    fn reparent_moves_record_and_remove_forgets_it() {
        let mut tracker = tracker();
        let headers = HeaderMap::new()
            .with("X-Queue", "1.0")
            .with("X-Queued", "position=2; ID=1234; lifetime=600");
        tracker
            .parse_queue_status(10, server(), &headers, start_time())
            .expect("status should parse");

        tracker.reparent(10, 11);
        assert!(tracker.status(10).is_none());
        assert_eq!(tracker.find_by_id("1234"), Some(11));
        assert!(tracker.is_active_queued(11, true));
        assert!(tracker.is_passive_queued(11, false));
        assert!(!tracker.is_active_queued(10, true));

        tracker.remove(11);
        assert_eq!(tracker.tracked(), 0);
        assert!(tracker.find_by_id("1234").is_none());
    }
}
