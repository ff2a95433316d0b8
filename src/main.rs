use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use parqd::config::{AppConfig, ConfigSource};
use parqd::heartbeat::{Beat, Heartbeat};
use parqd::logging::{LogLevel, Logger, LoggerConfig};
use parqd::parq::persistent::PersistentScheduler;
use parqd::parq::remote::{DownloadBook, RemoteQueueTracker};
use parqd::parq::{Admission, SchedulerConfig, UplinkStatus};
use parqd::server::{ConnectionOrigin, PeerConnection, TcpCallbackTransport, TcpServer};
use parqd::shutdown::ShutdownHooks;
use parqd::storage::StorageFacade;
use parqd::utils::runtime::ensure_posix_or_exit;
use parqd::utils::startup_banner::print_startup_banner;
use parqd::wire::header::attribute_value;
use parqd::wire::headers::{HeaderLookup, HeaderMap};
use parqd::wire::queue_line::QUEUE_COMMAND;

const LOOP_PAUSE: Duration = Duration::from_millis(50);

/// Everything the main loop mutates.
struct Daemon {
    logger: Arc<Logger>,
    storage: StorageFacade,
    queues: PersistentScheduler,
    server: TcpServer,
    advertised: SocketAddr,
    transport: TcpCallbackTransport,
    tracker: RemoteQueueTracker,
    downloads: DownloadBook,
    outbound_bandwidth: Option<u64>,
    /// Header lines received so far on connections answering a callback.
    partial_requests: HashMap<u64, Vec<String>>,
    /// Callback connections whose request has been handled.
    answered_callbacks: HashSet<u64>,
}

fn main() {
    ensure_posix_or_exit();
    print_startup_banner();

    let (app_config, config_source) = load_config_or_exit();
    let log_level =
        LogLevel::from_config_value(&app_config.logging.level).unwrap_or_else(|| {
            eprintln!(
                "invalid logging.level '{}'. Allowed values: error, warn, info, debug, verbose",
                app_config.logging.level
            );
            process::exit(2);
        });

    let logger = Arc::new(Logger::new(LoggerConfig {
        min_level: log_level,
        human_friendly: app_config.logging.human_friendly,
    }));
    logger.log(
        LogLevel::Info,
        Some("main::config"),
        "Configuration loaded",
        Some(json!({ "source": config_source.describe() })),
    );

    let storage = StorageFacade::initialize(&app_config, &logger).unwrap_or_else(|error| {
        eprintln!("storage initialization error: {error}");
        process::exit(2);
    });
    let queues = PersistentScheduler::bootstrap(
        SchedulerConfig::from_app_config(&app_config),
        &storage,
        Arc::clone(&logger),
        Utc::now(),
    )
    .unwrap_or_else(|error| {
        eprintln!("queue bootstrap error: {error}");
        process::exit(2);
    });

    let server = TcpServer::from_app_config(&app_config).unwrap_or_else(|error| {
        eprintln!("server startup error: {error}");
        process::exit(2);
    });
    let advertised = server.advertised_addr().unwrap_or_else(|error| {
        eprintln!("server startup error: failed to read local address: {error}");
        process::exit(2);
    });
    logger.log(
        LogLevel::Info,
        Some("main::server"),
        &format!(
            "{} v{} started non-blocking TCP server",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ),
        Some(json!({
            "host": app_config.server.host,
            "port": app_config.server.port,
            "advertised_address": advertised.to_string()
        })),
    );

    let mut daemon = Daemon {
        logger: Arc::clone(&logger),
        storage,
        queues,
        server,
        advertised,
        transport: TcpCallbackTransport::new(Duration::from_millis(
            app_config.callbacks.connect_timeout_ms,
        )),
        tracker: RemoteQueueTracker::new(Arc::clone(&logger)),
        downloads: DownloadBook::new(),
        outbound_bandwidth: Some(app_config.uploads.outbound_bandwidth)
            .filter(|bandwidth| *bandwidth > 0),
        partial_requests: HashMap::new(),
        answered_callbacks: HashSet::new(),
    };

    let mut heartbeat = Heartbeat::from_app_config(&app_config).unwrap_or_else(|error| {
        eprintln!("heartbeat configuration error: {error}");
        process::exit(2);
    });
    logger.log(
        LogLevel::Info,
        Some("main::heartbeat"),
        "Heartbeat initialized",
        Some(heartbeat.initial_metadata_payload()),
    );
    if let Err(error) = heartbeat.start() {
        eprintln!("heartbeat start error: {error}");
        process::exit(2);
    }

    let shutdown_hooks = ShutdownHooks::install().unwrap_or_else(|error| {
        eprintln!("failed to install shutdown hooks: {error}");
        process::exit(2);
    });
    logger.info(
        Some("main::shutdown"),
        "Shutdown hooks installed for SIGINT/SIGTERM",
    );

    while !shutdown_hooks.is_triggered() {
        if let Err(error) = daemon.accept_connections() {
            logger.error(Some("main::server"), &format!("accept failed: {error}"));
            shutdown_hooks.trigger();
            break;
        }
        daemon.serve_connections();
        for beat in heartbeat.poll() {
            daemon.run_maintenance(beat);
        }
        daemon.apply_callback_completions();
        thread::sleep(LOOP_PAUSE);
    }

    logger.info(
        Some("main::shutdown"),
        "Shutdown signal received, starting graceful shutdown",
    );
    if let Err(error) = heartbeat.stop() {
        logger.warn(Some("main::shutdown"), &error.to_string());
    }
    daemon.persist("shutdown");
    daemon.server.shutdown_all_connections();
    logger.info(
        Some("main::shutdown"),
        "TCP server stopped and shutdown completed",
    );
}

fn load_config_or_exit() -> (AppConfig, ConfigSource) {
    match AppConfig::load_with_discovery(std::env::args().skip(1)) {
        Ok(loaded) => loaded,
        Err(error) => {
            eprintln!("configuration error: {error}");
            process::exit(2);
        }
    }
}

impl Daemon {
    fn accept_connections(&mut self) -> Result<(), parqd::server::ServerError> {
        while let Some(connection) = self.server.try_accept()? {
            self.logger.log(
                LogLevel::Debug,
                Some("main::server"),
                "Accepted TCP connection",
                Some(json!({
                    "connection_id": connection.id(),
                    "peer_addr": connection.peer_addr().to_string()
                })),
            );
        }
        Ok(())
    }

    fn serve_connections(&mut self) {
        for connection in self.server.connections() {
            loop {
                match connection.try_read_line() {
                    Ok(Some(line)) => {
                        if !self.handle_line(&connection, line) {
                            self.close(&connection);
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(error) => {
                        if error.kind() != io::ErrorKind::UnexpectedEof {
                            self.logger.debug(
                                Some("main::server"),
                                &format!(
                                    "read error on connection {}: {error}",
                                    connection.id()
                                ),
                            );
                        }
                        self.close(&connection);
                        break;
                    }
                }
            }
        }
    }

    /// Returns whether the connection stays open.
    fn handle_line(&mut self, connection: &PeerConnection, line: String) -> bool {
        if connection.origin() == ConnectionOrigin::Callback {
            return self.collect_callback_reply(connection, line);
        }

        if line.starts_with(QUEUE_COMMAND) {
            let peer_ip = connection.peer_addr().ip();
            match self.tracker.queue_ack(&line, peer_ip, &mut self.downloads) {
                Ok(Some(download)) => self.logger.log(
                    LogLevel::Info,
                    Some("main::remote"),
                    "QUEUE callback matched a waiting download",
                    Some(json!({
                        "download": download,
                        "peer_addr": connection.peer_addr().to_string()
                    })),
                ),
                Ok(None) => self.logger.debug(
                    Some("main::remote"),
                    &format!("QUEUE callback from {peer_ip} matched no waiting download"),
                ),
                Err(error) => self
                    .logger
                    .warn(Some("main::remote"), &error.to_string()),
            }
            return false;
        }

        self.logger.debug(
            Some("main::server"),
            &format!(
                "no transfer layer attached, closing connection {} from {}",
                connection.id(),
                connection.peer_addr()
            ),
        );
        false
    }

    /// Gathers the request a peer sends after our QUEUE line and runs it
    /// through admission for the queued entry it answers.
    fn collect_callback_reply(&mut self, connection: &PeerConnection, line: String) -> bool {
        let lines = self.partial_requests.entry(connection.id()).or_default();
        if !line.is_empty() {
            lines.push(line);
            return true;
        }

        let lines = self
            .partial_requests
            .remove(&connection.id())
            .unwrap_or_default();
        self.answered_callbacks.insert(connection.id());
        let block = lines
            .iter()
            .skip(1)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\r\n");
        let headers = HeaderMap::parse_block(&block);
        let asserted_id = headers
            .header("X-Queued")
            .and_then(|value| attribute_value(value, "ID"));

        let now = Utc::now();
        let scheduler = self.queues.scheduler_mut();
        let Some((handle, admission)) =
            scheduler.answer_callback(connection.peer_addr().ip(), asserted_id, 0, now)
        else {
            self.logger.debug(
                Some("main::callbacks"),
                &format!(
                    "callback connection {} answered for no known entry",
                    connection.id()
                ),
            );
            return false;
        };

        let standing = scheduler.standing_of(handle, now);
        match admission {
            Ok(admission) => self.logger.log(
                LogLevel::Info,
                Some("main::callbacks"),
                "Peer answered QUEUE callback",
                Some(json!({
                    "id": standing.as_ref().map(|standing| standing.id.clone()),
                    "granted": admission == Admission::Granted,
                    "position": standing.as_ref().map(|standing| standing.position),
                    "peer_addr": connection.peer_addr().to_string(),
                    "request": lines.first()
                })),
            ),
            Err(error) => self
                .logger
                .warn(Some("main::callbacks"), &error.to_string()),
        }
        false
    }

    fn close(&mut self, connection: &PeerConnection) {
        self.partial_requests.remove(&connection.id());
        let answered = self.answered_callbacks.remove(&connection.id());
        if connection.origin() == ConnectionOrigin::Callback && !answered {
            let peer_ip = connection.peer_addr().ip();
            if let Some(handle) = self
                .queues
                .scheduler_mut()
                .callback_unanswered(peer_ip, Utc::now())
            {
                self.logger.debug(
                    Some("main::callbacks"),
                    &format!(
                        "peer {peer_ip} closed callback connection without a request (entry {})",
                        handle.raw()
                    ),
                );
            }
        }
        self.server.drop_connection(connection.id());
    }

    fn run_maintenance(&mut self, beat: Beat) {
        let now = beat.emitted_at;
        let uplink = UplinkStatus {
            outbound_bandwidth: self.outbound_bandwidth,
            registered_uploads: self.server.connection_count(),
            ..self.queues.scheduler().uplink()
        };

        let scheduler = self.queues.scheduler_mut();
        scheduler.update_uplink(uplink);
        let report = scheduler.tick(now);
        if report.skipped_startup {
            return;
        }

        let started = scheduler.dispatch_callbacks(now, &mut self.transport, self.advertised);
        if report.expired > 0 || report.callbacks_scheduled > 0 || started > 0 {
            self.logger.log(
                LogLevel::Verbose,
                Some("main::heartbeat"),
                "Queue maintenance tick",
                Some(json!({
                    "beat": beat.number,
                    "expired": report.expired,
                    "callbacks_scheduled": report.callbacks_scheduled,
                    "callbacks_started": started,
                    "retired_queues": report.retired_queues,
                    "entries": scheduler.entry_count()
                })),
            );
        }

        if report.save_due {
            self.persist("periodic");
        }
    }

    fn apply_callback_completions(&mut self) {
        for completion in self.transport.drain() {
            if let Some(stream) = completion.stream {
                if let Err(error) = self.server.adopt(stream) {
                    self.logger.warn(
                        Some("main::callbacks"),
                        &format!("could not keep callback connection open: {error}"),
                    );
                }
            }
            self.queues.scheduler_mut().on_callback_outcome(completion.outcome);
        }
    }

    fn persist(&self, reason: &str) {
        match self.queues.persist_current_state(&self.storage, Utc::now()) {
            Ok(written) => self.logger.log(
                LogLevel::Debug,
                Some("main::persistence"),
                "Queue state persisted",
                Some(json!({ "reason": reason, "entries": written })),
            ),
            Err(error) => self.logger.error(
                Some("main::persistence"),
                &format!("queue persistence failed ({reason}): {error}"),
            ),
        }
    }
}
