use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};

use crate::config::AppConfig;

pub const MIN_INTERVAL_MS: u64 = 100;
pub const MAX_INTERVAL_MS: u64 = 10_000;

#[derive(Clone, Copy, Debug)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { interval_ms: 1_000 }
    }
}

#[derive(Debug)]
pub enum HeartbeatError {
    InvalidInterval { provided_ms: u64 },
    AlreadyRunning,
    JoinFailed,
}

impl fmt::Display for HeartbeatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInterval { provided_ms } => write!(
                f,
                "heartbeat interval must be between {MIN_INTERVAL_MS}ms and {MAX_INTERVAL_MS}ms, got {provided_ms}ms"
            ),
            Self::AlreadyRunning => write!(f, "heartbeat is already running"),
            Self::JoinFailed => write!(f, "heartbeat worker thread join failed"),
        }
    }
}

impl std::error::Error for HeartbeatError {}

/// One tick of the cadence; numbers start at 1 and never repeat.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Beat {
    pub number: u64,
    pub emitted_at: DateTime<Utc>,
}

/// Background cadence the main loop polls for beats.
pub struct Heartbeat {
    pub initiated_at: DateTime<Utc>,
    interval_ms: u64,
    stop_signal: Arc<AtomicBool>,
    beats: Option<Receiver<Beat>>,
    worker: Option<JoinHandle<()>>,
}

impl Heartbeat {
    pub fn new(config: HeartbeatConfig) -> Result<Self, HeartbeatError> {
        Self::validate_interval(config.interval_ms)?;

        Ok(Self {
            initiated_at: Utc::now(),
            interval_ms: config.interval_ms,
            stop_signal: Arc::new(AtomicBool::new(false)),
            beats: None,
            worker: None,
        })
    }

    pub fn from_app_config(app_config: &AppConfig) -> Result<Self, HeartbeatError> {
        Self::new(HeartbeatConfig {
            interval_ms: app_config.heartbeat.interval_ms,
        })
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn start(&mut self) -> Result<(), HeartbeatError> {
        if self.worker.is_some() {
            return Err(HeartbeatError::AlreadyRunning);
        }

        self.stop_signal.store(false, Ordering::SeqCst);
        let stop_signal = Arc::clone(&self.stop_signal);
        let interval_ms = self.interval_ms;
        let (tx, rx) = mpsc::channel();

        self.beats = Some(rx);
        self.worker = Some(thread::spawn(move || {
            let mut number = 0_u64;
            loop {
                thread::sleep(Duration::from_millis(interval_ms));
                if stop_signal.load(Ordering::SeqCst) {
                    break;
                }

                number += 1;
                let beat = Beat {
                    number,
                    emitted_at: Utc::now(),
                };
                if tx.send(beat).is_err() {
                    break;
                }
            }
        }));

        Ok(())
    }

    /// Beats produced since the previous poll, oldest first.
    pub fn poll(&self) -> Vec<Beat> {
        let Some(beats) = &self.beats else {
            return Vec::new();
        };

        let mut ready = Vec::new();
        loop {
            match beats.try_recv() {
                Ok(beat) => ready.push(beat),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        ready
    }

    pub fn stop(&mut self) -> Result<(), HeartbeatError> {
        self.stop_signal.store(true, Ordering::SeqCst);
        self.beats = None;

        if let Some(handle) = self.worker.take() {
            return handle.join().map_err(|_| HeartbeatError::JoinFailed);
        }

        Ok(())
    }

    pub fn initial_metadata_payload(&self) -> Value {
        json!({
            "initiated_at": self.initiated_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            "interval_ms": self.interval_ms
        })
    }

    fn validate_interval(interval_ms: u64) -> Result<(), HeartbeatError> {
        if (MIN_INTERVAL_MS..=MAX_INTERVAL_MS).contains(&interval_ms) {
            Ok(())
        } else {
            Err(HeartbeatError::InvalidInterval {
                provided_ms: interval_ms,
            })
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop_signal.store(true, Ordering::SeqCst);
        self.beats = None;
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}
