//! Plain-text recovery file: one block of `TAG: value` lines per queued
//! entry, blocks separated by an empty line.
//!
//! ```text
//! QUEUE: 1
//! POS: 3
//! ENTERED: 1714564800
//! EXPIRE: 150
//! ID: 3F2A...
//! SIZE: 1048576
//! XIP: 10.9.0.1
//! XPORT: 6346
//! IP: 10.0.0.1
//! NAME: shared file.bin
//! ```
//!
//! `EXPIRE` is relative to the save time. `XIP: 0.0.0.0` with `XPORT: 0`
//! means the peer gave no callback address. `NAME` always closes a record.

use std::fs;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::parq::persistent::PersistedEntry;

use super::{LoadedEntries, StorageBackend, StorageError};

pub const RECOVERY_FILE_NAME: &str = "parq";
const HEADER: &str = "# THIS FILE IS AUTOMATICALLY GENERATED -- DO NOT EDIT";

pub struct RecoveryFileStorage {
    path: PathBuf,
}

impl RecoveryFileStorage {
    pub fn open(data_path: &Path) -> Self {
        Self {
            path: data_path.join(RECOVERY_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> StorageError {
        StorageError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl StorageBackend for RecoveryFileStorage {
    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn load_entries(&self) -> Result<LoadedEntries, StorageError> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(parse_records(&content)),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                Ok(LoadedEntries::default())
            }
            Err(source) => Err(self.io_error(source)),
        }
    }

    fn replace_entries(
        &self,
        entries: &[PersistedEntry],
        saved_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let content = render_records(entries, saved_at);
        let staging = self.path.with_extension("new");

        let mut file = fs::File::create(&staging).map_err(|source| self.io_error(source))?;
        file.write_all(content.as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(|source| self.io_error(source))?;
        drop(file);

        fs::rename(&staging, &self.path).map_err(|source| self.io_error(source))
    }
}

pub(crate) fn render_records(entries: &[PersistedEntry], saved_at: DateTime<Utc>) -> String {
    let mut out = format!("{HEADER}\n#\n# Saved on {}\n#\n\n", saved_at.to_rfc2822());

    for entry in entries {
        let (xip, xport) = match entry.contact {
            Some(contact) => (contact.ip(), contact.port()),
            None => (IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        };
        out.push_str(&format!(
            "QUEUE: {}\nPOS: {}\nENTERED: {}\nEXPIRE: {}\nID: {}\nSIZE: {}\n\
             XIP: {xip}\nXPORT: {xport}\nIP: {}\nNAME: {}\n\n",
            entry.queue_no,
            entry.position,
            entry.entered,
            entry.expire_in,
            entry.id,
            entry.size,
            entry.ip,
            entry.name
        ));
    }

    out
}

#[derive(Default)]
struct PartialRecord {
    queue_no: Option<usize>,
    position: Option<usize>,
    entered: Option<i64>,
    expire_in: Option<i64>,
    id: Option<String>,
    size: Option<u64>,
    xip: Option<IpAddr>,
    xport: Option<u16>,
    ip: Option<IpAddr>,
    error: Option<String>,
}

impl PartialRecord {
    fn number<T: FromStr>(&mut self, tag: &str, value: &str) -> Option<T> {
        match value.parse() {
            Ok(parsed) => Some(parsed),
            Err(_) => {
                self.error.get_or_insert_with(|| format!("bad {tag} value '{value}'"));
                None
            }
        }
    }

    fn finish(self, name: &str, line: usize) -> Result<PersistedEntry, StorageError> {
        let malformed = |detail: String| StorageError::MalformedRecord { line, detail };
        if let Some(detail) = self.error {
            return Err(malformed(detail));
        }

        let missing = |tag: &str| malformed(format!("missing {tag}"));
        let contact = match (self.xip, self.xport) {
            (Some(ip), Some(port)) if port != 0 && !ip.is_unspecified() => {
                Some(SocketAddr::new(ip, port))
            }
            _ => None,
        };

        Ok(PersistedEntry {
            queue_no: self.queue_no.ok_or_else(|| missing("QUEUE"))?,
            position: self.position.ok_or_else(|| missing("POS"))?,
            entered: self.entered.ok_or_else(|| missing("ENTERED"))?,
            expire_in: self.expire_in.ok_or_else(|| missing("EXPIRE"))?,
            id: self.id.ok_or_else(|| missing("ID"))?,
            size: self.size.ok_or_else(|| missing("SIZE"))?,
            contact,
            ip: self.ip.ok_or_else(|| missing("IP"))?,
            name: name.to_owned(),
        })
    }
}

pub(crate) fn parse_records(content: &str) -> LoadedEntries {
    let mut loaded = LoadedEntries::default();
    let mut record = PartialRecord::default();

    for (index, raw_line) in content.lines().enumerate() {
        let line = raw_line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((tag, value)) = line.split_once(':') else {
            record
                .error
                .get_or_insert_with(|| format!("line {} has no tag", index + 1));
            continue;
        };
        let value = value.strip_prefix(' ').unwrap_or(value);

        match tag {
            "QUEUE" => record.queue_no = record.number(tag, value.trim()),
            "POS" => record.position = record.number(tag, value.trim()),
            "ENTERED" => record.entered = record.number(tag, value.trim()),
            "EXPIRE" => record.expire_in = record.number(tag, value.trim()),
            "ID" => record.id = Some(value.trim().to_owned()),
            "SIZE" => record.size = record.number(tag, value.trim()),
            "XIP" => record.xip = record.number(tag, value.trim()),
            "XPORT" => record.xport = record.number(tag, value.trim()),
            "IP" => record.ip = record.number(tag, value.trim()),
            "NAME" => {
                let finished = std::mem::take(&mut record);
                match finished.finish(value, index + 1) {
                    Ok(entry) => loaded.entries.push(entry),
                    Err(error) => loaded.rejected.push(error),
                }
            }
            // Tags written by other versions are skipped.
            _ => {}
        }
    }

    loaded
}
