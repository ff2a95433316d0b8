use std::fmt;
use std::net::SocketAddr;

pub const QUEUE_COMMAND: &str = "QUEUE";

/// One `QUEUE <id> <ip:port>` notification line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueLine {
    pub id: String,
    pub contact: Option<SocketAddr>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum QueueLineError {
    NotAQueueLine,
    MissingId,
    InvalidContact { raw: String },
}

impl fmt::Display for QueueLineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAQueueLine => write!(f, "line does not start with {QUEUE_COMMAND}"),
            Self::MissingId => write!(f, "{QUEUE_COMMAND} line carries no identifier"),
            Self::InvalidContact { raw } => {
                write!(f, "{QUEUE_COMMAND} line carries invalid address '{raw}'")
            }
        }
    }
}

impl std::error::Error for QueueLineError {}

impl QueueLine {
    pub fn new(id: impl Into<String>, contact: SocketAddr) -> Self {
        Self {
            id: id.into(),
            contact: Some(contact),
        }
    }

    /// Wire form, terminated by CRLF.
    pub fn encode(&self) -> String {
        match self.contact {
            Some(contact) => format!("{QUEUE_COMMAND} {} {contact}\r\n", self.id),
            None => format!("{QUEUE_COMMAND} {}\r\n", self.id),
        }
    }

    pub fn parse(line: &str) -> Result<Self, QueueLineError> {
        let line = line.trim_end_matches(|c: char| c == '\r' || c == '\n');
        let rest = line
            .strip_prefix(QUEUE_COMMAND)
            .filter(|rest| rest.is_empty() || rest.starts_with(' '))
            .ok_or(QueueLineError::NotAQueueLine)?;

        let mut parts = rest.split_whitespace();
        let id = parts.next().ok_or(QueueLineError::MissingId)?;
        let contact = match parts.next() {
            Some(raw) => Some(
                raw.parse::<SocketAddr>()
                    .map_err(|_| QueueLineError::InvalidContact {
                        raw: raw.to_owned(),
                    })?,
            ),
            None => None,
        };

        Ok(Self {
            id: id.to_owned(),
            contact,
        })
    }
}
