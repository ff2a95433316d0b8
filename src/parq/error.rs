use std::fmt;

#[derive(Debug, PartialEq, Eq)]
pub enum ParqError {
    ProtocolMalformed {
        detail: String,
    },
    /// Request arrived before the advertised retry time.
    PolicyViolation {
        id: String,
        early_by_secs: i64,
        removed: bool,
    },
    ResourceExhausted {
        queue_no: usize,
        size: usize,
    },
    CallbackUnreachable {
        id: String,
    },
    UnknownEntry,
}

impl fmt::Display for ParqError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProtocolMalformed { detail } => {
                write!(f, "malformed queueing header: {detail}")
            }
            Self::PolicyViolation {
                id,
                early_by_secs,
                removed,
            } => {
                if *removed {
                    write!(
                        f,
                        "entry {id} requested {early_by_secs}s too early while banned and was removed"
                    )
                } else {
                    write!(f, "entry {id} requested {early_by_secs}s too early")
                }
            }
            Self::ResourceExhausted { queue_no, size } => {
                write!(f, "queue #{queue_no} is full ({size} entries)")
            }
            Self::CallbackUnreachable { id } => {
                write!(f, "entry {id} advertised no reachable callback address")
            }
            Self::UnknownEntry => write!(f, "queued entry no longer exists"),
        }
    }
}

impl std::error::Error for ParqError {}
