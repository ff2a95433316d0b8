use std::net::IpAddr;

use super::entry::EntryHandle;

/// Everything a single remote address currently has queued.
#[derive(Clone, Debug)]
pub struct SourceAggregate {
    pub(crate) address: IpAddr,
    pub(crate) uploading: usize,
    pub(crate) entries: Vec<EntryHandle>,
}

impl SourceAggregate {
    pub(crate) fn new(address: IpAddr) -> Self {
        Self {
            address,
            uploading: 0,
            entries: Vec::new(),
        }
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn total(&self) -> usize {
        self.entries.len()
    }

    /// Entries from this address currently holding a slot.
    pub fn uploading(&self) -> usize {
        self.uploading
    }

    pub fn entries(&self) -> &[EntryHandle] {
        &self.entries
    }

    pub(crate) fn remove(&mut self, handle: EntryHandle) {
        self.entries.retain(|existing| *existing != handle);
    }
}
