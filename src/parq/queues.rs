use std::collections::{HashMap, VecDeque};

use super::entry::{EntryHandle, QueuedEntry};

pub(crate) type EntryArena = HashMap<EntryHandle, QueuedEntry>;

/// Picks the 1-based tier for a resource of `file_size` bytes.
///
/// Tier 1 takes resources above `large_file_size`, each following tier takes
/// resources above half the previous threshold, and the last tier takes the
/// rest.
pub fn select_tier(file_size: u64, max_uploads: usize, large_file_size: u64) -> usize {
    let mut threshold = large_file_size;
    let mut tier = 1;

    while tier <= max_uploads {
        if file_size > threshold || tier >= max_uploads {
            break;
        }
        threshold /= 2;
        tier += 1;
    }

    tier
}

/// One size band of queued entries.
#[derive(Clone, Debug, Default)]
pub struct SizeTieredQueue {
    pub(crate) by_position: Vec<EntryHandle>,
    pub(crate) by_rank: Vec<EntryHandle>,
    pub(crate) dead: VecDeque<EntryHandle>,
    pub(crate) active: bool,
    pub(crate) alive: usize,
    pub(crate) active_uploads: usize,
}

impl SizeTieredQueue {
    pub(crate) fn new() -> Self {
        Self {
            active: true,
            ..Self::default()
        }
    }

    pub fn size(&self) -> usize {
        self.by_position.len()
    }

    pub fn alive(&self) -> usize {
        self.alive
    }

    pub fn active_uploads(&self) -> usize {
        self.active_uploads
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Entries in arrival order.
    pub fn entries(&self) -> &[EntryHandle] {
        &self.by_position
    }

    /// Alive entries in rank order.
    pub fn ranked(&self) -> &[EntryHandle] {
        &self.by_rank
    }

    /// Dead entries, oldest death first.
    pub fn dead(&self) -> impl Iterator<Item = EntryHandle> + '_ {
        self.dead.iter().copied()
    }

    /// Still has alive members without a slot.
    pub fn wants_slot(&self) -> bool {
        self.alive > self.active_uploads
    }

    pub(crate) fn remove_dead(&mut self, handle: EntryHandle) -> bool {
        let before = self.dead.len();
        self.dead.retain(|existing| *existing != handle);
        before != self.dead.len()
    }

    /// Recomputes positions, ranks and reported positions from arrival order.
    pub(crate) fn rerank(&mut self, entries: &mut EntryArena) {
        let mut rank = 1;
        let mut waiting = 1;
        self.by_rank.clear();

        for (index, handle) in self.by_position.iter().enumerate() {
            let Some(entry) = entries.get_mut(handle) else {
                continue;
            };

            entry.position = index + 1;
            entry.relative_position = rank;
            entry.queue_position = waiting;

            if entry.alive {
                self.by_rank.push(*handle);
                rank += 1;
                if entry.has_slot {
                    entry.queue_position = 0;
                } else {
                    waiting += 1;
                }
            }
        }

        self.alive = self.by_rank.len();
    }
}
