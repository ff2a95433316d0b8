use super::scheduler::Scheduler;
use super::{SchedulerConfig, UplinkStatus, UNKNOWN_ETA};

/// Seconds needed to push `file_size` bytes through one upload slot.
///
/// Uses the per-slot share of the measured bandwidth, falling back to one
/// byte per second per free slot when bandwidth is not accounted.
fn transfer_secs(config: &SchedulerConfig, uplink: &UplinkStatus, file_size: u64) -> u64 {
    let slots = config.max_uploads as u64;
    if let Some(bandwidth) = uplink.outbound_bandwidth {
        let share = if slots == 0 { 0 } else { bandwidth / slots };
        if share > 0 {
            return file_size / share;
        }
    }

    let free_slots = slots
        .saturating_sub(uplink.running_uploads as u64)
        .max(1);
    file_size / free_slots
}

impl Scheduler {
    pub(crate) fn recompute_eta(&mut self, tier: usize) {
        let Some(queue) = self.queues.get(tier) else {
            return;
        };

        if self.config.max_uploads == 0 {
            for handle in &queue.by_position {
                if let Some(entry) = self.entries.get_mut(handle) {
                    entry.eta = UNKNOWN_ETA;
                }
            }
            return;
        }

        let mut eta: u64 = 0;

        if queue.active_uploads > 0 {
            let slot_holder = queue
                .by_position
                .iter()
                .filter_map(|handle| self.entries.get(handle))
                .find(|entry| entry.has_slot);
            if let Some(slot_holder) = slot_holder {
                eta = transfer_secs(&self.config, &self.uplink, slot_holder.file_size);
            }
        }

        if eta == 0 && self.uplink.running_uploads > self.config.max_uploads {
            let borrowed = self
                .queues
                .iter()
                .filter(|other| other.active_uploads > 1)
                .find_map(|other| other.by_rank.first())
                .and_then(|handle| self.entries.get(handle))
                .map(|entry| entry.eta);

            match borrowed {
                Some(borrowed) => eta = borrowed,
                None => self.logger.warn(
                    Some("parq::eta"),
                    &format!(
                        "more uploads running ({}) than slots ({}) but no queue holds several slots",
                        self.uplink.running_uploads, self.config.max_uploads
                    ),
                ),
            }
        }

        for handle in &self.queues[tier].by_rank {
            let Some(entry) = self.entries.get_mut(handle) else {
                continue;
            };
            entry.eta = eta;
            if !entry.has_slot {
                eta = eta.saturating_add(transfer_secs(&self.config, &self.uplink, entry.file_size));
            }
        }
    }
}
