//! Order-preserving slots for file results.
//!
//! A slot is reserved when a file part arrives and resolved whenever its
//! write finishes, so the final list follows arrival order no matter which
//! write completes first.

use super::{FileInfo, StoredFile};

/// Stable identifier of a reserved slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(usize);

/// Ownership status of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Placeholder,
    Committed,
    Withdrawn,
}

#[derive(Debug)]
enum Slot {
    Placeholder(FileInfo),
    Committed(StoredFile),
    Withdrawn,
}

/// Arena of file-result slots indexed by arrival.
#[derive(Debug, Default)]
pub struct PlaceholderSequence {
    slots: Vec<Slot>,
}

impl PlaceholderSequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next slot for a file that has just arrived.
    pub fn reserve(&mut self, info: FileInfo) -> SlotId {
        self.slots.push(Slot::Placeholder(info));
        SlotId(self.slots.len() - 1)
    }

    /// Resolve a placeholder with its stored record.
    ///
    /// Does nothing if the slot was already withdrawn.
    pub fn commit(&mut self, id: SlotId, file: StoredFile) {
        if let Some(slot) = self.slots.get_mut(id.0) {
            if !matches!(slot, Slot::Withdrawn) {
                *slot = Slot::Committed(file);
            }
        }
    }

    /// Withdraw a slot.  Other slots keep their ids.
    pub fn release(&mut self, id: SlotId) {
        if let Some(slot) = self.slots.get_mut(id.0) {
            *slot = Slot::Withdrawn;
        }
    }

    pub fn status(&self, id: SlotId) -> Option<SlotStatus> {
        self.slots.get(id.0).map(|slot| match slot {
            Slot::Placeholder(_) => SlotStatus::Placeholder,
            Slot::Committed(_) => SlotStatus::Committed,
            Slot::Withdrawn => SlotStatus::Withdrawn,
        })
    }

    /// Number of slots still waiting for their write.
    pub fn unresolved(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot, Slot::Placeholder(_)))
            .count()
    }

    /// Materialize the committed records in arrival order.
    pub fn into_files(self) -> Vec<StoredFile> {
        self.slots
            .into_iter()
            .filter_map(|slot| match slot {
                Slot::Committed(file) => Some(file),
                _ => None,
            })
            .collect()
    }
}
