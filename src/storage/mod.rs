use std::fmt::Display;

use crate::common::PageId;

pub mod file_manager;
pub mod heap;

pub type SlotNo = u16;

/// The storage location of a tuple: its page and the slot within that page.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct RecordId {
    page_id: PageId,
    slot: SlotNo,
}

impl RecordId {
    pub fn new(page_id: PageId, slot: SlotNo) -> Self {
        Self { page_id, slot }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn slot(&self) -> SlotNo {
        self.slot
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.page_id, self.slot)
    }
}
