use std::ops::{Deref, DerefMut};

use anyhow::Result;

use crate::common::PageId;
use crate::error::DbError;
use crate::storage::{RecordId, SlotNo};
use crate::tuple::schema::Schema;
use crate::tuple::value::Value;
use crate::tuple::Tuple;

/// How tuples of a schema are laid out on a page of a given size.
///
/// A page starts with a bitmap with one bit per slot (the lowest bit of the first byte
/// belongs to slot 0), followed by the slots. Every tuple occupies exactly
/// `tuple_width` bytes, so each slot needs `tuple_width * 8 + 1` bits.
#[derive(Clone, Debug)]
pub struct HeapPageLayout {
    schema: Schema,
    page_size: usize,
    tuple_width: usize,
    slot_count: usize,
    header_size: usize,
}

impl HeapPageLayout {
    pub fn new(schema: Schema, page_size: usize) -> Result<Self> {
        let tuple_width = schema.tuple_width();
        if tuple_width == 0 {
            return Err(DbError::SchemaMismatch("a schema needs at least one column".to_owned()).into());
        }
        let slot_count = (page_size * 8) / (tuple_width * 8 + 1);
        if slot_count == 0 {
            return Err(DbError::SchemaMismatch(format!(
                "tuples of {} bytes do not fit into pages of {} bytes",
                tuple_width, page_size
            ))
            .into());
        }
        let slot_count = slot_count.min(SlotNo::MAX as usize);
        let header_size = (slot_count + 7) / 8;

        Ok(Self {
            schema,
            page_size,
            tuple_width,
            slot_count,
            header_size,
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of tuples a page can hold
    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn header_size(&self) -> usize {
        self.header_size
    }

    fn slot_offset(&self, slot: SlotNo) -> usize {
        self.header_size + slot as usize * self.tuple_width
    }
}

/// A view of a page's bytes as a heap page. Reading works on any byte slice,
/// modifications need a mutable one.
pub struct HeapPage<'a, B> {
    layout: &'a HeapPageLayout,
    page_id: PageId,
    data: B,
}

impl<'a, B: Deref<Target = [u8]>> HeapPage<'a, B> {
    pub fn new(layout: &'a HeapPageLayout, page_id: PageId, data: B) -> Self {
        debug_assert_eq!(data.len(), layout.page_size());
        Self {
            layout,
            page_id,
            data,
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn is_slot_used(&self, slot: SlotNo) -> bool {
        let slot = slot as usize;
        if slot >= self.layout.slot_count {
            return false;
        }
        self.data[slot / 8] & (1 << (slot % 8)) != 0
    }

    pub fn num_empty_slots(&self) -> usize {
        (0..self.layout.slot_count as SlotNo)
            .filter(|&slot| !self.is_slot_used(slot))
            .count()
    }

    fn first_empty_slot(&self) -> Option<SlotNo> {
        (0..self.layout.slot_count as SlotNo).find(|&slot| !self.is_slot_used(slot))
    }

    /// Reads the tuple stored in a slot, None if the slot is empty.
    pub fn read_tuple(&self, slot: SlotNo) -> Result<Option<Tuple>> {
        if !self.is_slot_used(slot) {
            return Ok(None);
        }

        let mut offset = self.layout.slot_offset(slot);
        let columns = self.layout.schema().columns();
        let mut values = Vec::with_capacity(columns.len());
        for column in columns {
            let value = Value::parse_value(&self.data[offset..], column.type_id())?;
            offset += column.type_id().size();
            values.push(value);
        }

        let mut tuple = Tuple::new(values);
        tuple.set_record_id(Some(RecordId::new(self.page_id, slot)));
        Ok(Some(tuple))
    }

    /// All tuples stored on this page, in slot order.
    pub fn tuples(&self) -> Result<Vec<Tuple>> {
        let mut tuples = Vec::new();
        for slot in 0..self.layout.slot_count as SlotNo {
            if let Some(tuple) = self.read_tuple(slot)? {
                tuples.push(tuple);
            }
        }
        Ok(tuples)
    }
}

impl<'a, B: DerefMut<Target = [u8]>> HeapPage<'a, B> {
    fn mark_slot(&mut self, slot: SlotNo, used: bool) {
        let slot = slot as usize;
        let mask = 1 << (slot % 8);
        if used {
            self.data[slot / 8] |= mask;
        } else {
            self.data[slot / 8] &= !mask;
        }
    }

    /// Stores the tuple in the first empty slot and updates its record id.
    pub fn insert_tuple(&mut self, tuple: &mut Tuple) -> Result<RecordId> {
        self.layout.schema().check(tuple)?;
        let slot = self.first_empty_slot().ok_or_else(|| {
            DbError::InvalidRecord(format!("page {} has no empty slot", self.page_id))
        })?;

        let mut offset = self.layout.slot_offset(slot);
        for value in tuple.values() {
            value.serialize_value(&mut self.data[offset..]);
            offset += value.type_id().size();
        }
        self.mark_slot(slot, true);

        let record_id = RecordId::new(self.page_id, slot);
        tuple.set_record_id(Some(record_id));
        Ok(record_id)
    }

    /// Frees the slot a record is stored in.
    pub fn delete_tuple(&mut self, record_id: RecordId) -> Result<()> {
        if record_id.page_id() != self.page_id {
            return Err(DbError::InvalidRecord(format!(
                "record {} is not stored on page {}",
                record_id, self.page_id
            ))
            .into());
        }
        if !self.is_slot_used(record_id.slot()) {
            return Err(
                DbError::InvalidRecord(format!("slot of record {} is empty", record_id)).into(),
            );
        }
        self.mark_slot(record_id.slot(), false);
        Ok(())
    }
}
