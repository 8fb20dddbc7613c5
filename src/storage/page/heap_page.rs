//! The slotted page format.
//!
//! A page is `PAGE_SIZE` bytes: a slot-presence bitmap (`header_size` bytes,
//! bit `i` set iff slot `i` holds a live tuple) followed by `slots_per_page`
//! fixed-width tuple slots, followed by zero padding. An all-zero buffer is
//! the canonical empty page, used whenever a file is extended.

use crate::access::tuple::{RecordId, Tuple};
use crate::access::value::Value;
use crate::catalog::schema::Schema;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{PageId, PAGE_SIZE};
use crate::transaction::TransactionId;
use std::io::Cursor;
use std::sync::Arc;

pub struct HeapPage {
    id: PageId,
    schema: Arc<Schema>,
    header: Vec<u8>,
    slots: Vec<Option<Tuple>>,
    dirty: Option<TransactionId>,
    before_image: Vec<u8>,
}

impl HeapPage {
    /// Number of tuple slots on a page of this schema:
    /// `floor(PAGE_SIZE * 8 / (tuple_width * 8 + 1))` — each slot costs its
    /// tuple width plus one header bit.
    pub fn slots_per_page(schema: &Schema) -> usize {
        (PAGE_SIZE * 8) / (schema.tuple_width() * 8 + 1)
    }

    /// Bytes of slot-presence bitmap: `ceil(slots_per_page / 8)`.
    pub fn header_size(schema: &Schema) -> usize {
        Self::slots_per_page(schema).div_ceil(8)
    }

    /// The canonical empty page: all header bits clear, no tuples.
    pub fn empty(id: PageId, schema: Arc<Schema>) -> Self {
        let header = vec![0u8; Self::header_size(&schema)];
        let slots = (0..Self::slots_per_page(&schema)).map(|_| None).collect();
        Self {
            id,
            schema,
            header,
            slots,
            dirty: None,
            before_image: vec![0u8; PAGE_SIZE],
        }
    }

    /// Decodes one page. The input becomes the page's before-image.
    ///
    /// For each slot the corresponding header bit decides whether the slot's
    /// fixed byte range is parsed into a tuple or skipped.
    pub fn from_bytes(id: PageId, schema: Arc<Schema>, bytes: &[u8]) -> StorageResult<Self> {
        if bytes.len() != PAGE_SIZE {
            return Err(StorageError::BadPageSize(bytes.len()));
        }

        let header_size = Self::header_size(&schema);
        let num_slots = Self::slots_per_page(&schema);
        let tuple_width = schema.tuple_width();
        let header = bytes[..header_size].to_vec();

        let mut slots = Vec::with_capacity(num_slots);
        let mut cursor = Cursor::new(&bytes[header_size..]);
        for slot in 0..num_slots {
            if header[slot / 8] >> (slot % 8) & 1 == 0 {
                cursor.set_position(cursor.position() + tuple_width as u64);
                slots.push(None);
                continue;
            }
            let mut values = Vec::with_capacity(schema.len());
            for column in schema.columns() {
                values.push(column.field_type.read_value(&mut cursor)?);
            }
            let mut tuple = Tuple::new(values);
            tuple.set_record_id(Some(RecordId::new(id, slot as u16)));
            slots.push(Some(tuple));
        }

        Ok(Self {
            id,
            schema,
            header,
            slots,
            dirty: None,
            before_image: bytes.to_vec(),
        })
    }

    /// Serializes the page to exactly `PAGE_SIZE` bytes, zero-filling free
    /// slots and trailing padding.
    pub fn to_bytes(&self) -> Vec<u8> {
        let tuple_width = self.schema.tuple_width();
        let mut buf = Vec::with_capacity(PAGE_SIZE);
        buf.extend_from_slice(&self.header);
        for slot in &self.slots {
            match slot {
                Some(tuple) => {
                    for value in tuple.values() {
                        // a stored tuple was type-checked on insert
                        value.write_to(&mut buf).expect("writing to Vec cannot fail");
                    }
                }
                None => buf.resize(buf.len() + tuple_width, 0),
            }
        }
        buf.resize(PAGE_SIZE, 0);
        buf
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn slot_in_use(&self, slot: u16) -> bool {
        let slot = slot as usize;
        slot < self.slots.len() && self.header[slot / 8] >> (slot % 8) & 1 == 1
    }

    pub fn free_slot_count(&self) -> usize {
        let used: u32 = self.header.iter().map(|b| b.count_ones()).sum();
        self.slots.len() - used as usize
    }

    /// Places the tuple in the first free slot and stamps its record id.
    pub fn insert_tuple(&mut self, mut tuple: Tuple) -> StorageResult<RecordId> {
        self.check_tuple(&tuple)?;
        let slot = (0..self.slots.len())
            .find(|&i| !self.slot_in_use(i as u16))
            .ok_or(StorageError::PageFull(self.id))?;
        let record_id = RecordId::new(self.id, slot as u16);
        tuple.set_record_id(Some(record_id));
        self.mark_slot(slot, true);
        self.slots[slot] = Some(tuple);
        Ok(record_id)
    }

    /// Clears the slot the record id names. Fails if the record belongs to a
    /// different page or the slot is already empty.
    pub fn delete_tuple(&mut self, record_id: &RecordId) -> StorageResult<()> {
        if record_id.page_id != self.id {
            return Err(StorageError::PageMismatch {
                record: *record_id,
                page: self.id,
            });
        }
        if !self.slot_in_use(record_id.slot) {
            return Err(StorageError::SlotEmpty {
                page: self.id,
                slot: record_id.slot,
            });
        }
        self.mark_slot(record_id.slot as usize, false);
        self.slots[record_id.slot as usize] = None;
        Ok(())
    }

    /// Live tuples in slot order.
    pub fn tuples(&self) -> impl Iterator<Item = &Tuple> {
        self.slots.iter().flatten()
    }

    /// The transaction that dirtied this page, if any.
    pub fn dirty(&self) -> Option<TransactionId> {
        self.dirty
    }

    pub fn mark_dirty(&mut self, tx: Option<TransactionId>) {
        self.dirty = tx;
    }

    /// Serialized content as of the last load or flush, for log records.
    pub fn before_image(&self) -> &[u8] {
        &self.before_image
    }

    /// Re-snapshots the before-image from the current content. Called after
    /// every successful flush.
    pub fn set_before_image(&mut self) {
        self.before_image = self.to_bytes();
    }

    fn mark_slot(&mut self, slot: usize, used: bool) {
        if used {
            self.header[slot / 8] |= 1 << (slot % 8);
        } else {
            self.header[slot / 8] &= !(1 << (slot % 8));
        }
    }

    fn check_tuple(&self, tuple: &Tuple) -> StorageResult<()> {
        if tuple.values().len() != self.schema.len() {
            return Err(StorageError::InvalidTuple(format!(
                "expected {} fields, got {}",
                self.schema.len(),
                tuple.values().len()
            )));
        }
        for (i, (value, column)) in tuple.values().iter().zip(self.schema.columns()).enumerate() {
            if value.field_type() != column.field_type {
                return Err(StorageError::InvalidTuple(format!(
                    "field {} should be {}, got {}",
                    i,
                    column.field_type,
                    value.field_type()
                )));
            }
            if let Value::Text(s) = value {
                if s.len() > crate::access::value::TEXT_MAX_LEN {
                    return Err(StorageError::InvalidTuple(format!(
                        "field {} exceeds the fixed text width ({} > {})",
                        i,
                        s.len(),
                        crate::access::value::TEXT_MAX_LEN
                    )));
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for HeapPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapPage")
            .field("id", &self.id)
            .field("live_tuples", &self.tuples().count())
            .field("dirty", &self.dirty)
            .finish()
    }
}
