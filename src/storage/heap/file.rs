use std::sync::Arc;

use anyhow::{Context, Result};
use log::debug;

use super::page::{HeapPage, HeapPageLayout};
use crate::buffer::buffer_pool::{Buffer, BufferPool};
use crate::common::{PageId, PageNo, TableId};
use crate::concurrency::{Permission, TransactionId};
use crate::error::DbError;
use crate::tuple::schema::Schema;
use crate::tuple::Tuple;

/// Iterates lazily over all tuples of a heap file.
/// At most the tuples of a single page are kept in memory.
pub struct HeapTupleIterator<'a> {
    file: &'a HeapFile<'a>,
    tid: TransactionId,
    next_page_no: PageNo,
    curr_page: std::vec::IntoIter<Tuple>,
}

impl<'a> HeapTupleIterator<'a> {
    fn new(file: &'a HeapFile<'a>, tid: TransactionId) -> Self {
        Self {
            file,
            tid,
            next_page_no: 0,
            curr_page: Vec::new().into_iter(),
        }
    }

    /// Starts again from the first page.
    pub fn rewind(&mut self) {
        self.next_page_no = 0;
        self.curr_page = Vec::new().into_iter();
    }

    fn fetch_next_tuple(&mut self) -> Result<Option<Tuple>> {
        loop {
            if let Some(tuple) = self.curr_page.next() {
                return Ok(Some(tuple));
            }
            if self.next_page_no >= self.file.num_pages()? {
                return Ok(None);
            }
            let page_id = self.file.page_id(self.next_page_no);
            let buffer = self.file.fetch_page(self.tid, page_id, Permission::Shared)?;
            let data = buffer.read();
            let tuples = HeapPage::new(&self.file.layout, page_id, &data[..]).tuples()?;
            self.curr_page = tuples.into_iter();
            self.next_page_no += 1;
        }
    }
}

impl<'a> std::iter::Iterator for HeapTupleIterator<'a> {
    type Item = Result<Tuple>;

    fn next(&mut self) -> Option<Self::Item> {
        self.fetch_next_tuple().transpose()
    }
}

/// A table stored as an unordered collection of fixed size pages.
/// All page access goes through the buffer pool and thereby through the lock manager.
pub struct HeapFile<'a> {
    table_id: TableId,
    buffer_pool: &'a BufferPool,
    layout: HeapPageLayout,
}

impl<'a> HeapFile<'a> {
    pub fn new(table_id: TableId, schema: Schema, buffer_pool: &'a BufferPool) -> Result<Self> {
        let layout = HeapPageLayout::new(schema, buffer_pool.page_size())
            .with_context(|| format!("Could not open heap file for table {}", table_id))?;
        Ok(Self {
            table_id,
            buffer_pool,
            layout,
        })
    }

    pub fn schema(&self) -> &Schema {
        self.layout.schema()
    }

    pub fn page_size(&self) -> usize {
        self.layout.page_size()
    }

    /// Number of tuples a single page can hold
    pub fn tuples_per_page(&self) -> usize {
        self.layout.slot_count()
    }

    pub fn num_pages(&self) -> Result<PageNo> {
        self.buffer_pool.num_pages(self.table_id)
    }

    fn page_id(&self, page_no: PageNo) -> PageId {
        PageId::new(self.table_id, page_no)
    }

    fn fetch_page(
        &self,
        tid: TransactionId,
        page_id: PageId,
        permission: Permission,
    ) -> Result<Arc<Buffer>> {
        self.buffer_pool
            .get_page(tid, page_id, permission)
            .with_context(|| format!("Could not fetch page {} of table {}", page_id, self.table_id))
    }

    /// Writes the tuple into the page if there is still room.
    /// The caller has to hold an exclusive lock on the page.
    fn try_insert(&self, tid: TransactionId, buffer: &Buffer, tuple: &mut Tuple) -> Result<bool> {
        let mut data = buffer.write();
        let mut page = HeapPage::new(&self.layout, buffer.page_id(), &mut data[..]);
        if page.num_empty_slots() == 0 {
            return Ok(false);
        }
        page.insert_tuple(tuple)?;
        buffer.mark_dirty(tid);
        Ok(true)
    }

    /// Inserts a tuple into the first page with an empty slot, appending a new page if all are full.
    /// Sets the record id of the tuple and returns the pages which were modified.
    pub fn insert_tuple(&self, tid: TransactionId, tuple: &mut Tuple) -> Result<Vec<PageId>> {
        self.schema().check(tuple)?;

        for page_no in 0..self.num_pages()? {
            let page_id = self.page_id(page_no);
            let held_before = self.buffer_pool.holds_lock(tid, page_id);

            let buffer = self.fetch_page(tid, page_id, Permission::Shared)?;
            let has_room = {
                let data = buffer.read();
                HeapPage::new(&self.layout, page_id, &data[..]).num_empty_slots() > 0
            };
            // the shared lock only served to look at the free slots, so it can go again
            if !has_room {
                if !held_before {
                    self.buffer_pool.release_page(tid, page_id);
                }
                continue;
            }

            // someone else may have taken the last slot before we got the exclusive lock
            let buffer = self.fetch_page(tid, page_id, Permission::Exclusive)?;
            if self.try_insert(tid, &buffer, tuple)? {
                return Ok(vec![page_id]);
            }
            if !held_before {
                self.buffer_pool.release_page(tid, page_id);
            }
        }

        loop {
            let page_no = self.buffer_pool.allocate_page(self.table_id)?;
            let page_id = self.page_id(page_no);
            debug!(
                "Appended page {} to table {} for transaction {}",
                page_no, self.table_id, tid
            );

            let buffer = self.fetch_page(tid, page_id, Permission::Exclusive)?;
            if self.try_insert(tid, &buffer, tuple)? {
                return Ok(vec![page_id]);
            }
        }
    }

    /// Deletes the tuple from the slot its record id points to and returns the modified page.
    pub fn delete_tuple(&self, tid: TransactionId, tuple: &Tuple) -> Result<PageId> {
        let record_id = tuple
            .record_id()
            .ok_or_else(|| DbError::InvalidRecord("tuple has not been stored".to_owned()))?;
        let page_id = record_id.page_id();
        if page_id.table_id() != self.table_id {
            return Err(DbError::InvalidRecord(format!(
                "record {} does not belong to table {}",
                record_id, self.table_id
            ))
            .into());
        }

        let buffer = self.fetch_page(tid, page_id, Permission::Exclusive)?;
        let mut data = buffer.write();
        HeapPage::new(&self.layout, page_id, &mut data[..]).delete_tuple(record_id)?;
        buffer.mark_dirty(tid);

        Ok(page_id)
    }

    /// Returns an iterator over all tuples visible to the transaction.
    /// Pages are locked shared one after another while iterating.
    pub fn iter(&'a self, tid: TransactionId) -> HeapTupleIterator<'a> {
        HeapTupleIterator::new(self, tid)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use anyhow::Result;
    use rand::distributions::{Alphanumeric, DistString};
    use rand::Rng;
    use tempfile::tempdir;

    use super::HeapFile;
    use crate::buffer::buffer_pool::BufferPool;
    use crate::common::{PageId, StorageConfig};
    use crate::concurrency::{Permission, TransactionManager};
    use crate::error::DbError;
    use crate::tuple::schema::{ColumnDefinition, Schema, TypeId};
    use crate::tuple::value::Value;
    use crate::tuple::Tuple;

    const TABLE_ID: u16 = 1;

    fn random_string() -> String {
        let mut rng = rand::thread_rng();
        let length = rng.gen_range(5..20);
        Alphanumeric.sample_string(&mut rng, length)
    }

    fn integer_schema() -> Schema {
        Schema::new(vec![
            ColumnDefinition::new(TypeId::Integer, "id"),
            ColumnDefinition::new(TypeId::Integer, "value"),
        ])
    }

    fn integer_tuple(id: i32) -> Tuple {
        Tuple::new(vec![Value::Integer(id), Value::Integer(rand::random())])
    }

    fn ids<'a>(tuples: impl IntoIterator<Item = &'a Tuple>) -> Vec<i32> {
        tuples
            .into_iter()
            .map(|tuple| tuple.values()[0].as_i32().unwrap())
            .collect()
    }

    /// 256 byte pages hold 31 tuples of two integers
    fn open_pool(path: &std::path::Path) -> Result<BufferPool> {
        let buffer_pool = BufferPool::open(
            path,
            StorageConfig {
                page_size: 256,
                pool_size: 16,
            },
        )?;
        buffer_pool.create_table(TABLE_ID)?;
        Ok(buffer_pool)
    }

    #[test]
    fn inserted_tuples_fill_pages_in_order() -> Result<()> {
        let data_dir = tempdir()?;
        let buffer_pool = open_pool(data_dir.path())?;
        let file = HeapFile::new(TABLE_ID, integer_schema(), &buffer_pool)?;
        let transaction_manager = TransactionManager::new(&buffer_pool);
        assert_eq!(file.tuples_per_page(), 31);

        let transaction = transaction_manager.start_transaction();
        let count = 100;
        for id in 0..count {
            let modified = file.insert_tuple(transaction.tid(), &mut integer_tuple(id))?;
            assert_eq!(modified, vec![PageId::new(TABLE_ID, id as u32 / 31)]);
        }
        assert_eq!(file.num_pages()?, 4);

        let tuples = file.iter(transaction.tid()).collect::<Result<Vec<_>>>()?;
        assert_eq!(ids(&tuples), (0..count).collect::<Vec<_>>());
        transaction.commit()?;

        let transaction = transaction_manager.start_transaction();
        assert_eq!(file.iter(transaction.tid()).count(), count as usize);
        transaction.commit()?;

        Ok(())
    }

    #[test]
    fn deleted_slot_is_reused() -> Result<()> {
        let data_dir = tempdir()?;
        let buffer_pool = open_pool(data_dir.path())?;
        let file = HeapFile::new(TABLE_ID, integer_schema(), &buffer_pool)?;
        let transaction_manager = TransactionManager::new(&buffer_pool);

        let transaction = transaction_manager.start_transaction();
        let mut tuples = Vec::new();
        for id in 0..40 {
            let mut tuple = integer_tuple(id);
            file.insert_tuple(transaction.tid(), &mut tuple)?;
            tuples.push(tuple);
        }
        transaction.commit()?;

        let transaction = transaction_manager.start_transaction();
        let victim = &tuples[5];
        let modified = file.delete_tuple(transaction.tid(), victim)?;
        assert_eq!(modified, PageId::new(TABLE_ID, 0));

        let mut replacement = integer_tuple(1000);
        let modified = file.insert_tuple(transaction.tid(), &mut replacement)?;
        assert_eq!(modified, vec![PageId::new(TABLE_ID, 0)]);
        assert_eq!(replacement.record_id(), victim.record_id());
        transaction.commit()?;

        Ok(())
    }

    #[test]
    fn iteration_reflects_inserts_and_deletes() -> Result<()> {
        let data_dir = tempdir()?;
        let buffer_pool = open_pool(data_dir.path())?;
        let file = HeapFile::new(TABLE_ID, integer_schema(), &buffer_pool)?;
        let transaction_manager = TransactionManager::new(&buffer_pool);
        let transaction = transaction_manager.start_transaction();
        let tid = transaction.tid();

        let mut stored = Vec::new();
        for id in 0..75 {
            let mut tuple = integer_tuple(id);
            file.insert_tuple(tid, &mut tuple)?;
            stored.push(tuple);
        }
        // empty the whole second page and a few slots elsewhere
        let mut deleted = 0;
        for tuple in stored.iter().filter(|tuple| {
            let id = tuple.values()[0].as_i32().unwrap();
            (31..62).contains(&id) || id % 10 == 0
        }) {
            file.delete_tuple(tid, tuple)?;
            deleted += 1;
        }

        let mut iter = file.iter(tid);
        let first_pass = iter.by_ref().collect::<Result<Vec<_>>>()?;
        assert_eq!(first_pass.len(), 75 - deleted);
        let unique: HashSet<i32> = ids(&first_pass).into_iter().collect();
        assert_eq!(unique.len(), first_pass.len());

        iter.rewind();
        let second_pass = iter.collect::<Result<Vec<_>>>()?;
        assert_eq!(first_pass, second_pass);
        transaction.commit()?;

        Ok(())
    }

    #[test]
    fn deleting_twice_is_an_invalid_record() -> Result<()> {
        let data_dir = tempdir()?;
        let buffer_pool = open_pool(data_dir.path())?;
        let file = HeapFile::new(TABLE_ID, integer_schema(), &buffer_pool)?;
        let transaction_manager = TransactionManager::new(&buffer_pool);
        let transaction = transaction_manager.start_transaction();

        let mut tuple = integer_tuple(1);
        file.insert_tuple(transaction.tid(), &mut tuple)?;
        file.delete_tuple(transaction.tid(), &tuple)?;

        let error = file.delete_tuple(transaction.tid(), &tuple).unwrap_err();
        assert!(matches!(
            error.downcast_ref::<DbError>(),
            Some(DbError::InvalidRecord(_))
        ));

        let error = file
            .delete_tuple(transaction.tid(), &integer_tuple(2))
            .unwrap_err();
        assert!(matches!(
            error.downcast_ref::<DbError>(),
            Some(DbError::InvalidRecord(_))
        ));
        transaction.commit()?;

        Ok(())
    }

    #[test]
    fn aborted_inserts_are_not_visible() -> Result<()> {
        let data_dir = tempdir()?;
        let buffer_pool = open_pool(data_dir.path())?;
        let file = HeapFile::new(TABLE_ID, integer_schema(), &buffer_pool)?;
        let transaction_manager = TransactionManager::new(&buffer_pool);

        let transaction = transaction_manager.start_transaction();
        for id in 0..10 {
            file.insert_tuple(transaction.tid(), &mut integer_tuple(id))?;
        }
        transaction.abort()?;

        let transaction = transaction_manager.start_transaction();
        assert_eq!(file.iter(transaction.tid()).count(), 0);
        transaction.commit()?;

        Ok(())
    }

    #[test]
    fn committed_tuples_survive_reopening() -> Result<()> {
        let data_dir = tempdir()?;
        let schema = Schema::new(vec![
            ColumnDefinition::new(TypeId::Integer, "id"),
            ColumnDefinition::new(TypeId::Text, "name"),
        ]);
        let tuples = (0..10)
            .map(|id| Tuple::new(vec![Value::Integer(id), Value::String(random_string())]))
            .collect::<Vec<_>>();

        {
            let buffer_pool = open_pool(data_dir.path())?;
            let file = HeapFile::new(TABLE_ID, schema.clone(), &buffer_pool)?;
            let transaction_manager = TransactionManager::new(&buffer_pool);
            let transaction = transaction_manager.start_transaction();
            for tuple in &tuples {
                file.insert_tuple(transaction.tid(), &mut tuple.clone())?;
            }
            transaction.commit()?;
        }

        let buffer_pool = BufferPool::open(
            data_dir.path(),
            StorageConfig {
                page_size: 256,
                pool_size: 16,
            },
        )?;
        let file = HeapFile::new(TABLE_ID, schema, &buffer_pool)?;
        let transaction_manager = TransactionManager::new(&buffer_pool);
        let transaction = transaction_manager.start_transaction();
        let read = file.iter(transaction.tid()).collect::<Result<Vec<_>>>()?;
        assert_eq!(read.len(), tuples.len());
        for (expected, actual) in tuples.iter().zip(&read) {
            assert_eq!(expected.values(), actual.values());
        }
        transaction.commit()?;

        Ok(())
    }

    #[test]
    fn insert_waits_for_exclusive_lock_and_rechecks() -> Result<()> {
        let data_dir = tempdir()?;
        let buffer_pool = open_pool(data_dir.path())?;
        let file = HeapFile::new(TABLE_ID, integer_schema(), &buffer_pool)?;
        let transaction_manager = TransactionManager::new(&buffer_pool);

        let reader = transaction_manager.start_transaction();
        let writer = transaction_manager.start_transaction();
        file.insert_tuple(writer.tid(), &mut integer_tuple(0))?;
        writer.commit()?;

        // the reader holds page 0 shared, so a writer has to wait for it
        buffer_pool.get_page(reader.tid(), PageId::new(TABLE_ID, 0), Permission::Shared)?;
        std::thread::scope(|scope| -> Result<()> {
            let writer = transaction_manager.start_transaction();
            let handle = scope.spawn(|| {
                let tid = writer.tid();
                file.insert_tuple(tid, &mut integer_tuple(1)).map(|pages| (writer, pages))
            });
            std::thread::sleep(std::time::Duration::from_millis(200));
            assert!(!handle.is_finished());
            reader.commit()?;

            let (writer, pages) = handle.join().unwrap()?;
            assert_eq!(pages, vec![PageId::new(TABLE_ID, 0)]);
            writer.commit()
        })?;

        let transaction = transaction_manager.start_transaction();
        assert_eq!(file.iter(transaction.tid()).count(), 2);
        transaction.commit()?;

        Ok(())
    }

    #[test]
    fn concurrent_inserters_retry_after_deadlock() -> Result<()> {
        let data_dir = tempdir()?;
        let buffer_pool = open_pool(data_dir.path())?;
        let file = HeapFile::new(TABLE_ID, integer_schema(), &buffer_pool)?;
        let transaction_manager = TransactionManager::new(&buffer_pool);
        let threads = 4;
        let rows_per_thread = 25;

        std::thread::scope(|scope| {
            for worker in 0..threads {
                let file = &file;
                let transaction_manager = &transaction_manager;
                scope.spawn(move || {
                    for row in 0..rows_per_thread {
                        let id = worker * rows_per_thread + row;
                        loop {
                            let transaction = transaction_manager.start_transaction();
                            match file.insert_tuple(transaction.tid(), &mut integer_tuple(id)) {
                                Ok(_) => {
                                    transaction.commit().unwrap();
                                    break;
                                }
                                Err(e) => {
                                    assert!(DbError::is_transaction_aborted(&e), "{e:?}");
                                    transaction.abort().unwrap();
                                }
                            }
                        }
                    }
                });
            }
        });

        let transaction = transaction_manager.start_transaction();
        let tuples = file.iter(transaction.tid()).collect::<Result<Vec<_>>>()?;
        let mut ids = ids(&tuples);
        ids.sort_unstable();
        assert_eq!(ids, (0..threads * rows_per_thread).collect::<Vec<_>>());
        transaction.commit()?;

        Ok(())
    }
}
