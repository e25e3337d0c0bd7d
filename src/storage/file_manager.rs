use std::ffi::OsStr;
use std::fs::{DirEntry, File, OpenOptions};
use std::os::unix::prelude::FileExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Error, Result};
use dashmap::mapref::one::Ref;
use dashmap::DashMap;
use log::debug;
use parking_lot::Mutex;

use crate::common::{PageId, PageNo, TableId};
use crate::error::DbError;

/// FileManager takes care of reading and writing pages of tables.
/// It assumes that all tables are stored inside a single directory, the data directory,
/// where each table is represented as a single file, with the table id used as the filename.
/// Page n of a table is stored at byte offset `n * page_size`.
pub struct FileManager {
    data_directory: PathBuf,
    page_size: usize,
    table_id_to_file: DashMap<TableId, FileHandle>,
}

impl FileManager {
    /// Creates a new FileManager.
    ///
    /// # Arguments
    /// * `data_directory` - The directory under which all tables are stored
    /// * `page_size` - The size of every page in bytes
    ///
    pub fn new(data_directory: impl Into<PathBuf>, page_size: usize) -> Result<Self> {
        let data_directory = data_directory.into();
        if !data_directory.is_dir() {
            return Err(Error::msg(format!(
                "Could not create file manager. {} is not a directory",
                data_directory.display()
            )));
        }
        if page_size == 0 {
            return Err(Error::msg("Page size must be greater than 0"));
        }

        let table_id_to_file = DashMap::new();
        let content = data_directory.read_dir().with_context(|| {
            format!(
                "Could not read files in data directory {}",
                data_directory.display()
            )
        })?;

        for entry in content {
            let entry = entry.with_context(|| {
                format!(
                    "Could not read entry in data directory {}",
                    data_directory.display()
                )
            })?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let table_id = to_table_id(&entry.file_name());
            if let Some(table_id) = table_id {
                let file = read_table(entry, table_id, page_size)?;
                table_id_to_file.insert(table_id, file);
            }
        }

        Ok(Self {
            data_directory,
            page_size,
            table_id_to_file,
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Returns the FileHandle object of a table.
    fn get_file(&self, table_id: TableId) -> Result<Ref<TableId, FileHandle>> {
        self.table_id_to_file
            .get(&table_id)
            .ok_or_else(|| Error::msg(format!("No data file for table with id {}", table_id)))
    }

    /// Returns how many pages a table has.
    /// Returns an error if the table does not exist
    pub fn num_pages(&self, table_id: TableId) -> Result<PageNo> {
        let file = self.get_file(table_id)?;
        Ok(file.num_pages())
    }

    /// Creates a new, empty table.
    /// Returns an error if the table already exists.
    pub fn create_table(&self, table_id: TableId) -> Result<()> {
        if self.table_id_to_file.contains_key(&table_id) {
            return Err(Error::msg(format!(
                "Table with id {} already exists",
                table_id
            )));
        }
        let path = self.data_directory.join(table_id.to_string());
        let file = OpenOptions::new()
            .write(true)
            .read(true)
            .create_new(true)
            .open(path)
            .with_context(|| format!("Failed to create data file for table {}", table_id))?;

        let file = FileHandle::new(table_id, file, 0, self.page_size);
        self.table_id_to_file.insert(table_id, file);

        Ok(())
    }

    /// Appends a new page, writes it with initial data and returns the page number of the freshly allocated page.
    pub fn allocate_new_page(&self, table_id: TableId, initial_data: &[u8]) -> Result<PageNo> {
        self.check_buffer_size(initial_data.len())?;
        let file = self.get_file(table_id)?;
        let page_no = file.allocate_new_page(initial_data)?;
        debug!("Allocated page {} for table {}", page_no, table_id);
        Ok(page_no)
    }

    /// Reads the specified page of a table into the buffer.
    /// Reading a page that does not exist yet is an error, it never reads zeros.
    pub fn read_page(&self, page_id: PageId, buffer: &mut [u8]) -> Result<()> {
        self.check_buffer_size(buffer.len())?;
        let file = self.get_file(page_id.table_id())?;
        let num_pages = file.num_pages();
        if page_id.page_no() >= num_pages {
            return Err(DbError::InvalidPage { page_id, num_pages }.into());
        }
        file.read_page_at_offset(self.offset(page_id), buffer)
    }

    /// Writes data to an allocated page of a table. Returns an error if the page hasn't been allocated yet.
    pub fn write_page(&self, page_id: PageId, buffer: &[u8]) -> Result<()> {
        self.check_buffer_size(buffer.len())?;
        let file = self.get_file(page_id.table_id())?;
        let num_pages = file.num_pages();
        if page_id.page_no() >= num_pages {
            Err(DbError::InvalidPage { page_id, num_pages })
                .with_context(|| format!("Attempted to write page {} before it has been allocated", page_id))
        } else {
            file.write_page_at_offset(self.offset(page_id), buffer)
        }
    }

    fn offset(&self, page_id: PageId) -> u64 {
        page_id.page_no() as u64 * self.page_size as u64
    }

    fn check_buffer_size(&self, len: usize) -> Result<()> {
        if len != self.page_size {
            return Err(Error::msg(format!(
                "Expected a buffer of {} bytes, got {} bytes",
                self.page_size, len
            )));
        }
        Ok(())
    }
}

struct FileHandle {
    table_id: TableId,
    file: File,
    filesize: AtomicU64,
    page_size: u64,
    allocation: Mutex<()>,
}

impl FileHandle {
    fn new(table_id: TableId, file: File, filesize: u64, page_size: usize) -> Self {
        Self {
            table_id,
            file,
            filesize: AtomicU64::new(filesize),
            page_size: page_size as u64,
            allocation: Mutex::new(()),
        }
    }

    fn filesize(&self) -> u64 {
        self.filesize.load(Ordering::Acquire)
    }

    fn num_pages(&self) -> PageNo {
        (self.filesize() / self.page_size) as PageNo
    }

    /// Allocates a new page. Concurrent callers always get distinct pages,
    /// and a page only becomes visible once its initial data is written.
    fn allocate_new_page(&self, initial_data: &[u8]) -> Result<PageNo> {
        let _allocation = self.allocation.lock();
        let offset = self.filesize();
        self.write_page_at_offset(offset, initial_data)?;
        self.filesize
            .store(offset + self.page_size, Ordering::Release);
        Ok((offset / self.page_size) as PageNo)
    }

    /// Reads a page into a buffer.
    fn read_page_at_offset(&self, offset: u64, buffer: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(buffer, offset).with_context(|| {
            format!(
                "Could not read page at offset {} for table {}",
                offset, self.table_id
            )
        })?;

        Ok(())
    }

    /// Writes data to the file at the given offset.
    fn write_page_at_offset(&self, offset: u64, buffer: &[u8]) -> Result<()> {
        self.file.write_all_at(buffer, offset).with_context(|| {
            format!(
                "Failed to write data at offset {} for table {}",
                offset, self.table_id
            )
        })?;
        self.file.sync_all().with_context(|| {
            format!(
                "Failed to sync data when writing at offset {} for table {}",
                offset, self.table_id
            )
        })?;

        Ok(())
    }
}

/// Returns the table id if the filename is a valid table id, else none.
fn to_table_id(filename: &OsStr) -> Option<TableId> {
    let filename = filename.to_str()?;
    if filename.is_empty() {
        return None;
    }

    let mut table_id = 0;
    for c in filename.chars() {
        if let Some(d) = c.to_digit(10) {
            table_id = 10 * table_id + d;
            if table_id > u16::MAX as u32 {
                return None;
            }
        } else {
            return None;
        };
    }

    Some(table_id as u16)
}

/// Opens and returns a File of a table, which can be written and read.
fn read_table(entry: DirEntry, table_id: TableId, page_size: usize) -> Result<FileHandle> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(entry.path())
        .with_context(|| format!("Could not read data for table {}", table_id))?;

    let size = file
        .metadata()
        .with_context(|| format!("Could not read size of table {}", table_id))?
        .len();

    if size % page_size as u64 != 0 {
        return Err(Error::msg(format!(
            "Boundary check for table {} failed. {} is not divisable by page size {}",
            table_id, size, page_size
        )));
    }

    Ok(FileHandle::new(table_id, file, size, page_size))
}

#[cfg(test)]
mod tests {

    use super::FileManager;
    use crate::common::PageId;
    use crate::error::DbError;

    use anyhow::Result;
    use tempfile::tempdir;

    const PAGE_SIZE: usize = 128;

    #[test]
    fn basic_test() -> Result<()> {
        let data_dir = tempdir()?;
        let file_manager = FileManager::new(data_dir.path(), PAGE_SIZE)?;
        let table_id = 1;
        file_manager.create_table(table_id)?;
        assert!(file_manager.create_table(table_id).is_err());

        let pages = file_manager.num_pages(table_id)?;
        assert_eq!(pages, 0);

        let initial_data = [1u8; PAGE_SIZE];
        let page_no = file_manager.allocate_new_page(table_id, &initial_data)?;
        assert_eq!(page_no, 0);
        assert_eq!(file_manager.num_pages(table_id)?, 1);

        let mut read_buffer = [0u8; PAGE_SIZE];
        file_manager.read_page(PageId::new(table_id, page_no), &mut read_buffer)?;
        assert_eq!(read_buffer, initial_data);

        let updated = [2u8; PAGE_SIZE];
        file_manager.write_page(PageId::new(table_id, page_no), &updated)?;
        file_manager.read_page(PageId::new(table_id, page_no), &mut read_buffer)?;
        assert_eq!(read_buffer, updated);

        Ok(())
    }

    #[test]
    fn pages_beyond_end_of_file_are_invalid() -> Result<()> {
        let data_dir = tempdir()?;
        let file_manager = FileManager::new(data_dir.path(), PAGE_SIZE)?;
        file_manager.create_table(3)?;
        file_manager.allocate_new_page(3, &[0u8; PAGE_SIZE])?;

        let mut buffer = [0u8; PAGE_SIZE];
        let error = file_manager
            .read_page(PageId::new(3, 1), &mut buffer)
            .unwrap_err();
        assert_eq!(
            error.downcast_ref::<DbError>(),
            Some(&DbError::InvalidPage {
                page_id: PageId::new(3, 1),
                num_pages: 1
            })
        );

        let error = file_manager
            .write_page(PageId::new(3, 5), &buffer)
            .unwrap_err();
        assert!(error.downcast_ref::<DbError>().is_some());

        Ok(())
    }

    #[test]
    fn existing_tables_are_reopened() -> Result<()> {
        let data_dir = tempdir()?;
        {
            let file_manager = FileManager::new(data_dir.path(), PAGE_SIZE)?;
            file_manager.create_table(7)?;
            file_manager.create_table(8)?;
            for i in 0..3 {
                file_manager.allocate_new_page(7, &[i; PAGE_SIZE])?;
            }
        }

        let file_manager = FileManager::new(data_dir.path(), PAGE_SIZE)?;
        assert_eq!(file_manager.num_pages(7)?, 3);
        assert_eq!(file_manager.num_pages(8)?, 0);

        let mut buffer = [0u8; PAGE_SIZE];
        file_manager.read_page(PageId::new(7, 2), &mut buffer)?;
        assert_eq!(buffer, [2u8; PAGE_SIZE]);

        // a file whose size does not match the page size is rejected
        assert!(FileManager::new(data_dir.path(), PAGE_SIZE * 2 + 1).is_err());

        Ok(())
    }

    #[test]
    fn buffers_must_match_page_size() -> Result<()> {
        let data_dir = tempdir()?;
        let file_manager = FileManager::new(data_dir.path(), PAGE_SIZE)?;
        file_manager.create_table(1)?;
        assert!(file_manager.allocate_new_page(1, &[0u8; 16]).is_err());
        Ok(())
    }
}
