use std::collections::BTreeMap;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use heapdb::buffer::buffer_pool::BufferPool;
use heapdb::common::{StorageConfig, TableId, DEFAULT_PAGE_SIZE, DEFAULT_POOL_SIZE};
use heapdb::concurrency::TransactionManager;
use heapdb::error::DbError;
use heapdb::storage::heap::file::HeapFile;
use heapdb::tuple::schema::{ColumnDefinition, Schema, TypeId};
use heapdb::tuple::value::Value;
use heapdb::tuple::Tuple;
use log::{info, warn};
use rand::Rng;

/// Upper bound of the pause before retrying an aborted batch, in milliseconds
const MAX_BACKOFF_MS: u64 = 64;

#[derive(Parser)]
struct LoadConfig {
    #[arg(long, help = "Directory where data is stored")]
    data: PathBuf,

    #[arg(
        long,
        help = "If enabled, it assumes that data directory is empty and creates the table"
    )]
    new: bool,

    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE, help = "Size of a page in bytes")]
    page_size: usize,

    #[arg(long, default_value_t = DEFAULT_POOL_SIZE, help = "Size of buffer pool")]
    pool_size: usize,

    #[arg(long, default_value_t = 4, help = "Number of concurrent writers")]
    threads: usize,

    #[arg(long, default_value_t = 1000, help = "Rows inserted by every writer")]
    rows: usize,

    #[arg(long, default_value_t = 10, help = "Rows inserted per transaction")]
    batch: usize,

    #[arg(long, default_value_t = 1)]
    table: TableId,
}

fn schema() -> Schema {
    Schema::new(vec![
        ColumnDefinition::new(TypeId::Integer, "id"),
        ColumnDefinition::new(TypeId::Integer, "worker"),
        ColumnDefinition::new(TypeId::Text, "label"),
    ])
}

/// Random pause before the given retry. The bound doubles with every attempt
/// until it reaches `MAX_BACKOFF_MS`.
fn backoff(attempt: usize) -> Duration {
    let bound = (1u64 << attempt.min(6)).min(MAX_BACKOFF_MS);
    Duration::from_millis(rand::thread_rng().gen_range(0..=bound))
}

/// Inserts one batch in its own transaction, starting over whenever the transaction
/// gets aborted to break a deadlock. Returns how often it had to retry.
fn insert_batch(
    transaction_manager: &TransactionManager,
    heap_file: &HeapFile,
    worker: usize,
    ids: std::ops::Range<usize>,
) -> Result<usize> {
    let mut retries = 0;
    loop {
        let transaction = transaction_manager.start_transaction();
        let result = ids.clone().try_for_each(|id| {
            let mut tuple = Tuple::new(vec![
                Value::Integer(id as i32),
                Value::Integer(worker as i32),
                Value::String(format!("row {id} of worker {worker}")),
            ]);
            heap_file.insert_tuple(transaction.tid(), &mut tuple).map(|_| ())
        });

        match result {
            Ok(()) => {
                transaction.commit()?;
                return Ok(retries);
            }
            Err(e) if DbError::is_transaction_aborted(&e) => {
                warn!("Worker {worker} retries batch starting at {}: {e:#}", ids.start);
                transaction.abort()?;
                retries += 1;
                thread::sleep(backoff(retries));
            }
            Err(e) => {
                transaction.abort()?;
                return Err(e);
            }
        }
    }
}

fn run_worker(
    transaction_manager: &TransactionManager,
    heap_file: &HeapFile,
    config: &LoadConfig,
    worker: usize,
) -> Result<usize> {
    let first = worker * config.rows;
    let last = first + config.rows;
    let mut retries = 0;
    let mut start = first;
    while start < last {
        let end = (start + config.batch.max(1)).min(last);
        retries += insert_batch(transaction_manager, heap_file, worker, start..end)?;
        start = end;
    }
    Ok(retries)
}

fn main() -> Result<()> {
    env_logger::init();
    let config = LoadConfig::parse();

    let buffer_pool = BufferPool::open(
        &config.data,
        StorageConfig {
            page_size: config.page_size,
            pool_size: config.pool_size,
        },
    )?;
    if config.new {
        buffer_pool
            .create_table(config.table)
            .with_context(|| format!("Failed to create table {}", config.table))?;
    }
    let heap_file = HeapFile::new(config.table, schema(), &buffer_pool)?;
    let transaction_manager = TransactionManager::new(&buffer_pool);

    info!(
        "Loading {} rows with {} writers into table {} ({} tuples per page)",
        config.threads * config.rows,
        config.threads,
        config.table,
        heap_file.tuples_per_page()
    );

    let retries = thread::scope(|scope| -> Result<usize> {
        let handles = (0..config.threads)
            .map(|worker| {
                let transaction_manager = &transaction_manager;
                let heap_file = &heap_file;
                let config = &config;
                scope.spawn(move || run_worker(transaction_manager, heap_file, config, worker))
            })
            .collect::<Vec<_>>();

        let mut retries = 0;
        for handle in handles {
            retries += handle
                .join()
                .map_err(|_| anyhow::anyhow!("Writer thread panicked"))??;
        }
        Ok(retries)
    })?;

    let worker_column = heap_file
        .schema()
        .column_index("worker")
        .context("Schema has no worker column")?;
    let transaction = transaction_manager.start_transaction();
    let mut count = 0;
    let mut rows_per_worker = BTreeMap::new();
    for tuple in heap_file.iter(transaction.tid()) {
        let tuple = tuple?;
        if let Some(worker) = tuple.values()[worker_column].as_i32() {
            *rows_per_worker.entry(worker).or_insert(0usize) += 1;
        }
        count += 1;
    }
    transaction.commit()?;

    info!(
        "Table {} holds {} rows on {} pages, {} batches were retried",
        config.table,
        count,
        heap_file.num_pages()?,
        retries
    );
    info!("Rows per worker: {:?}", rows_per_worker);

    Ok(())
}
