pub mod buffer_pool;
mod clock_replacer;

type PoolPos = usize;
