pub mod file;
pub mod page;
