pub mod log;

pub use log::{LogStore, LogStoreOptions};
