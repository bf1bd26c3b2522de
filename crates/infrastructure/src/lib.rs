pub mod database;
pub mod transport;

pub use database::{DatabaseManager, DbPool, SqliteQueueRepository};
