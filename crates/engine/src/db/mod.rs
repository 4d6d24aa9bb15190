//! PostgreSQL connectivity for the metadata store and run ledger.

pub mod pool;
pub mod schema;

pub use pool::{connect, ping, DbPool};
pub use schema::init_schema;
