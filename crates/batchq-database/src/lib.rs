//! # batchq-database
//!
//! PostgreSQL connection management, migrations, and the two [`JobStore`]
//! implementations: [`PgJobStore`] for production and [`InMemoryJobStore`]
//! for tests and local development.

pub mod connection;
pub mod memory;
pub mod migration;
pub mod repositories;
pub mod store;

pub use connection::DatabasePool;
pub use memory::InMemoryJobStore;
pub use repositories::PgJobStore;
pub use store::JobStore;
