pub mod config;
pub mod db;
pub mod dialect;
pub mod migrate;
pub mod models;
pub mod params;
pub mod pool;
pub mod queries;

pub use config::DbConfig;
pub use db::{Db, DbError, DbTx};
pub use migrate::run_migrations;
pub use params::Param;
pub use pool::AnyPool;
