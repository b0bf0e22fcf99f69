//! Teambook Storage - Adapter Trait and Backends
//!
//! One interface, three backends. The [`StorageBackend`] trait is the only
//! surface that speaks to durable storage; every other crate is
//! backend-agnostic. Backend discovery happens once at process start with a
//! live connectivity probe (see [`select_backend`]): a configured but
//! unreachable backend falls through to the next preference.

mod adapter;
mod postgres;
mod select;
mod sqlite;
mod store_redis;

pub use adapter::*;
pub use postgres::PostgresBackend;
pub use select::select_backend;
pub use sqlite::SqliteBackend;
pub use store_redis::RedisBackend;
