//! Durable storage backends, enabled with the `postgres` feature.
//!
//! This module provides [`PostgresTaskStore`], a PostgreSQL-backed
//! implementation of the [`TaskStore`](crate::store::TaskStore) and
//! [`TaskSweeper`](crate::store::TaskSweeper) traits.

pub mod postgres;

pub use postgres::PostgresTaskStore;
