//! Store - Postgres implementation of the repository contract
//!
//! Writes go through ordinary tables; the trigger installed by
//! [`run_migrations`](crate::schema::run_migrations) turns each committed row
//! change into the notification the event source consumes.

mod helpers;
mod repository;


pub use repository::PgRepository;
