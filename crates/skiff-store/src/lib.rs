//! Durable state for the agent server: sessions, turns, steps, the event
//! log, file versions, permissions, and context items, all in one embedded SQLite
//! database behind typed repositories.

mod database;
mod error;
mod schema;

pub mod context;
pub mod events;
pub mod files;
pub mod permissions;
pub mod sessions;
pub mod turns;

pub use database::Database;
pub use error::StoreError;
