//! Bankcore Ledger
//!
//! Account store, append-only ledger and fraud alert storage behind the
//! [`LedgerStore`], [`LedgerUnit`] and [`AlertSink`] traits, with an
//! in-memory backend and a PostgreSQL backend.

pub mod account;
pub mod journal;
pub mod store;
pub mod lock_manager;
pub mod memory;
pub mod postgres;

pub use account::{Account, NewAccount};
pub use journal::{NewTransaction, Transaction};
pub use store::{AlertSink, LedgerStore, LedgerUnit};
pub use lock_manager::{LockKey, LockManager, LockStats};
pub use memory::{FailPoint, LedgerSnapshot, MemoryStore};
pub use postgres::{DatabaseConfig, PgStore};
