//! Bankcore Common Types
//!
//! This crate contains shared types used across bankcore, including
//! identifiers, monetary amounts, transfer request and alert states, risk
//! verdicts and the error taxonomy.

pub mod identifiers;
pub mod monetary;
pub mod request;
pub mod alert;
pub mod risk;
pub mod error;
pub mod time;

pub use identifiers::*;
pub use monetary::*;
pub use request::*;
pub use alert::*;
pub use risk::*;
pub use error::*;
pub use time::*;
