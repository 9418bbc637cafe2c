//! Arbor domain model
//!
//! Users and their sponsor-tree position, balance rows with checked
//! mutations, the reward/transaction flow log, on-chain transfer records
//! and daily performance snapshots.
//!
//! Monetary unit: [`Amount`] (a `Decimal` kept at [`AMOUNT_SCALE`] digits).

pub mod address;
pub mod amount;
pub mod balance;
pub mod flow;
pub mod history;
pub mod user;

pub use address::*;
pub use amount::*;
pub use balance::*;
pub use flow::*;
pub use history::*;
pub use user::*;
