//! Domain model: accounts, dialogs, message filtering

pub mod account;
pub mod dialog;
pub mod filter;
pub mod shared;
