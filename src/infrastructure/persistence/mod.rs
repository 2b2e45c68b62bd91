//! Encrypted local store

pub mod crypto;
pub mod store;

pub use crypto::RecordCipher;
pub use store::Store;
