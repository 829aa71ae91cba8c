//! dhtchat - Encrypted two-party chat over a shared DHT record
//!
//! Each party owns one subkey of a record that only the two of them may write.
//! Lines are encrypted with a Diffie-Hellman shared secret and stored as
//! `nonce || ciphertext`; the other side polls for new sequence numbers.

mod types;
mod keys;
mod crypto;
pub mod codec;
mod dht;
mod node;
mod storage;
mod mailbox;
mod session;
mod commands;
mod config;

pub use types::*;
pub use keys::*;
pub use crypto::*;
pub use dht::*;
pub use node::*;
pub use storage::*;
pub use mailbox::*;
pub use session::*;
pub use commands::*;
pub use config::*;
