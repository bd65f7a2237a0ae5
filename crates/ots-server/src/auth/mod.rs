//! Authentication module for the server
//!
//! Peers authenticate with a public key that must be a member of the
//! authorized key set loaded at startup. Nothing else is accepted.

mod keys;

pub use keys::AuthorizedKeySet;
