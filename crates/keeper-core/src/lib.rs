//! Core library for Keeper.
//!
//! Contains the streaming payload cipher, the secret data model, the
//! two-store vault persistence layer, the identity-scoped keeper service and
//! the revision-based sync protocol. This crate depends on `keeper-storage`
//! for the key-value backend trait and knows nothing about process wiring or
//! transports.

pub mod cipher;
pub mod error;
pub mod identity;
pub mod keeper;
pub mod model;
pub mod pipe;
pub mod remote;
pub mod store;
pub mod sync;
