//! Request extractors.
//!
//! - [`auth::Caller`] -- Resolves the caller identifier from a JWT.

pub mod auth;
