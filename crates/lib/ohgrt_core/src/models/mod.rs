//! Domain models shared by the core and the API layer.

pub mod auth;
