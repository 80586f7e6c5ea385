//! # ohgrt_core
//!
//! Request-boundary security for OhGrt: access/refresh tokens, replay
//! protection, sliding-window rate limiting and the shared key-value store
//! they sit on. Nothing in here knows about HTTP; `ohgrt_api` adapts it.

pub mod auth;
pub mod context;
pub mod gate;
pub mod migrate;
pub mod models;
pub mod nonce;
pub mod ratelimit;
pub mod settings;
pub mod store;

pub use context::SecurityContext;

/// Current wall-clock time as fractional Unix seconds.
pub fn unix_now() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1_000_000.0
}

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_not_empty() {
        assert!(!version().is_empty());
    }

    #[test]
    fn unix_now_tracks_chrono() {
        let reference = chrono::Utc::now().timestamp() as f64;
        let now = unix_now();
        assert!((now - reference).abs() < 2.0);
    }
}
