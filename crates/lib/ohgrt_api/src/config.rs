//! API server configuration.

/// Configuration for the API server.
///
/// Security settings live on [`ohgrt_core::SecurityContext`]; this only
/// carries what the HTTP process itself needs.
#[derive(Clone, Debug)]
pub struct ApiConfig {
    /// Address to bind the HTTP listener (e.g. "127.0.0.1:8000").
    pub bind_addr: String,
    /// PostgreSQL connection URL.
    pub database_url: String,
}
