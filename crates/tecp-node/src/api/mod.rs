//! API-style route handlers over the ledger.
//!
//! Pure functions so the CLI and any HTTP gateway share one behavior; the
//! gateway maps [`log_routes::ApiError`] to HTTP status codes verbatim.

pub mod log_routes;
