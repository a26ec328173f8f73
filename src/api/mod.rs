// API module
//
// This module contains the HTTP API for the ledger

pub mod handlers;
pub mod routes;
pub mod schema;

// Re-export main components for easier access
pub use handlers::AppState;
pub use routes::configure_routes;
