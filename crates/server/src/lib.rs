pub mod config;
pub mod error;
pub mod realtime_ws;
pub mod router;
pub mod routes;
pub mod state;
pub mod wire;

pub use config::SyncConfig;
pub use router::make_app;
pub use state::AppState;
