//! DeepRead HTTP and WebSocket surface.

pub mod hub;
pub mod routes;
pub mod state;

pub use routes::build_router;
pub use state::AppState;
