mod auth;
mod error;
mod middleware;
mod protocol;
mod routes;
mod server;
mod state;

pub use error::ApiError;
pub use server::GatewayServer;
pub use state::AppState;
