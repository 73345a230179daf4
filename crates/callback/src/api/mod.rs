//! HTTP surface: websocket endpoints, session listings and event streams.

mod callback;
mod connect;
mod error;
mod forwarded;
mod routes;
mod settings;

pub use error::ApiError;
pub use forwarded::{parse_local_networks, RemoteAddr};
pub use routes::create_router;
pub use settings::ApiSettings;
