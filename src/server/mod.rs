mod api;
pub mod dto;
mod internal;
pub mod response;
mod router;

pub use api::api_router;
pub use router::{AppState, create_router};
