mod server;

pub use server::{DEFAULT_PORT, ServerConfig};
