mod helpers;
mod middleware;
mod token;

pub use middleware::{AuthError, RequireUser, Viewer};
pub use token::{TokenGenerator, issue_token, parse_token};
