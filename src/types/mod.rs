mod access;
mod cursor;
mod enums;
mod models;

pub use access::{Access, effective_access};
pub use cursor::{Cursor, Page, paginate};
pub use enums::{Authenticity, EventType, TicketResolution, TicketStatus, Visibility};
pub use models::*;
