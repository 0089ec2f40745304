//! Entity services: one facade per entity kind over the storage layers.

mod attachment_service;
mod note_service;
mod notification_service;
mod reply_service;
mod user_service;

pub use attachment_service::*;
pub use note_service::*;
pub use notification_service::*;
pub use reply_service::*;
pub use user_service::*;
