//! Data models for Wander

mod place;
mod sync_status;
mod trip;
mod visit;

pub use place::Place;
pub use sync_status::{EntityKind, SyncEntity, SyncStatus};
pub use trip::Trip;
pub use visit::{
    is_placeholder_photo, new_record_id, placeholder_photo_token, Rating, Visit,
    PLACEHOLDER_PHOTO_PREFIX,
};
