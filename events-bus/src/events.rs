//! Concrete event payloads exchanged between services.
//!
//! Each type flattens a [`BaseEvent`](crate::event::BaseEvent) into its body
//! and declares its field rules with `validator` derives. The bus itself only
//! sees them through the [`Event`](crate::event::Event) capability.

pub mod product;
pub mod promotion;
pub mod user;

pub use product::ProductIdentifiedEvent;
pub use promotion::{PromotionCreatedEvent, PromotionDeletedEvent, PromotionUpdatedEvent};
pub use user::{UserLocationUpdatedEvent, UserPreferencesUpdatedEvent, UserRegisteredEvent};

// Event types
pub const PROMOTION_CREATED: &str = "promotion.created";
pub const PROMOTION_UPDATED: &str = "promotion.updated";
pub const PROMOTION_DELETED: &str = "promotion.deleted";
pub const PRODUCT_IDENTIFIED: &str = "product.identified";
pub const USER_REGISTERED: &str = "user.registered";
pub const USER_PREFERENCES_UPDATED: &str = "user.preferences.updated";
pub const USER_LOCATION_UPDATED: &str = "user.location.updated";

// Streams
pub const STREAM_PROMOTIONS: &str = "events:promotions";
pub const STREAM_PRODUCTS: &str = "events:products";
pub const STREAM_USERS: &str = "events:users";

/// Stream an event type is published on, if it belongs to the catalog.
pub fn stream_for(event_type: &str) -> Option<&'static str> {
    match event_type {
        PROMOTION_CREATED | PROMOTION_UPDATED | PROMOTION_DELETED => Some(STREAM_PROMOTIONS),
        PRODUCT_IDENTIFIED => Some(STREAM_PRODUCTS),
        USER_REGISTERED | USER_PREFERENCES_UPDATED | USER_LOCATION_UPDATED => Some(STREAM_USERS),
        _ => None,
    }
}
