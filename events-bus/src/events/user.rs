use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::{USER_LOCATION_UPDATED, USER_PREFERENCES_UPDATED, USER_REGISTERED};
use crate::event::BaseEvent;

const SOURCE: &str = "user-service";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct UserRegisteredEvent {
    #[serde(flatten)]
    #[validate(nested)]
    pub base: BaseEvent,

    #[validate(length(min = 1, code = "required"))]
    pub user_id: String,

    #[validate(email)]
    pub email: String,

    pub registered_at: DateTime<Utc>,
}

impl UserRegisteredEvent {
    pub fn new(user_id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            base: BaseEvent::new(USER_REGISTERED, SOURCE),
            user_id: user_id.into(),
            email: email.into(),
            registered_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct UserPreferencesUpdatedEvent {
    #[serde(flatten)]
    #[validate(nested)]
    pub base: BaseEvent,

    #[validate(length(min = 1, code = "required"))]
    pub user_id: String,

    #[serde(default)]
    pub favorite_distributors: Vec<String>,

    #[serde(default)]
    pub favorite_categories: Vec<String>,

    pub updated_at: DateTime<Utc>,
}

impl UserPreferencesUpdatedEvent {
    pub fn new(
        user_id: impl Into<String>,
        favorite_distributors: Vec<String>,
        favorite_categories: Vec<String>,
    ) -> Self {
        Self {
            base: BaseEvent::new(USER_PREFERENCES_UPDATED, SOURCE),
            user_id: user_id.into(),
            favorite_distributors,
            favorite_categories,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct UserLocationUpdatedEvent {
    #[serde(flatten)]
    #[validate(nested)]
    pub base: BaseEvent,

    #[validate(length(min = 1, code = "required"))]
    pub user_id: String,

    #[validate(range(min = -90.0, max = 90.0))]
    pub latitude: f64,

    #[validate(range(min = -180.0, max = 180.0))]
    pub longitude: f64,

    pub updated_at: DateTime<Utc>,
}

impl UserLocationUpdatedEvent {
    pub fn new(user_id: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            base: BaseEvent::new(USER_LOCATION_UPDATED, SOURCE),
            user_id: user_id.into(),
            latitude,
            longitude,
            updated_at: Utc::now(),
        }
    }
}

crate::impl_event!(UserRegisteredEvent, UserPreferencesUpdatedEvent, UserLocationUpdatedEvent);
