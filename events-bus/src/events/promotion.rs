use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::{PROMOTION_CREATED, PROMOTION_DELETED, PROMOTION_UPDATED};
use crate::event::BaseEvent;

const SOURCE: &str = "promotion-service";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct PromotionCreatedEvent {
    #[serde(flatten)]
    #[validate(nested)]
    pub base: BaseEvent,

    #[validate(length(min = 1, code = "required"))]
    pub promotion_id: String,

    #[validate(length(min = 1, code = "required"))]
    pub promotion_name: String,

    #[validate(length(min = 1, code = "required"))]
    pub distributor_id: String,

    #[validate(length(min = 1, code = "required"))]
    pub leaflet_id: String,

    #[validate(range(min = 1))]
    pub leaflet_page: i32,

    #[validate(range(exclusive_min = 0.0))]
    pub discounted_price: f64,

    pub created_at: DateTime<Utc>,

    /// Not known until the product has been identified
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_type_id: Option<String>,

    /// `None` while pending, empty when valid on any date
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dates: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_price: Option<f64>,
}

impl PromotionCreatedEvent {
    pub fn new(
        promotion_id: impl Into<String>,
        promotion_name: impl Into<String>,
        distributor_id: impl Into<String>,
        leaflet_id: impl Into<String>,
        leaflet_page: i32,
        discounted_price: f64,
    ) -> Self {
        Self {
            base: BaseEvent::new(PROMOTION_CREATED, SOURCE),
            promotion_id: promotion_id.into(),
            promotion_name: promotion_name.into(),
            distributor_id: distributor_id.into(),
            leaflet_id: leaflet_id.into(),
            leaflet_page,
            discounted_price,
            created_at: Utc::now(),
            product_type_id: None,
            dates: None,
            image_url: None,
            original_price: None,
        }
    }

    pub fn with_product_type(mut self, product_type_id: impl Into<String>) -> Self {
        self.product_type_id = Some(product_type_id.into());
        self
    }

    pub fn with_dates(mut self, dates: Vec<String>) -> Self {
        self.dates = Some(dates);
        self
    }

    pub fn with_image_url(mut self, image_url: impl Into<String>) -> Self {
        self.image_url = Some(image_url.into());
        self
    }

    pub fn with_original_price(mut self, original_price: f64) -> Self {
        self.original_price = Some(original_price);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct PromotionUpdatedEvent {
    #[serde(flatten)]
    #[validate(nested)]
    pub base: BaseEvent,

    #[validate(length(min = 1, code = "required"))]
    pub promotion_id: String,

    #[serde(default)]
    pub updated_fields: Vec<String>,

    pub updated_at: DateTime<Utc>,
}

impl PromotionUpdatedEvent {
    pub fn new(promotion_id: impl Into<String>, updated_fields: Vec<String>) -> Self {
        Self {
            base: BaseEvent::new(PROMOTION_UPDATED, SOURCE),
            promotion_id: promotion_id.into(),
            updated_fields,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct PromotionDeletedEvent {
    #[serde(flatten)]
    #[validate(nested)]
    pub base: BaseEvent,

    #[validate(length(min = 1, code = "required"))]
    pub promotion_id: String,

    pub deleted_at: DateTime<Utc>,
}

impl PromotionDeletedEvent {
    pub fn new(promotion_id: impl Into<String>) -> Self {
        Self {
            base: BaseEvent::new(PROMOTION_DELETED, SOURCE),
            promotion_id: promotion_id.into(),
            deleted_at: Utc::now(),
        }
    }
}

crate::impl_event!(PromotionCreatedEvent, PromotionUpdatedEvent, PromotionDeletedEvent);
