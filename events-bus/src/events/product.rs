use serde::{Deserialize, Serialize};
use validator::Validate;

use super::PRODUCT_IDENTIFIED;
use crate::event::BaseEvent;

/// A product recognised on a promotion leaflet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ProductIdentifiedEvent {
    #[serde(flatten)]
    #[validate(nested)]
    pub base: BaseEvent,

    #[validate(length(min = 1, code = "required"))]
    pub promotion_id: String,

    #[validate(length(min = 1, code = "required"))]
    pub product_id: String,

    #[validate(length(min = 1, code = "required"))]
    pub product_type: String,

    #[validate(length(min = 1, code = "required"))]
    pub category_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,

    /// Identification confidence in `[0, 1]`
    #[validate(range(min = 0.0, max = 1.0))]
    pub confidence: f64,
}

impl ProductIdentifiedEvent {
    pub fn new(
        promotion_id: impl Into<String>,
        product_id: impl Into<String>,
        product_type: impl Into<String>,
        category_id: impl Into<String>,
        brand: Option<String>,
        confidence: f64,
    ) -> Self {
        Self {
            base: BaseEvent::new(PRODUCT_IDENTIFIED, "product-identifier"),
            promotion_id: promotion_id.into(),
            product_id: product_id.into(),
            product_type: product_type.into(),
            category_id: category_id.into(),
            brand,
            confidence,
        }
    }
}

crate::impl_event!(ProductIdentifiedEvent);
