use validator::{ValidationError, ValidationErrors, ValidationErrorsKind};

use crate::error::{EventBusError, Result};
use crate::event::Event;

/// Runs an event's field rules and reports the first failure.
///
/// Constructed explicitly and held by whoever publishes; there is no
/// process-wide instance.
#[derive(Debug, Clone, Default)]
pub struct EventValidator {
    /// Prefix field names in messages with their nesting path
    qualified_paths: bool,
}

impl EventValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report nested failures as `location.latitude` rather than `latitude`.
    pub fn with_qualified_paths(mut self) -> Self {
        self.qualified_paths = true;
        self
    }

    pub fn validate(&self, event: &dyn Event) -> Result<()> {
        event
            .validate()
            .map_err(|errors| EventBusError::InvalidEvent(self.describe(&errors)))
    }

    /// Human readable description of the first failure, picked in field
    /// path order so the same event always yields the same message.
    pub fn describe(&self, errors: &ValidationErrors) -> String {
        let mut failures = Vec::new();
        collect(errors, String::new(), &mut failures);
        failures.sort_by(|a, b| a.0.cmp(&b.0));

        match failures.into_iter().next() {
            Some((path, error)) => {
                let field = if self.qualified_paths {
                    path.as_str()
                } else {
                    path.rsplit('.').next().unwrap_or(path.as_str())
                };
                format_error(field, error)
            }
            None => "validation failed".to_string(),
        }
    }
}

fn collect<'a>(errors: &'a ValidationErrors, prefix: String, out: &mut Vec<(String, &'a ValidationError)>) {
    for (field, kind) in errors.errors() {
        let path = if prefix.is_empty() {
            field.to_string()
        } else {
            format!("{}.{}", prefix, field)
        };

        match kind {
            ValidationErrorsKind::Field(list) => {
                if let Some(first) = list.first() {
                    out.push((path, first));
                }
            }
            ValidationErrorsKind::Struct(nested) => collect(nested, path, out),
            ValidationErrorsKind::List(items) => {
                for (index, nested) in items {
                    collect(nested, format!("{}[{}]", path, index), out);
                }
            }
        }
    }
}

fn format_error(field: &str, error: &ValidationError) -> String {
    let min = error.params.get("min");
    let max = error.params.get("max");
    let above = error.params.get("exclusive_min");

    match &*error.code {
        "required" => format!("field '{}' is required", field),
        "email" => format!("field '{}' must be a valid email", field),
        "uuid" => format!("field '{}' must be a valid UUID", field),
        "length" | "range" => match (min, max) {
            (Some(min), Some(max)) => format!("field '{}' must be between {} and {}", field, min, max),
            (Some(min), None) => format!("field '{}' must be at least {}", field, min),
            (None, Some(max)) => format!("field '{}' must be at most {}", field, max),
            (None, None) => match above {
                Some(above) => format!("field '{}' must be greater than {}", field, above),
                None => format!("field '{}' failed validation '{}'", field, error.code),
            },
        },
        code => format!("field '{}' failed validation '{}'", field, code),
    }
}

#[cfg(test)]
mod tests {
    use super::{format_error, EventValidator, ValidationError};
    use crate::event::BaseEvent;
    use serde::Serialize;
    use validator::Validate;

    #[derive(Debug, Serialize, Validate)]
    struct Signup {
        #[serde(flatten)]
        #[validate(nested)]
        base: BaseEvent,

        #[validate(email)]
        email: String,

        #[validate(range(min = 1, max = 10))]
        seats: u32,

        #[validate(range(min = 0.0))]
        price: f64,
    }

    crate::impl_event!(Signup);

    fn valid() -> Signup {
        Signup {
            base: BaseEvent::new("signup", "tests"),
            email: "someone@example.com".to_string(),
            seats: 2,
            price: 1.0,
        }
    }

    #[test]
    fn test_valid_event_passes() {
        assert!(EventValidator::new().validate(&valid()).is_ok());
    }

    #[test]
    fn test_messages_per_rule() {
        let validator = EventValidator::new();

        let mut event = valid();
        event.email = "nope".to_string();
        assert_eq!(
            validator.validate(&event).unwrap_err().to_string(),
            "invalid event: field 'email' must be a valid email"
        );

        let mut event = valid();
        event.seats = 11;
        let message = validator.validate(&event).unwrap_err().to_string();
        assert!(message.starts_with("invalid event: field 'seats' must be between 1"), "{}", message);

        let mut event = valid();
        event.price = -1.0;
        let message = validator.validate(&event).unwrap_err().to_string();
        assert!(message.starts_with("invalid event: field 'price' must be at least 0"), "{}", message);
    }

    #[test]
    fn test_nested_failures_and_ordering() {
        let mut event = valid();
        event.base.id.clear();
        event.email = "nope".to_string();

        // base.id sorts before email
        let err = EventValidator::new().validate(&event).unwrap_err();
        assert_eq!(err.to_string(), "invalid event: field 'id' is required");

        let err = EventValidator::new()
            .with_qualified_paths()
            .validate(&event)
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid event: field 'base.id' is required");
    }

    #[test]
    fn test_unknown_code_is_reported_verbatim() {
        let error = ValidationError::new("must_be_even");
        assert_eq!(
            format_error("count", &error),
            "field 'count' failed validation 'must_be_even'"
        );
    }
}
