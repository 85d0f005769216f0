use thiserror::Error;

use crate::event::RawEvent;
use crate::policy::{EventField, EventPolicy, EventType, IdentityRule, PolicyTable};

/// Reasons for dropping a single event. Never fatal to the batch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("event could not be decoded: {0}")]
    Malformed(String),
    #[error("event submitted with an empty event_name")]
    MissingEventName,
    #[error("unknown event type {0}")]
    UnknownEventType(String),
    #[error("missing required field {0}")]
    MissingField(EventField),
    #[error("field {0} is not allowed on this event type")]
    ForbiddenField(EventField),
    #[error("event_time must be a positive epoch timestamp in seconds")]
    InvalidEventTime,
}

impl ValidationError {
    pub fn to_metric_tag(&self) -> &'static str {
        match self {
            ValidationError::Malformed(_) => "malformed",
            ValidationError::MissingEventName => "missing_event_name",
            ValidationError::UnknownEventType(_) => "unknown_event_type",
            ValidationError::MissingField(_) => "missing_field",
            ValidationError::ForbiddenField(_) => "forbidden_field",
            ValidationError::InvalidEventTime => "invalid_event_time",
        }
    }
}

#[derive(Debug, PartialEq)]
pub struct ValidationOutcome<'a> {
    pub event_type: EventType,
    pub policy: Option<&'a EventPolicy>,
    pub reasons: Vec<ValidationError>,
}

impl<'a> ValidationOutcome<'a> {
    pub fn accepted(&self) -> bool {
        self.reasons.is_empty() && self.policy.is_some()
    }

    /// The policy of an accepted event, or every reason it was refused.
    pub fn into_result(self) -> Result<(EventType, &'a EventPolicy), Vec<ValidationError>> {
        match self.policy {
            Some(policy) if self.reasons.is_empty() => Ok((self.event_type, policy)),
            _ => Err(self.reasons),
        }
    }
}

#[derive(Clone)]
pub struct EventValidator {
    policies: PolicyTable,
}

impl EventValidator {
    pub fn new(policies: PolicyTable) -> Self {
        Self { policies }
    }

    pub fn validate(&self, event: &RawEvent) -> ValidationOutcome<'_> {
        let event_type = EventType::from_name(&event.event_name);
        let mut reasons = vec![];

        if event.event_name.trim().is_empty() {
            reasons.push(ValidationError::MissingEventName);
            return ValidationOutcome {
                event_type,
                policy: None,
                reasons,
            };
        }

        let Some(policy) = self.policies.lookup(&event_type) else {
            reasons.push(ValidationError::UnknownEventType(
                event_type.as_str().to_owned(),
            ));
            return ValidationOutcome {
                event_type,
                policy: None,
                reasons,
            };
        };

        if matches!(event.event_time, Some(t) if t <= 0) {
            reasons.push(ValidationError::InvalidEventTime);
        }

        for field in &policy.required {
            if !field.is_present(event) {
                reasons.push(ValidationError::MissingField(*field));
            }
        }

        let mut forbidden = policy.forbidden.clone();
        if policy.identity == IdentityRule::Forbidden && !forbidden.contains(&EventField::ExternalId)
        {
            forbidden.push(EventField::ExternalId);
        }
        for field in forbidden {
            if field.is_present(event) {
                reasons.push(ValidationError::ForbiddenField(field));
            }
        }

        ValidationOutcome {
            event_type,
            policy: Some(policy),
            reasons,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::UnknownEventPolicy;
    use serde_json::json;

    fn event(value: serde_json::Value) -> RawEvent {
        RawEvent::from_value(value).unwrap()
    }

    #[test]
    fn page_view_with_external_id_is_rejected() {
        let validator = EventValidator::new(PolicyTable::default());
        let outcome = validator.validate(&event(json!({
            "event_name": "PageView",
            "user_data": { "external_id": "abc" }
        })));

        assert!(!outcome.accepted());
        assert_eq!(
            outcome.reasons,
            vec![ValidationError::ForbiddenField(EventField::ExternalId)]
        );
    }

    #[test]
    fn lead_with_external_id_is_accepted() {
        let validator = EventValidator::new(PolicyTable::default());
        let outcome = validator.validate(&event(json!({
            "event_name": "Lead",
            "user_data": { "external_id": "abc" }
        })));

        assert!(outcome.accepted());
        assert_eq!(outcome.event_type, EventType::Lead);
    }

    #[test]
    fn empty_name_is_rejected() {
        let validator = EventValidator::new(PolicyTable::default());
        let outcome = validator.validate(&event(json!({ "event_name": "  " })));

        assert_eq!(outcome.reasons, vec![ValidationError::MissingEventName]);
    }

    #[test]
    fn unknown_type_is_rejected_unless_pass_through() {
        let raw = event(json!({ "event_name": "MadeUp" }));

        let validator = EventValidator::new(PolicyTable::default());
        assert_eq!(
            validator.validate(&raw).into_result().unwrap_err(),
            vec![ValidationError::UnknownEventType(String::from("MadeUp"))]
        );

        let validator = EventValidator::new(
            PolicyTable::default().with_unknown_policy(UnknownEventPolicy::PassThrough),
        );
        assert!(validator.validate(&raw).accepted());
    }

    #[test]
    fn purchase_requires_value_and_currency() {
        let validator = EventValidator::new(PolicyTable::default());

        let outcome = validator.validate(&event(json!({
            "event_name": "Purchase",
            "custom_data": { "value": 10, "currency": "" }
        })));
        assert_eq!(
            outcome.reasons,
            vec![ValidationError::MissingField(EventField::Currency)]
        );

        let outcome = validator.validate(&event(json!({
            "event_name": "Purchase",
            "custom_data": { "value": 10, "currency": "BRL" }
        })));
        assert!(outcome.accepted());
    }

    #[test]
    fn reasons_accumulate() {
        let validator = EventValidator::new(PolicyTable::default());
        let outcome = validator.validate(&event(json!({
            "event_name": "ScrollDepth",
            "event_time": -5,
            "user_data": { "external_id": "abc" }
        })));

        assert_eq!(outcome.reasons.len(), 2);
    }
}
