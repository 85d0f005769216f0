use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::event::RawEvent;

/// Standard events the relay knows how to handle. Anything else is `Other`
/// and goes through the table's unknown-type policy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    PageView,
    ViewContent,
    ScrollDepth,
    Search,
    Lead,
    Contact,
    CompleteRegistration,
    Schedule,
    Subscribe,
    AddToCart,
    InitiateCheckout,
    Purchase,
    Other(String),
}

impl EventType {
    pub fn from_name(name: &str) -> EventType {
        match name.trim() {
            "PageView" => EventType::PageView,
            "ViewContent" => EventType::ViewContent,
            "ScrollDepth" => EventType::ScrollDepth,
            "Search" => EventType::Search,
            "Lead" => EventType::Lead,
            "Contact" => EventType::Contact,
            "CompleteRegistration" => EventType::CompleteRegistration,
            "Schedule" => EventType::Schedule,
            "Subscribe" => EventType::Subscribe,
            "AddToCart" => EventType::AddToCart,
            "InitiateCheckout" => EventType::InitiateCheckout,
            "Purchase" => EventType::Purchase,
            other => EventType::Other(other.to_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventType::PageView => "PageView",
            EventType::ViewContent => "ViewContent",
            EventType::ScrollDepth => "ScrollDepth",
            EventType::Search => "Search",
            EventType::Lead => "Lead",
            EventType::Contact => "Contact",
            EventType::CompleteRegistration => "CompleteRegistration",
            EventType::Schedule => "Schedule",
            EventType::Subscribe => "Subscribe",
            EventType::AddToCart => "AddToCart",
            EventType::InitiateCheckout => "InitiateCheckout",
            EventType::Purchase => "Purchase",
            EventType::Other(name) => name,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether an event type links to a persistent identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityRule {
    /// An external id is always attached, falling back to a session token.
    Required,
    /// Attached only from caller-provided identity (id, email, phone).
    Optional,
    /// Anonymous interaction: carrying an external id rejects the event.
    Forbidden,
}

/// Fields a policy can require or forbid on the raw event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventField {
    EventSourceUrl,
    SessionId,
    ExternalId,
    Email,
    Phone,
    Value,
    Currency,
}

impl EventField {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventField::EventSourceUrl => "event_source_url",
            EventField::SessionId => "session_id",
            EventField::ExternalId => "user_data.external_id",
            EventField::Email => "user_data.email",
            EventField::Phone => "user_data.phone",
            EventField::Value => "custom_data.value",
            EventField::Currency => "custom_data.currency",
        }
    }

    pub fn is_present(&self, event: &RawEvent) -> bool {
        let filled = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        match self {
            EventField::EventSourceUrl => filled(&event.event_source_url),
            EventField::SessionId => filled(&event.session_id),
            EventField::ExternalId => filled(&event.user_data.external_id),
            EventField::Email => filled(&event.user_data.email),
            EventField::Phone => filled(&event.user_data.phone),
            EventField::Value => event.custom_field("value").is_some(),
            EventField::Currency => event.custom_field("currency").is_some(),
        }
    }
}

impl fmt::Display for EventField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnrichmentFlags {
    pub browser_ids: bool,
    pub context_markers: bool,
    pub session_linkage: bool,
    pub monetary_defaults: bool,
    pub type_specific: bool,
}

impl EnrichmentFlags {
    pub const ALL: EnrichmentFlags = EnrichmentFlags {
        browser_ids: true,
        context_markers: true,
        session_linkage: true,
        monetary_defaults: true,
        type_specific: true,
    };

    pub const NO_MONETARY: EnrichmentFlags = EnrichmentFlags {
        monetary_defaults: false,
        ..EnrichmentFlags::ALL
    };

    pub const NONE: EnrichmentFlags = EnrichmentFlags {
        browser_ids: false,
        context_markers: false,
        session_linkage: false,
        monetary_defaults: false,
        type_specific: false,
    };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventPolicy {
    pub identity: IdentityRule,
    pub required: Vec<EventField>,
    pub forbidden: Vec<EventField>,
    pub enrichment: EnrichmentFlags,
}

impl EventPolicy {
    fn anonymous() -> Self {
        EventPolicy {
            identity: IdentityRule::Forbidden,
            required: vec![],
            forbidden: vec![EventField::ExternalId],
            enrichment: EnrichmentFlags::NO_MONETARY,
        }
    }

    fn identified(identity: IdentityRule) -> Self {
        EventPolicy {
            identity,
            required: vec![],
            forbidden: vec![],
            enrichment: EnrichmentFlags::ALL,
        }
    }

    fn pass_through() -> Self {
        EventPolicy {
            identity: IdentityRule::Optional,
            required: vec![],
            forbidden: vec![],
            enrichment: EnrichmentFlags {
                type_specific: false,
                monetary_defaults: false,
                ..EnrichmentFlags::ALL
            },
        }
    }
}

/// What to do with event names that have no entry in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownEventPolicy {
    #[default]
    Reject,
    PassThrough,
}

impl FromStr for UnknownEventPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "reject" => Ok(UnknownEventPolicy::Reject),
            "pass_through" | "passthrough" => Ok(UnknownEventPolicy::PassThrough),
            _ => Err(format!("Unknown event policy: {s}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PolicyTable {
    policies: HashMap<EventType, EventPolicy>,
    unknown: UnknownEventPolicy,
    pass_through: EventPolicy,
}

impl PolicyTable {
    pub fn empty(unknown: UnknownEventPolicy) -> Self {
        PolicyTable {
            policies: HashMap::new(),
            unknown,
            pass_through: EventPolicy::pass_through(),
        }
    }

    pub fn with_unknown_policy(mut self, unknown: UnknownEventPolicy) -> Self {
        self.unknown = unknown;
        self
    }

    pub fn insert(mut self, event_type: EventType, policy: EventPolicy) -> Self {
        self.policies.insert(event_type, policy);
        self
    }

    /// `None` means the event type must be rejected.
    pub fn lookup(&self, event_type: &EventType) -> Option<&EventPolicy> {
        match self.policies.get(event_type) {
            Some(policy) => Some(policy),
            None => match self.unknown {
                UnknownEventPolicy::Reject => None,
                UnknownEventPolicy::PassThrough => Some(&self.pass_through),
            },
        }
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        let identified = EventPolicy::identified(IdentityRule::Required);
        let optional = EventPolicy::identified(IdentityRule::Optional);

        PolicyTable::empty(UnknownEventPolicy::Reject)
            .insert(EventType::PageView, EventPolicy::anonymous())
            .insert(EventType::ViewContent, EventPolicy::anonymous())
            .insert(EventType::ScrollDepth, EventPolicy::anonymous())
            .insert(EventType::Search, EventPolicy::anonymous())
            .insert(EventType::Lead, identified.clone())
            .insert(EventType::Contact, identified.clone())
            .insert(EventType::CompleteRegistration, identified.clone())
            .insert(EventType::Schedule, identified.clone())
            .insert(EventType::Subscribe, identified.clone())
            .insert(EventType::AddToCart, optional.clone())
            .insert(EventType::InitiateCheckout, optional)
            .insert(
                EventType::Purchase,
                EventPolicy {
                    required: vec![EventField::Value, EventField::Currency],
                    ..identified
                },
            )
    }
}
