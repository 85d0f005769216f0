use crate::event::{OutboundUserData, RawEvent};
use crate::pii;
use crate::policy::IdentityRule;

/// Where the external id of an event came from, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdSource {
    CallerSupplied,
    Email,
    Phone,
    Session,
    Synthesized,
}

impl IdSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdSource::CallerSupplied => "caller",
            IdSource::Email => "email",
            IdSource::Phone => "phone",
            IdSource::Session => "session",
            IdSource::Synthesized => "synthesized",
        }
    }

    pub fn is_degraded(&self) -> bool {
        *self == IdSource::Synthesized
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedExternalId {
    pub value: String,
    pub source: IdSource,
}

/// Request-level data used as a last resort identity.
pub struct ClientFingerprint<'a> {
    pub ip: &'a str,
    pub user_agent: &'a str,
    pub now_millis: i64,
}

/// First match wins: caller id, hashed email, hashed phone, session token,
/// and finally a token synthesized from the client fingerprint. Sources are
/// never combined.
pub fn resolve(
    event: &RawEvent,
    hashed: &OutboundUserData,
    rule: IdentityRule,
    fingerprint: &ClientFingerprint,
) -> Option<ResolvedExternalId> {
    if rule == IdentityRule::Forbidden {
        return None;
    }

    let found = |value: String, source| Some(ResolvedExternalId { value, source });

    if let Some(value) = caller_supplied(event) {
        return found(value, IdSource::CallerSupplied);
    }
    if let Some(em) = &hashed.em {
        return found(em.clone(), IdSource::Email);
    }
    if let Some(ph) = &hashed.ph {
        return found(ph.clone(), IdSource::Phone);
    }
    if rule == IdentityRule::Optional {
        return None;
    }

    match event.session_id.as_deref().map(str::trim) {
        Some(session) if !session.is_empty() => found(pii::hash(session), IdSource::Session),
        _ => {
            tracing::warn!(
                event_name = %event.event_name,
                "no identity available, synthesizing external_id from client fingerprint"
            );
            let token = format!(
                "{}|{}|{}",
                fingerprint.ip, fingerprint.user_agent, fingerprint.now_millis
            );
            found(pii::hash(&token), IdSource::Synthesized)
        }
    }
}

fn caller_supplied(event: &RawEvent) -> Option<String> {
    let value = event.user_data.external_id.as_deref()?.trim();
    if value.is_empty() {
        None
    } else if pii::is_hashed(value) {
        Some(value.to_owned())
    } else {
        Some(pii::hash(&pii::normalize(value)))
    }
}
