//! Turns a validated [`RawEvent`] into the [`EnrichedEvent`] that goes upstream.
//!
//! What is attached is driven by the [`EnrichmentFlags`] of the event policy:
//! browser identifiers, context markers, session linkage, monetary defaults and
//! markers specific to the event type. Missing values are filled in, values sent
//! by the caller always win.

use axum::http::header::{COOKIE, USER_AGENT};
use axum::http::HeaderMap;
use serde_json::{json, Map, Value};
use time::OffsetDateTime;
use url::Url;

use crate::event::{strip_empty_values, EnrichedEvent, OutboundUserData, RawEvent};
use crate::external_id::ResolvedExternalId;
use crate::pii;
use crate::policy::{EnrichmentFlags, EventPolicy, EventType};

pub const DEFAULT_ACTION_SOURCE: &str = "website";
pub const DEFAULT_CURRENCY: &str = "BRL";
const BROWSER_ID_PREFIX: &str = "fb.";
const UA_HASH_LEN: usize = 12;

/// What the inbound HTTP request tells us about the client.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub client_ip: String,
    pub user_agent: Option<String>,
    pub fbp_cookie: Option<String>,
    pub fbc_cookie: Option<String>,
    pub now: OffsetDateTime,
}

impl RequestContext {
    pub fn from_headers(headers: &HeaderMap, client_ip: String, now: OffsetDateTime) -> Self {
        let user_agent = headers
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(String::from);

        let mut fbp_cookie = None;
        let mut fbc_cookie = None;
        for header in headers.get_all(COOKIE) {
            let Ok(header) = header.to_str() else {
                continue;
            };
            for pair in header.split(';') {
                match pair.trim().split_once('=') {
                    Some(("_fbp", value)) => fbp_cookie = Some(value.trim().to_owned()),
                    Some(("_fbc", value)) => fbc_cookie = Some(value.trim().to_owned()),
                    _ => {}
                }
            }
        }

        RequestContext {
            client_ip,
            user_agent,
            fbp_cookie,
            fbc_cookie,
            now,
        }
    }

    pub fn now_millis(&self) -> i64 {
        (self.now.unix_timestamp_nanos() / 1_000_000) as i64
    }

    /// The client address, unless it could not be determined.
    fn known_ip(&self) -> Option<&str> {
        Some(self.client_ip.as_str()).filter(|ip| !ip.is_empty() && *ip != "unknown")
    }
}

/// An event that passed validation, with its id and hashed identity settled.
#[derive(Debug)]
pub struct PreparedEvent<'a> {
    pub event: RawEvent,
    pub event_type: EventType,
    pub policy: &'a EventPolicy,
    pub event_id: String,
    pub user_data: OutboundUserData,
    pub external_id: Option<ResolvedExternalId>,
}

#[derive(Debug, Clone)]
pub struct EventEnricher {
    default_event_source_url: Option<String>,
    default_currency: String,
}

impl Default for EventEnricher {
    fn default() -> Self {
        EventEnricher::new(None, DEFAULT_CURRENCY.to_owned())
    }
}

impl EventEnricher {
    pub fn new(default_event_source_url: Option<String>, default_currency: String) -> Self {
        Self {
            default_event_source_url,
            default_currency,
        }
    }

    pub fn enrich(&self, prepared: PreparedEvent<'_>, ctx: &RequestContext) -> EnrichedEvent {
        let PreparedEvent {
            event,
            event_type,
            policy,
            event_id,
            mut user_data,
            external_id,
        } = prepared;
        let flags: EnrichmentFlags = policy.enrichment;

        let event_source_url = non_empty(event.event_source_url.as_deref())
            .map(String::from)
            .or_else(|| self.default_event_source_url.clone());

        user_data.external_id = external_id.as_ref().map(|id| id.value.clone());
        user_data.client_ip_address = non_empty(event.user_data.client_ip_address.as_deref())
            .or(ctx.known_ip())
            .map(String::from);
        user_data.client_user_agent = non_empty(event.user_data.client_user_agent.as_deref())
            .or(ctx.user_agent.as_deref())
            .map(String::from);

        if flags.browser_ids {
            user_data.fbp = browser_id(event.user_data.fbp.as_deref())
                .or_else(|| browser_id(ctx.fbp_cookie.as_deref()));
            user_data.fbc = browser_id(event.user_data.fbc.as_deref())
                .or_else(|| browser_id(ctx.fbc_cookie.as_deref()))
                .or_else(|| fbc_from_click_id(event_source_url.as_deref(), ctx.now_millis()));
        } else {
            user_data.fbp = browser_id(event.user_data.fbp.as_deref());
            user_data.fbc = browser_id(event.user_data.fbc.as_deref());
        }

        let mut custom_data = event.custom_data;
        strip_empty_values(&mut custom_data);

        if flags.context_markers {
            set_default(&mut custom_data, "relay_version", json!(env!("CARGO_PKG_VERSION")));
            let quality = match &external_id {
                Some(id) if id.source.is_degraded() => "degraded",
                _ => "high",
            };
            set_default(&mut custom_data, "match_quality", json!(quality));
            if let Some(id) = &external_id {
                set_default(&mut custom_data, "external_id_source", json!(id.source.as_str()));
            }
        }

        if flags.session_linkage {
            if let Some(session_id) = non_empty(event.session_id.as_deref()) {
                set_default(&mut custom_data, "session_id", json!(session_id));
                set_default(&mut custom_data, "session_timestamp", json!(ctx.now.unix_timestamp()));
            }
            if let Some(ua) = user_data.client_user_agent.as_deref() {
                let mut digest = pii::hash(ua);
                digest.truncate(UA_HASH_LEN);
                set_default(&mut custom_data, "ua_hash", json!(digest));
            }
        }

        if flags.monetary_defaults {
            set_default(&mut custom_data, "value", json!(0));
            set_default(&mut custom_data, "currency", json!(self.default_currency));
        }

        if flags.type_specific {
            add_type_markers(&event_type, &mut custom_data, event_source_url.as_deref());
        }

        strip_empty_values(&mut custom_data);
        user_data.strip_empty();

        EnrichedEvent {
            event_name: event_type.as_str().to_owned(),
            event_id,
            event_time: event.event_time.unwrap_or_else(|| ctx.now.unix_timestamp()),
            event_source_url,
            action_source: non_empty(event.action_source.as_deref())
                .unwrap_or(DEFAULT_ACTION_SOURCE)
                .to_owned(),
            user_data,
            custom_data,
        }
    }
}

fn add_type_markers(event_type: &EventType, custom_data: &mut Map<String, Value>, url: Option<&str>) {
    match event_type {
        EventType::PageView => {
            if let Some(url) = url.and_then(|u| Url::parse(u).ok()) {
                set_default(custom_data, "page_path", json!(url.path()));
                if let Some(host) = url.host_str() {
                    set_default(custom_data, "page_host", json!(host));
                }
            }
        }
        EventType::ViewContent => {
            set_default(custom_data, "content_type", json!("product"));
        }
        EventType::ScrollDepth => {
            set_default(custom_data, "engagement_type", json!("scroll"));
            if let Some(depth) = custom_data.get("percent").and_then(Value::as_f64) {
                let depth = depth.clamp(0.0, 100.0);
                custom_data.insert(String::from("percent"), json!(depth));
            }
        }
        EventType::Lead => {
            set_default(custom_data, "content_category", json!("lead"));
            set_default(custom_data, "lead_event_source", json!(DEFAULT_ACTION_SOURCE));
        }
        EventType::CompleteRegistration => {
            set_default(custom_data, "content_category", json!("registration"));
            set_default(custom_data, "lead_event_source", json!(DEFAULT_ACTION_SOURCE));
        }
        EventType::Contact | EventType::Schedule => {
            set_default(custom_data, "contact_method", json!("form"));
        }
        EventType::AddToCart | EventType::InitiateCheckout | EventType::Purchase => {
            set_default(custom_data, "content_type", json!("product"));
            let items = custom_data
                .get("contents")
                .and_then(Value::as_array)
                .map(|contents| {
                    contents
                        .iter()
                        .map(|c| c.get("quantity").and_then(Value::as_u64).unwrap_or(1))
                        .fold(0u64, u64::saturating_add)
                });
            if let Some(items) = items {
                set_default(custom_data, "num_items", json!(items));
            }
        }
        EventType::Search | EventType::Subscribe | EventType::Other(_) => {}
    }
}

fn set_default(map: &mut Map<String, Value>, key: &str, value: Value) {
    map.entry(key).or_insert(value);
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Browser ids not following the `fb.` format are dropped.
fn browser_id(value: Option<&str>) -> Option<String> {
    non_empty(value)
        .filter(|v| v.starts_with(BROWSER_ID_PREFIX))
        .map(String::from)
}

/// Builds `fb.1.<ms>.<fbclid>` from the click id of a landing URL.
fn fbc_from_click_id(url: Option<&str>, now_millis: i64) -> Option<String> {
    let url = Url::parse(url?).ok()?;
    let (_, fbclid) = url
        .query_pairs()
        .find(|(key, value)| key == "fbclid" && !value.is_empty())?;
    Some(format!("fb.1.{now_millis}.{fbclid}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external_id::IdSource;
    use crate::policy::PolicyTable;
    use axum::http::HeaderValue;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2024-05-01 12:30:00 UTC);

    fn ctx() -> RequestContext {
        RequestContext {
            client_ip: String::from("203.0.113.7"),
            user_agent: Some(String::from("Mozilla/5.0")),
            fbp_cookie: None,
            fbc_cookie: None,
            now: NOW,
        }
    }

    fn enrich(
        table: &PolicyTable,
        event: serde_json::Value,
        external_id: Option<ResolvedExternalId>,
        ctx: &RequestContext,
    ) -> EnrichedEvent {
        let event = RawEvent::from_value(event).unwrap();
        let event_type = EventType::from_name(&event.event_name);
        let policy = table.lookup(&event_type).unwrap();
        let user_data = pii::hash_user_data(&event.user_data);

        EventEnricher::new(
            Some(String::from("https://shop.example.com")),
            String::from("BRL"),
        )
        .enrich(
            PreparedEvent {
                event,
                event_type,
                policy,
                event_id: String::from("evt_1"),
                user_data,
                external_id,
            },
            ctx,
        )
    }

    #[test]
    fn request_context_reads_cookies_and_user_agent() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("Mozilla/5.0"));
        headers.insert(
            COOKIE,
            HeaderValue::from_static("theme=dark; _fbp=fb.1.1700000000000.123; _fbc=fb.1.1700000000000.abc"),
        );

        let ctx = RequestContext::from_headers(&headers, String::from("203.0.113.7"), NOW);

        assert_eq!(ctx.user_agent.as_deref(), Some("Mozilla/5.0"));
        assert_eq!(ctx.fbp_cookie.as_deref(), Some("fb.1.1700000000000.123"));
        assert_eq!(ctx.fbc_cookie.as_deref(), Some("fb.1.1700000000000.abc"));
        assert_eq!(ctx.now_millis(), 1_714_566_600_000);
    }

    #[test]
    fn defaults_are_filled() {
        let table = PolicyTable::default();
        let event = enrich(&table, json!({ "event_name": "Search" }), None, &ctx());

        assert_eq!(event.event_time, NOW.unix_timestamp());
        assert_eq!(event.action_source, "website");
        assert_eq!(
            event.event_source_url.as_deref(),
            Some("https://shop.example.com")
        );
        assert_eq!(event.user_data.client_ip_address.as_deref(), Some("203.0.113.7"));
        assert_eq!(event.user_data.client_user_agent.as_deref(), Some("Mozilla/5.0"));
    }

    #[test]
    fn caller_values_win() {
        let table = PolicyTable::default();
        let event = enrich(
            &table,
            json!({
                "event_name": "Lead",
                "event_time": 1_700_000_000,
                "action_source": "chat",
                "custom_data": { "value": 150, "currency": "USD", "content_category": "quote" }
            }),
            None,
            &ctx(),
        );

        assert_eq!(event.event_time, 1_700_000_000);
        assert_eq!(event.action_source, "chat");
        assert_eq!(event.custom_data["value"], json!(150));
        assert_eq!(event.custom_data["currency"], json!("USD"));
        assert_eq!(event.custom_data["content_category"], json!("quote"));
    }

    #[test]
    fn monetary_defaults_only_for_value_bearing_types() {
        let table = PolicyTable::default();

        let lead = enrich(&table, json!({ "event_name": "Lead" }), None, &ctx());
        assert_eq!(lead.custom_data["value"], json!(0));
        assert_eq!(lead.custom_data["currency"], json!("BRL"));

        let page = enrich(&table, json!({ "event_name": "PageView" }), None, &ctx());
        assert!(page.custom_data.get("value").is_none());
        assert!(page.custom_data.get("currency").is_none());
    }

    #[test]
    fn browser_ids_come_from_cookies_and_click_id() {
        let table = PolicyTable::default();
        let mut ctx = ctx();
        ctx.fbp_cookie = Some(String::from("fb.1.1700000000000.42"));

        let event = enrich(
            &table,
            json!({
                "event_name": "Lead",
                "event_source_url": "https://shop.example.com/landing?fbclid=AbCd123",
                "user_data": { "fbc": "not-a-browser-id" }
            }),
            None,
            &ctx,
        );

        assert_eq!(event.user_data.fbp.as_deref(), Some("fb.1.1700000000000.42"));
        assert_eq!(
            event.user_data.fbc.as_deref(),
            Some("fb.1.1714566600000.AbCd123")
        );
    }

    #[test]
    fn context_markers_reflect_identity_quality() {
        let table = PolicyTable::default();

        let degraded = enrich(
            &table,
            json!({ "event_name": "Lead" }),
            Some(ResolvedExternalId {
                value: pii::hash("fingerprint"),
                source: IdSource::Synthesized,
            }),
            &ctx(),
        );
        assert_eq!(degraded.custom_data["match_quality"], json!("degraded"));
        assert_eq!(degraded.custom_data["external_id_source"], json!("synthesized"));
        assert_eq!(degraded.user_data.external_id, Some(pii::hash("fingerprint")));
        assert_eq!(
            degraded.custom_data["relay_version"],
            json!(env!("CARGO_PKG_VERSION"))
        );

        let high = enrich(
            &table,
            json!({ "event_name": "Lead" }),
            Some(ResolvedExternalId {
                value: pii::hash("a@b.co"),
                source: IdSource::Email,
            }),
            &ctx(),
        );
        assert_eq!(high.custom_data["match_quality"], json!("high"));
    }

    #[test]
    fn session_linkage() {
        let table = PolicyTable::default();
        let event = enrich(
            &table,
            json!({ "event_name": "Lead", "session_id": "sess-1" }),
            None,
            &ctx(),
        );

        assert_eq!(event.custom_data["session_id"], json!("sess-1"));
        assert_eq!(event.custom_data["session_timestamp"], json!(NOW.unix_timestamp()));
        let ua_hash = event.custom_data["ua_hash"].as_str().unwrap();
        assert_eq!(ua_hash.len(), 12);
        assert!(pii::hash("Mozilla/5.0").starts_with(ua_hash));
    }

    #[test]
    fn type_specific_markers() {
        let table = PolicyTable::default();

        let page = enrich(
            &table,
            json!({ "event_name": "PageView", "event_source_url": "https://shop.example.com/garden?x=1" }),
            None,
            &ctx(),
        );
        assert_eq!(page.custom_data["page_path"], json!("/garden"));
        assert_eq!(page.custom_data["page_host"], json!("shop.example.com"));

        let scroll = enrich(
            &table,
            json!({ "event_name": "ScrollDepth", "custom_data": { "percent": 140 } }),
            None,
            &ctx(),
        );
        assert_eq!(scroll.custom_data["engagement_type"], json!("scroll"));
        assert_eq!(scroll.custom_data["percent"], json!(100.0));

        let purchase = enrich(
            &table,
            json!({
                "event_name": "Purchase",
                "custom_data": {
                    "value": 99.9,
                    "currency": "BRL",
                    "contents": [{ "id": "a", "quantity": 2 }, { "id": "b" }]
                }
            }),
            None,
            &ctx(),
        );
        assert_eq!(purchase.custom_data["num_items"], json!(3));
        assert_eq!(purchase.custom_data["content_type"], json!("product"));

        let contact = enrich(&table, json!({ "event_name": "Schedule" }), None, &ctx());
        assert_eq!(contact.custom_data["contact_method"], json!("form"));
    }

    #[test]
    fn item_count_saturates() {
        let table = PolicyTable::default();
        let event = enrich(
            &table,
            json!({
                "event_name": "AddToCart",
                "custom_data": {
                    "contents": [{ "id": "a", "quantity": u64::MAX }, { "id": "b", "quantity": 2 }]
                }
            }),
            None,
            &ctx(),
        );

        assert_eq!(event.custom_data["num_items"], json!(u64::MAX));
    }

    #[test]
    fn empty_values_are_removed() {
        let table = PolicyTable::default();
        let mut ctx = ctx();
        ctx.user_agent = None;
        ctx.client_ip = String::from("unknown");

        let event = enrich(
            &table,
            json!({
                "event_name": "Search",
                "custom_data": { "search_string": "", "tags": [], "note": null, "kept": "yes" }
            }),
            None,
            &ctx,
        );

        assert_eq!(event.custom_data.get("search_string"), None);
        assert_eq!(event.custom_data.get("tags"), None);
        assert_eq!(event.custom_data.get("note"), None);
        assert_eq!(event.custom_data["kept"], json!("yes"));
        assert_eq!(event.user_data.client_ip_address, None);
        assert_eq!(event.user_data.client_user_agent, None);
    }
}
