use std::fmt;

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An event as submitted by the caller. Only fields the relay knows about are
/// kept: anything else is dropped at the boundary and never forwarded.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct RawEvent {
    #[serde(default)]
    pub event_name: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub event_id: Option<String>,
    pub event_time: Option<i64>,
    pub event_source_url: Option<String>,
    pub action_source: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub session_id: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub custom_data: Map<String, Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub user_data: RawUserData,
}

/// Identity and contact record of a [`RawEvent`]. Accepts the long field names
/// as well as the short names used by the Conversions API.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct RawUserData {
    #[serde(default, alias = "em", deserialize_with = "string_or_number")]
    pub email: Option<String>,
    #[serde(default, alias = "ph", deserialize_with = "string_or_number")]
    pub phone: Option<String>,
    #[serde(default, alias = "fn", deserialize_with = "string_or_number")]
    pub first_name: Option<String>,
    #[serde(default, alias = "ln", deserialize_with = "string_or_number")]
    pub last_name: Option<String>,
    #[serde(default, alias = "db", deserialize_with = "string_or_number")]
    pub birthdate: Option<String>,
    #[serde(default, alias = "ge", deserialize_with = "string_or_number")]
    pub gender: Option<String>,
    #[serde(default, alias = "ct", deserialize_with = "string_or_number")]
    pub city: Option<String>,
    #[serde(default, alias = "st", deserialize_with = "string_or_number")]
    pub state: Option<String>,
    #[serde(default, alias = "zp", alias = "postal_code", deserialize_with = "string_or_number")]
    pub zip: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub country: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub external_id: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub fbp: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub fbc: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub client_ip_address: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub client_user_agent: Option<String>,
}

impl RawEvent {
    /// Decodes one element of the inbound `data` array.
    pub fn from_value(value: Value) -> Result<RawEvent, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn custom_field(&self, key: &str) -> Option<&Value> {
        self.custom_data.get(key).filter(|v| !is_empty_value(v))
    }
}

/// The event as it is sent to the Conversions API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnrichedEvent {
    pub event_name: String,
    pub event_id: String,
    pub event_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_source_url: Option<String>,
    pub action_source: String,
    pub user_data: OutboundUserData,
    #[serde(skip_serializing_if = "Map::is_empty", default)]
    pub custom_data: Map<String, Value>,
}

/// Every personal field here holds a lowercase hex SHA-256 digest.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OutboundUserData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub em: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ph: Option<String>,
    #[serde(rename = "fn", skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ln: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ge: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ct: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub st: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fbp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fbc: Option<String>,
}

impl OutboundUserData {
    /// Replaces empty strings by `None` so they are never serialized.
    pub fn strip_empty(&mut self) {
        for field in [
            &mut self.em,
            &mut self.ph,
            &mut self.first_name,
            &mut self.ln,
            &mut self.db,
            &mut self.ge,
            &mut self.ct,
            &mut self.st,
            &mut self.zp,
            &mut self.country,
            &mut self.external_id,
            &mut self.client_ip_address,
            &mut self.client_user_agent,
            &mut self.fbp,
            &mut self.fbc,
        ] {
            if field.as_deref().is_some_and(|v| v.trim().is_empty()) {
                *field = None;
            }
        }
    }
}

/// Body of the outbound call.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundBatch {
    pub data: Vec<EnrichedEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_event_code: Option<String>,
}

/// Null, empty strings and empty arrays carry no information downstream.
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        _ => false,
    }
}

pub fn strip_empty_values(map: &mut Map<String, Value>) {
    map.retain(|_, v| !is_empty_value(v));
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct StringOrNumber;

    impl<'de> Visitor<'de> for StringOrNumber {
        type Value = Option<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string, a number or null")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            Ok(Some(v.to_owned()))
        }

        fn visit_string<E: de::Error>(self, v: String) -> Result<Self::Value, E> {
            Ok(Some(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_bool<E: de::Error>(self, v: bool) -> Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }

        fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<Self::Value, D::Error> {
            d.deserialize_any(StringOrNumber)
        }
    }

    deserializer.deserialize_option(StringOrNumber)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_accepts_short_names_and_numbers() {
        let event = RawEvent::from_value(json!({
            "event_name": "Lead",
            "event_id": 1234,
            "user_data": {
                "em": "user@example.com",
                "ph": 5511999998888u64,
                "zp": 1234,
                "unknown_key": "dropped"
            }
        }))
        .unwrap();

        assert_eq!(event.event_id.as_deref(), Some("1234"));
        assert_eq!(event.user_data.email.as_deref(), Some("user@example.com"));
        assert_eq!(event.user_data.phone.as_deref(), Some("5511999998888"));
        assert_eq!(event.user_data.zip.as_deref(), Some("1234"));
    }

    #[test]
    fn decode_tolerates_missing_optional_records() {
        let event = RawEvent::from_value(json!({ "event_name": "PageView" })).unwrap();

        assert!(event.custom_data.is_empty());
        assert_eq!(event.user_data, RawUserData::default());
    }

    #[test]
    fn decode_accepts_explicit_nulls() {
        let event = RawEvent::from_value(json!({
            "event_name": "PageView",
            "session_id": null,
            "user_data": { "email": null }
        }))
        .unwrap();

        assert_eq!(event.session_id, None);
        assert_eq!(event.user_data.email, None);
    }

    #[test]
    fn decode_treats_null_records_as_empty() {
        let event = RawEvent::from_value(json!({
            "event_name": "Lead",
            "user_data": null,
            "custom_data": null
        }))
        .unwrap();

        assert!(event.custom_data.is_empty());
        assert_eq!(event.user_data, RawUserData::default());
    }

    #[test]
    fn empty_values_are_stripped() {
        let mut map = json!({
            "a": null,
            "b": "",
            "c": [],
            "d": 0,
            "e": false,
            "f": "kept",
            "g": {}
        })
        .as_object()
        .unwrap()
        .clone();

        strip_empty_values(&mut map);

        assert_eq!(
            Value::Object(map),
            json!({ "d": 0, "e": false, "f": "kept", "g": {} })
        );
    }

    #[test]
    fn outbound_user_data_skips_absent_fields() {
        let mut user_data = OutboundUserData {
            first_name: Some(String::from("abc")),
            ct: Some(String::from("  ")),
            ..Default::default()
        };
        user_data.strip_empty();

        assert_eq!(serde_json::to_value(&user_data).unwrap(), json!({ "fn": "abc" }));
    }
}
