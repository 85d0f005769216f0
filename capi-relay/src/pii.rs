//! Normalization and hashing of personal fields.
//!
//! Nothing personal leaves the relay in clear text: each field is put in its
//! canonical form, checked for a plausible shape and hashed with SHA-256.
//! Values that do not pass the shape check are dropped instead.

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::event::{OutboundUserData, RawUserData};

static EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("valid email regex"));
static SHA256_HEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9a-f]{64}$").expect("valid digest regex"));

const PHONE_DIGITS: std::ops::RangeInclusive<usize> = 10..=15;
const MIN_NAME_LEN: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PiiField {
    Email,
    Phone,
    FirstName,
    LastName,
    Birthdate,
    Gender,
    City,
    State,
    Zip,
    Country,
}

impl PiiField {
    pub fn as_str(&self) -> &'static str {
        match self {
            PiiField::Email => "em",
            PiiField::Phone => "ph",
            PiiField::FirstName => "fn",
            PiiField::LastName => "ln",
            PiiField::Birthdate => "db",
            PiiField::Gender => "ge",
            PiiField::City => "ct",
            PiiField::State => "st",
            PiiField::Zip => "zp",
            PiiField::Country => "country",
        }
    }
}

pub fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

pub fn hash(canonical: &str) -> String {
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// True for a 64 character lowercase hex string, i.e. something we already hashed.
pub fn is_hashed(value: &str) -> bool {
    SHA256_HEX.is_match(value)
}

/// Canonical form of a personal field, or `None` when the value does not look
/// like a valid instance of that field.
pub fn canonicalize(field: PiiField, value: &str) -> Option<String> {
    let value = normalize(value);
    let canonical = match field {
        PiiField::Email => Some(value).filter(|v| EMAIL.is_match(v)),
        PiiField::Phone => {
            let digits = only(&value, |c| c.is_ascii_digit());
            Some(digits).filter(|d| PHONE_DIGITS.contains(&d.len()))
        }
        PiiField::FirstName | PiiField::LastName => {
            Some(value).filter(|v| v.chars().count() >= MIN_NAME_LEN)
        }
        PiiField::Birthdate => {
            let digits = only(&value, |c| c.is_ascii_digit());
            Some(digits).filter(|d| is_plausible_birthdate(d))
        }
        PiiField::Gender => match value.as_str() {
            "m" | "male" => Some(String::from("m")),
            "f" | "female" => Some(String::from("f")),
            _ => None,
        },
        PiiField::City | PiiField::State => {
            let letters = only(&value, char::is_alphabetic);
            Some(letters).filter(|v| v.chars().count() >= MIN_NAME_LEN)
        }
        PiiField::Zip => {
            let compact = only(&value, char::is_alphanumeric);
            Some(compact).filter(|v| v.len() >= 3)
        }
        PiiField::Country => {
            let letters = only(&value, |c| c.is_ascii_alphabetic());
            Some(letters).filter(|v| v.len() == 2)
        }
    };

    canonical.filter(|v| !v.is_empty())
}

/// Hashes a single field. Digests supplied by the caller pass through as-is.
pub fn hash_field(field: PiiField, value: &str) -> Option<String> {
    let trimmed = value.trim();
    if is_hashed(trimmed) {
        return Some(trimmed.to_owned());
    }

    match canonicalize(field, trimmed) {
        Some(canonical) => Some(hash(&canonical)),
        None => {
            tracing::debug!(field = field.as_str(), "dropping personal field failing validation");
            None
        }
    }
}

/// Hashes every personal field of a user record. Transport fields (ip, user
/// agent, browser ids) and the external id are handled elsewhere.
pub fn hash_user_data(raw: &RawUserData) -> OutboundUserData {
    let h = |field, value: &Option<String>| value.as_deref().and_then(|v| hash_field(field, v));

    OutboundUserData {
        em: h(PiiField::Email, &raw.email),
        ph: h(PiiField::Phone, &raw.phone),
        first_name: h(PiiField::FirstName, &raw.first_name),
        ln: h(PiiField::LastName, &raw.last_name),
        db: h(PiiField::Birthdate, &raw.birthdate),
        ge: h(PiiField::Gender, &raw.gender),
        ct: h(PiiField::City, &raw.city),
        st: h(PiiField::State, &raw.state),
        zp: h(PiiField::Zip, &raw.zip),
        country: h(PiiField::Country, &raw.country),
        ..Default::default()
    }
}

fn only(value: &str, keep: impl Fn(char) -> bool) -> String {
    value.chars().filter(|c| keep(*c)).collect()
}

fn is_plausible_birthdate(digits: &str) -> bool {
    if digits.len() != 8 {
        return false;
    }
    let (Ok(year), Ok(month), Ok(day)) = (
        digits[0..4].parse::<u32>(),
        digits[4..6].parse::<u32>(),
        digits[6..8].parse::<u32>(),
    ) else {
        return false;
    };

    (1900..=2100).contains(&year) && (1..=12).contains(&month) && (1..=31).contains(&day)
}
