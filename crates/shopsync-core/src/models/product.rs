//! Product model

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Identifier assigned by the external resource when a product is created
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(String);

impl ProductId {
    /// Wrap an externally assigned identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the string representation of this ID
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProductId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ProductId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ProductId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Decimal price held as integer cents.
///
/// Negative values are representable so that validation, not parsing,
/// rejects them with a readable message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Price(i64);

impl Price {
    pub const fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    pub const fn cents(self) -> i64 {
        self.0
    }

    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(self) -> f64 {
        self.0 as f64 / 100.0
    }

    /// Numbers go through their shortest decimal form so that JSON `12.345`
    /// is rejected exactly like the string `"12.345"`.
    fn from_f64(value: f64) -> std::result::Result<Self, String> {
        if !value.is_finite() {
            return Err(format!("price must be a finite number, got {value}"));
        }
        value.to_string().parse()
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

impl FromStr for Price {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (negative, digits) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        let (whole, fraction) = digits.split_once('.').unwrap_or((digits, ""));

        let valid_digits = |part: &str| part.chars().all(|c| c.is_ascii_digit());
        if (whole.is_empty() && fraction.is_empty())
            || !valid_digits(whole)
            || !valid_digits(fraction)
        {
            return Err(format!("invalid price: {s:?}"));
        }
        if fraction.len() > 2 {
            return Err(format!("price has more than two decimal places: {s:?}"));
        }

        let whole: i64 = if whole.is_empty() {
            0
        } else {
            whole
                .parse()
                .map_err(|_| format!("price out of range: {s:?}"))?
        };
        let fraction: i64 = format!("{fraction:0<2}")
            .parse()
            .map_err(|_| format!("invalid price: {s:?}"))?;

        let cents = whole
            .checked_mul(100)
            .and_then(|value| value.checked_add(fraction))
            .ok_or_else(|| format!("price out of range: {s:?}"))?;
        Ok(Self(if negative { -cents } else { cents }))
    }
}

impl Serialize for Price {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_f64())
    }
}

impl<'de> Deserialize<'de> for Price {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawPrice {
            Number(f64),
            Text(String),
        }

        match RawPrice::deserialize(deserializer)? {
            RawPrice::Number(value) => Self::from_f64(value).map_err(serde::de::Error::custom),
            RawPrice::Text(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Caller-editable product fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductFields {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub price: Price,
    #[serde(default)]
    pub vendor: String,
}

impl ProductFields {
    /// Check required fields before anything leaves the process
    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(Error::validation("title must not be empty"));
        }
        if self.price.is_negative() {
            return Err(Error::validation(format!(
                "price must be non-negative, got {}",
                self.price
            )));
        }
        Ok(())
    }
}

/// A product as it exists in the external resource and the local mirror
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub id: ProductId,
    pub title: String,
    pub description: String,
    pub price: Price,
    pub vendor: String,
    /// Opaque version token from the external resource
    pub external_version: Option<String>,
}

impl ProductRecord {
    /// Editable fields of this record
    pub fn fields(&self) -> ProductFields {
        ProductFields {
            title: self.title.clone(),
            description: self.description.clone(),
            price: self.price,
            vendor: self.vendor.clone(),
        }
    }

    /// Field-for-field equality, ignoring version metadata
    pub fn same_fields(&self, other: &Self) -> bool {
        self.id == other.id
            && self.title == other.title
            && self.description == other.description
            && self.price == other.price
            && self.vendor == other.vendor
    }
}
