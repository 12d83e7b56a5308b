use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Geographic location resolved by the redirect path at click time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub country: Option<String>,
    /// ISO country code (e.g., "US", "DE")
    pub country_code: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Mobile,
    Tablet,
    #[default]
    Desktop,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Mobile => "mobile",
            DeviceType::Tablet => "tablet",
            DeviceType::Desktop => "desktop",
        }
    }
}

impl FromStr for DeviceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mobile" => Ok(DeviceType::Mobile),
            "tablet" => Ok(DeviceType::Tablet),
            "desktop" => Ok(DeviceType::Desktop),
            other => Err(format!("unknown device type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Device {
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    pub brand: Option<String>,
    pub model: Option<String>,
}

/// Name/version pair shared by operating system and browser
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Software {
    pub name: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferrerType {
    #[default]
    Direct,
    Search,
    Social,
    Email,
    Other,
}

impl ReferrerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferrerType::Direct => "direct",
            ReferrerType::Search => "search",
            ReferrerType::Social => "social",
            ReferrerType::Email => "email",
            ReferrerType::Other => "other",
        }
    }
}

impl FromStr for ReferrerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "direct" => Ok(ReferrerType::Direct),
            "search" => Ok(ReferrerType::Search),
            "social" => Ok(ReferrerType::Social),
            "email" => Ok(ReferrerType::Email),
            "other" => Ok(ReferrerType::Other),
            other => Err(format!("unknown referrer type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Referrer {
    pub url: Option<String>,
    pub domain: Option<String>,
    #[serde(rename = "type")]
    pub referrer_type: ReferrerType,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Utm {
    pub source: Option<String>,
    pub medium: Option<String>,
    pub campaign: Option<String>,
    pub term: Option<String>,
    pub content: Option<String>,
}

/// A single recorded visit to a short link. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClickEvent {
    /// Store-assigned id, zero until appended
    #[serde(default)]
    pub id: i64,
    pub link_id: String,
    pub owner_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Salted one-way hash of the client IP; the raw IP is never stored
    pub visitor_hash: String,
    #[serde(default)]
    pub location: Location,
    #[serde(default)]
    pub device: Device,
    #[serde(default)]
    pub os: Software,
    #[serde(default)]
    pub browser: Software,
    #[serde(default)]
    pub referrer: Referrer,
    #[serde(default)]
    pub utm: Utm,
}

impl ClickEvent {
    /// Minimal event with every optional dimension left empty
    pub fn new(
        link_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        visitor_hash: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            link_id: link_id.into(),
            owner_id: None,
            timestamp,
            visitor_hash: visitor_hash.into(),
            location: Location::default(),
            device: Device::default(),
            os: Software::default(),
            browser: Software::default(),
            referrer: Referrer::default(),
            utm: Utm::default(),
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for ReferrerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
