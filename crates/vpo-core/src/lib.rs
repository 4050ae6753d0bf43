//! Core domain model for vehicle purchase offers: bounded categorical types,
//! persisted inspection entries, assessment attributes and the clock seam.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub mod scoring;

pub const CRATE_NAME: &str = "vpo-core";

/// Canonical key/value payload submitted to the entry store.
pub type ContentMap = BTreeMap<String, JsonValue>;

/// A categorical value parsed leniently from free text. Unknown input is `None`.
pub trait Categorical: Sized {
    fn parse(raw: &str) -> Option<Self>;
    fn as_str(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineType {
    Petrol,
    Diesel,
    Gas,
    Electric,
}

impl Categorical for EngineType {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "petrol" => Some(Self::Petrol),
            "diesel" => Some(Self::Diesel),
            "gas" => Some(Self::Gas),
            "electric" => Some(Self::Electric),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Petrol => "petrol",
            Self::Diesel => "diesel",
            Self::Gas => "gas",
            Self::Electric => "electric",
        }
    }
}

/// Drive train code. `4X4` input is stored as the two-letter `4X` code that
/// downstream consumers key on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DriveTrain {
    #[serde(rename = "2WD")]
    TwoWheel,
    #[serde(rename = "4X")]
    FourByFour,
}

impl Categorical for DriveTrain {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "2WD" => Some(Self::TwoWheel),
            "4X4" | "4X" => Some(Self::FourByFour),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::TwoWheel => "2WD",
            Self::FourByFour => "4X",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transmission {
    Auto,
    Manual,
}

impl Categorical for Transmission {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
        }
    }
}

/// Colour bucket. Anything outside the four resale-friendly colours is `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ColourBucket {
    Silver,
    Black,
    Grey,
    White,
    #[default]
    Other,
}

impl ColourBucket {
    pub fn bucket(raw: &str) -> Self {
        Self::parse(raw).unwrap_or(Self::Other)
    }

    pub fn is_preferred(&self) -> bool {
        !matches!(self, Self::Other)
    }
}

impl Categorical for ColourBucket {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "silver" => Some(Self::Silver),
            "black" => Some(Self::Black),
            "grey" => Some(Self::Grey),
            "white" => Some(Self::White),
            "other" => Some(Self::Other),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Silver => "silver",
            Self::Black => "black",
            Self::Grey => "grey",
            Self::White => "white",
            Self::Other => "other",
        }
    }
}

macro_rules! lenient_deserialize {
    ($($ty:ty),+) => {$(
        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                <$ty as Categorical>::parse(&raw).ok_or_else(|| {
                    serde::de::Error::custom(format!(
                        "unrecognized {} value '{}'",
                        stringify!($ty),
                        raw
                    ))
                })
            }
        }
    )+};
}

lenient_deserialize!(EngineType, DriveTrain, Transmission, ColourBucket);

/// Deserialize an optional categorical field, mapping unrecognized or
/// non-string values to `None` instead of failing the whole record.
pub fn de_categorical<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Categorical,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(value
        .as_ref()
        .and_then(JsonValue::as_str)
        .and_then(T::parse))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InspectionStatus {
    Unassigned,
    Assigned,
    Booked,
    Inspected,
    OfferSent,
    FollowUp,
    Purchased,
    Lost,
}

impl InspectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unassigned => "unassigned",
            Self::Assigned => "assigned",
            Self::Booked => "booked",
            Self::Inspected => "inspected",
            Self::OfferSent => "offer_sent",
            Self::FollowUp => "follow_up",
            Self::Purchased => "purchased",
            Self::Lost => "lost",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "unassigned" => Some(Self::Unassigned),
            "assigned" => Some(Self::Assigned),
            "booked" => Some(Self::Booked),
            "inspected" => Some(Self::Inspected),
            "offer_sent" => Some(Self::OfferSent),
            "follow_up" => Some(Self::FollowUp),
            "purchased" => Some(Self::Purchased),
            "lost" => Some(Self::Lost),
            _ => None,
        }
    }
}

impl fmt::Display for InspectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical persisted inspection entry as seen by maintenance and admin code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspectionEntry {
    pub id: Uuid,
    pub external_id: String,
    pub status: InspectionStatus,
    pub owner_id: String,
    pub inspector_email: Option<String>,
    pub sales_consultant_email: Option<String>,
    pub content: ContentMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Inspector-captured attributes consumed by the offer scoring engine.
///
/// Categorical fields deserialize leniently so a stored value the engine does
/// not recognize contributes zero instead of making the entry unreadable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AssessmentAttributes {
    pub vehicle_year: Option<i32>,
    #[serde(deserialize_with = "de_categorical")]
    pub transmission: Option<Transmission>,
    #[serde(deserialize_with = "de_categorical")]
    pub colour: Option<ColourBucket>,
    #[serde(deserialize_with = "de_categorical")]
    pub fuel: Option<EngineType>,
    pub odometer: Option<f64>,
    pub spare_key: bool,
    pub approximate_expenditure: Option<f64>,
    pub owners_manual: bool,
    pub sunroof: bool,
    pub sat_nav: bool,
    pub tradesman_extras: bool,
    pub sports_kit: bool,
    pub leather: bool,
    pub wheels: Option<String>,
    pub upgrades_mods: bool,
    pub review_price: Option<f64>,
    pub review_valuation: Option<f64>,
    pub onsite_physical_valuation: Option<f64>,
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}
