//! Deterministic offer scoring.
//!
//! Every function here is pure and infallible: unrecognized categorical inputs
//! and missing numbers contribute zero, so a grade is always produced for each
//! of the four sub-scores.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{AssessmentAttributes, ColourBucket, EngineType, Transmission};

pub const WEIGHT_HIGH: f64 = 3.0;
pub const WEIGHT_MEDIUM: f64 = 2.0;
pub const WEIGHT_LOW: f64 = 1.0;

const MAKE_MODEL_DIVISOR: f64 = 10.0;
const CONDITION_DIVISOR: f64 = 6.0;
const EXTRAS_DIVISOR: f64 = 14.0;

const AGE_EXPONENT: f64 = 1.3;
const ODOMETER_EXPONENT: f64 = 1.05;
const ODOMETER_CEILING_KM: f64 = 250_000.0;
const EXPENDITURE_THRESHOLD: f64 = 750.0;
const INDICATOR_THRESHOLD: f64 = 0.6;
const TIE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
    F,
}

impl Grade {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
            Self::D => "D",
            Self::F => "F",
        }
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a weighted ratio onto a grade band. A value sitting exactly on a
/// threshold belongs to the lower band.
pub fn bandify(ratio: f64) -> Grade {
    if ratio > 0.95 {
        Grade::A
    } else if ratio > 0.6 {
        Grade::B
    } else if ratio > 0.3 {
        Grade::C
    } else if ratio >= 0.0 {
        Grade::D
    } else {
        Grade::F
    }
}

/// Round to zero decimals; exact halves go toward zero.
pub fn round_half_down(value: f64) -> f64 {
    let floor = value.floor();
    if ((value - floor) - 0.5).abs() < TIE_EPSILON {
        if value >= 0.0 {
            floor
        } else {
            floor + 1.0
        }
    } else {
        value.round()
    }
}

/// `(age + 1) / (age + 1)^1.3`; 1.0 for a brand-new vehicle, strictly
/// decreasing after that. Negative ages are treated as zero.
pub fn age_factor(age: i32) -> f64 {
    let base = f64::from(age.max(0)) + 1.0;
    base / base.powf(AGE_EXPONENT)
}

pub fn transmission_factor(transmission: Option<Transmission>) -> f64 {
    match transmission {
        Some(Transmission::Auto) => 1.0,
        _ => 0.0,
    }
}

pub fn colour_factor(colour: Option<ColourBucket>) -> f64 {
    match colour {
        Some(bucket) if bucket.is_preferred() => 1.0,
        _ => 0.0,
    }
}

pub fn fuel_factor(fuel: Option<EngineType>) -> f64 {
    match fuel {
        Some(EngineType::Diesel) => 1.0,
        Some(EngineType::Gas) => 0.5,
        _ => 0.0,
    }
}

/// `1 - km^1.05 / 250000^1.05`. Goes negative past the ceiling, which is a
/// valid input that can grade F.
pub fn odometer_factor(odometer_km: f64) -> f64 {
    let km = if odometer_km.is_finite() {
        odometer_km.max(0.0)
    } else {
        0.0
    };
    1.0 - km.powf(ODOMETER_EXPONENT) / ODOMETER_CEILING_KM.powf(ODOMETER_EXPONENT)
}

fn flag(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

fn indicator(factor: f64) -> u8 {
    u8::from(factor > INDICATOR_THRESHOLD)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubScore {
    pub grade: Grade,
    pub weighted_percentage: f64,
    /// Per-variable emphasis flags for the UI; not part of the total.
    pub indicators: BTreeMap<String, u8>,
}

impl SubScore {
    fn from_weighted(weighted_percentage: f64, indicators: &[(&str, f64)]) -> Self {
        Self {
            grade: bandify(weighted_percentage),
            weighted_percentage,
            indicators: indicators
                .iter()
                .map(|(name, factor)| ((*name).to_string(), indicator(*factor)))
                .collect(),
        }
    }
}

/// Whole years between `vehicle_year` and `current_year`. A missing year is
/// year 0, like any other missing number, which makes the age factor vanish.
pub fn vehicle_age(vehicle_year: Option<i32>, current_year: i32) -> i32 {
    let age = i64::from(current_year) - i64::from(vehicle_year.unwrap_or(0));
    i32::try_from(age.max(0)).unwrap_or(i32::MAX)
}

pub fn make_model_score(attrs: &AssessmentAttributes, current_year: i32) -> SubScore {
    let age = age_factor(vehicle_age(attrs.vehicle_year, current_year));
    let transmission = transmission_factor(attrs.transmission);
    let colour = colour_factor(attrs.colour);
    let fuel = fuel_factor(attrs.fuel);

    let weighted = (round_half_down(age * WEIGHT_HIGH)
        + transmission * WEIGHT_HIGH
        + colour * WEIGHT_MEDIUM
        + fuel * WEIGHT_MEDIUM)
        / MAKE_MODEL_DIVISOR;

    SubScore::from_weighted(
        weighted,
        &[
            ("age", age),
            ("transmission", transmission),
            ("colour", colour),
            ("fuel", fuel),
        ],
    )
}

pub fn condition_score(attrs: &AssessmentAttributes) -> SubScore {
    let odometer = odometer_factor(attrs.odometer.unwrap_or(0.0));
    let spare_key = flag(attrs.spare_key);
    let expenditure = flag(attrs.approximate_expenditure.unwrap_or(0.0) < EXPENDITURE_THRESHOLD);

    let weighted = (round_half_down(odometer * WEIGHT_HIGH)
        + spare_key * WEIGHT_LOW
        + expenditure * WEIGHT_MEDIUM)
        / CONDITION_DIVISOR;

    SubScore::from_weighted(
        weighted,
        &[
            ("odometer", odometer),
            ("spareKey", spare_key),
            ("expenditure", expenditure),
        ],
    )
}

pub fn history_score(attrs: &AssessmentAttributes) -> SubScore {
    let owners_manual = flag(attrs.owners_manual);
    SubScore::from_weighted(owners_manual, &[("ownersManual", owners_manual)])
}

pub fn extras_score(attrs: &AssessmentAttributes) -> SubScore {
    let sunroof = flag(attrs.sunroof);
    let sat_nav = flag(attrs.sat_nav);
    let tradesman = flag(attrs.tradesman_extras);
    let sports_kit = flag(attrs.sports_kit);
    let leather = flag(attrs.leather);
    let wheels = flag(attrs.wheels.as_deref().map(str::trim) == Some("alloys"));

    let computed = (sunroof * WEIGHT_MEDIUM
        + sat_nav * WEIGHT_MEDIUM
        + tradesman * WEIGHT_LOW
        + sports_kit * WEIGHT_HIGH
        + leather * WEIGHT_HIGH
        + wheels * WEIGHT_HIGH)
        / EXTRAS_DIVISOR;
    // Any unspecified modification voids the extras grade.
    let weighted = if attrs.upgrades_mods { 0.0 } else { computed };

    SubScore::from_weighted(
        weighted,
        &[
            ("sunroof", sunroof),
            ("satNav", sat_nav),
            ("tradesmanExtras", tradesman),
            ("sportsKit", sports_kit),
            ("leather", leather),
            ("wheels", wheels),
        ],
    )
}

/// Review valuation once a review price has been recorded, otherwise the
/// onsite valuation, less approximate expenditure. Negative totals are valid.
pub fn offer_total(attrs: &AssessmentAttributes) -> f64 {
    let valuation = if attrs.review_price.is_some() {
        attrs.review_valuation
    } else {
        attrs.onsite_physical_valuation
    };
    valuation.unwrap_or(0.0) - attrs.approximate_expenditure.unwrap_or(0.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreBreakdown {
    pub make_model: SubScore,
    pub condition: SubScore,
    pub history: SubScore,
    pub extras: SubScore,
    pub offer_total: f64,
}

pub fn score_assessment(attrs: &AssessmentAttributes, current_year: i32) -> ScoreBreakdown {
    ScoreBreakdown {
        make_model: make_model_score(attrs, current_year),
        condition: condition_score(attrs),
        history: history_score(attrs),
        extras: extras_score(attrs),
        offer_total: offer_total(attrs),
    }
}
