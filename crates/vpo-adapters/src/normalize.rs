//! Raw partner fields to canonical typed fields.
//!
//! Absent or empty inputs are silent nulls. A present value that fails its
//! rule becomes null and, for the fields that warn, produces a
//! [`NormalizationWarning`] the caller logs.

use std::sync::OnceLock;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};
use regex::Regex;
use serde::Serialize;
use vpo_core::{Categorical, ColourBucket, DriveTrain, EngineType, Transmission};

use crate::LeadRecord;

pub const DRIVE_IN_INSPECTOR_EMAIL: &str = "drive-in@inspections.vpo.internal";
pub const LOCAL_MECH_INSPECTOR_EMAIL: &str = "local-mech@inspections.vpo.internal";

const DATE_FORMATS: [&str; 9] = [
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%d/%m/%Y",
    "%d-%m-%Y",
    "%d.%m.%Y",
    "%d %B %Y",
    "%d %b %Y",
    "%B %d %Y",
    "%b %d %Y",
];
const SHORT_YEAR_FORMATS: [&str; 2] = ["%d/%m/%y", "%d-%m-%y"];
const DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NormalizationWarning {
    pub field: &'static str,
    pub raw: String,
    pub reason: &'static str,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedLead {
    pub external_id: Option<String>,
    pub customer_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub build_year: Option<String>,
    pub year: Option<String>,
    pub series: Option<String>,
    pub badge: Option<String>,
    pub body: Option<String>,
    pub engine: Option<String>,
    pub rego: Option<String>,
    pub seats: Option<String>,
    pub finance_value: Option<String>,
    pub bottom_price_estimate: Option<String>,
    pub top_price_estimate: Option<String>,
    pub latest_pricing: Option<String>,
    pub inspector_email: Option<String>,
    pub sales_consultant_email: Option<String>,
    pub engine_type: Option<EngineType>,
    pub drive_train: Option<DriveTrain>,
    pub kms: Option<f64>,
    pub rego_expiry: Option<NaiveDate>,
    pub colour: ColourBucket,
    pub transmission: Option<Transmission>,
    pub doors: Option<u32>,
    pub spare_key: bool,
    pub log_books: bool,
    pub sunroof: bool,
    pub sat_nav: bool,
    pub leather: bool,
}

impl NormalizedLead {
    pub fn is_drive_in(&self) -> bool {
        self.inspector_is(DRIVE_IN_INSPECTOR_EMAIL)
    }

    pub fn is_local_mech(&self) -> bool {
        self.inspector_is(LOCAL_MECH_INSPECTOR_EMAIL)
    }

    fn inspector_is(&self, sentinel: &str) -> bool {
        self.inspector_email
            .as_deref()
            .is_some_and(|email| email.eq_ignore_ascii_case(sentinel))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub lead: NormalizedLead,
    pub warnings: Vec<NormalizationWarning>,
}

pub fn parse_kms(raw: &str) -> Option<f64> {
    let digits: String = raw.chars().filter(|c| *c != ',').collect();
    digits
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|kms| kms.is_finite())
}

fn leading_integer() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\s*(\d+)").expect("static doors regex"))
}

pub fn parse_doors(raw: &str) -> Option<u32> {
    leading_integer()
        .captures(raw)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Day-first loose date parsing. Two-digit years are read as 20xx/19xx per
/// chrono's `%y` pivot.
pub fn parse_loose_date(raw: &str) -> Option<NaiveDate> {
    let cleaned = raw.trim().replace(',', "");
    if let Ok(ts) = DateTime::parse_from_rfc3339(&cleaned) {
        return Some(ts.date_naive());
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(&cleaned, fmt).ok())
        .map(|ts| ts.date())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .filter_map(|fmt| NaiveDate::parse_from_str(&cleaned, fmt).ok())
                .find(|date| date.year() >= 1000)
        })
        .or_else(|| {
            SHORT_YEAR_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(&cleaned, fmt).ok())
        })
}

pub fn is_yes(raw: Option<&str>) -> bool {
    raw.is_some_and(|value| value.eq_ignore_ascii_case("yes"))
}

#[derive(Default)]
struct Warnings(Vec<NormalizationWarning>);

impl Warnings {
    fn checked<T>(
        &mut self,
        field: &'static str,
        raw: Option<&str>,
        reason: &'static str,
        parse: impl FnOnce(&str) -> Option<T>,
    ) -> Option<T> {
        let raw = raw?;
        let parsed = parse(raw);
        if parsed.is_none() {
            self.0.push(NormalizationWarning {
                field,
                raw: raw.to_string(),
                reason,
            });
        }
        parsed
    }
}

pub fn normalize(record: &LeadRecord) -> Normalized {
    let mut warnings = Warnings::default();

    let engine_type = warnings.checked(
        "engineType",
        record.fuel_type.as_deref(),
        "expected one of petrol, diesel, gas, electric",
        EngineType::parse,
    );
    let drive_train = warnings.checked(
        "driveTrain",
        record.fwd_rwd.as_deref(),
        "expected 2WD or 4X4",
        DriveTrain::parse,
    );
    let kms = warnings.checked(
        "kms",
        record.kms.as_deref(),
        "expected a numeric odometer reading",
        parse_kms,
    );
    let transmission = warnings.checked(
        "transmission",
        record.transmission.as_deref(),
        "expected auto or manual",
        Transmission::parse,
    );
    let doors = warnings.checked(
        "doors",
        record.doors.as_deref(),
        "expected a leading door count",
        parse_doors,
    );

    let lead = NormalizedLead {
        external_id: record.id.clone(),
        customer_name: record.name.clone(),
        email: record.email.clone(),
        phone: record.phone.clone(),
        address: record.address.clone(),
        city: record.city.clone(),
        state: record.state.clone(),
        make: record.make.clone(),
        model: record.model.clone(),
        build_year: record.build_year.clone(),
        year: record.year.clone(),
        series: record.series.clone(),
        badge: record.badge.clone(),
        body: record.body.clone(),
        engine: record.engine.clone(),
        rego: record.rego.clone(),
        seats: record.seats.clone(),
        finance_value: record.finance_value.clone(),
        bottom_price_estimate: record.bottom_price_estimate.clone(),
        top_price_estimate: record.top_price_estimate.clone(),
        latest_pricing: record.latest_pricing.clone(),
        inspector_email: record.inspector_email.clone(),
        sales_consultant_email: record.sales_consultant_email.clone(),
        engine_type,
        drive_train,
        kms,
        rego_expiry: record.rego_expiry.as_deref().and_then(parse_loose_date),
        colour: record
            .car_colour
            .as_deref()
            .map(ColourBucket::bucket)
            .unwrap_or_default(),
        transmission,
        doors,
        spare_key: is_yes(record.spare_key.as_deref()),
        log_books: is_yes(record.log_books.as_deref()),
        sunroof: is_yes(record.sunroof.as_deref()),
        sat_nav: is_yes(record.sat_nav.as_deref()),
        leather: is_yes(record.leather.as_deref()),
    };

    Normalized {
        lead,
        warnings: warnings.0,
    }
}
