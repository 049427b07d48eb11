//! Raw fitment observations.
//!
//! An observation is one marketplace listing's claim that a part number fits
//! a specific vehicle. Observations are owned by the observation store and are
//! never mutated by the engine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

const OBSERVATION_NAMESPACE: Uuid = Uuid::from_u128(0x2b9e_51c4_7a03_4f68_9d1e_64a8_c35f_07b2);

/// Unique identifier for an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObservationId(Uuid);

impl ObservationId {
    /// Creates a new random observation ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Content-derived id for a row that arrived without one.
    ///
    /// Loading the same row twice yields the same id, so evidence digests and
    /// stored listing references stay valid across runs. Rows identical in
    /// every field share an id.
    #[must_use]
    pub fn derive(row: &ObservationRecord) -> Self {
        let q = &row.quality;
        let name = format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
            row.part_number,
            row.source_listing_id,
            row.extracted_at.to_rfc3339(),
            row.year.map(|y| y.to_string()).unwrap_or_default(),
            row.make.as_deref().unwrap_or_default(),
            row.model.as_deref().unwrap_or_default(),
            row.trim.as_deref().unwrap_or_default(),
            row.engine.as_deref().unwrap_or_default(),
            q.seller_feedback_count,
            q.seller_is_business,
            q.seller_is_verified,
            q.has_oem_reference,
            q.has_detailed_description,
            row.listing_price.map(|p| p.to_string()).unwrap_or_default(),
        );
        Self(Uuid::new_v5(&OBSERVATION_NAMESPACE, name.as_bytes()))
    }

    /// Wraps an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ObservationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Seller and listing quality signals used for weighting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QualitySignals {
    /// Seller feedback count.
    #[serde(default)]
    pub seller_feedback_count: u32,

    /// Seller is a business account.
    #[serde(default)]
    pub seller_is_business: bool,

    /// Seller is platform-verified.
    #[serde(default)]
    pub seller_is_verified: bool,

    /// Listing cites an OEM reference number.
    #[serde(default)]
    pub has_oem_reference: bool,

    /// Listing has a detailed description.
    #[serde(default)]
    pub has_detailed_description: bool,
}

/// Vehicle field that was missing or unparsable on an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingField {
    Year,
    Make,
    Model,
}

impl fmt::Display for MissingField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Year => write!(f, "year"),
            Self::Make => write!(f, "make"),
            Self::Model => write!(f, "model"),
        }
    }
}

/// One marketplace listing's fitment claim.
///
/// Year, make and model are optional here because scraped listings are
/// unreliable; observations lacking any of them are excluded from grouping
/// and counted as malformed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "ObservationRecord")]
pub struct Observation {
    /// Unique identifier.
    pub id: ObservationId,

    /// Part number this observation is about.
    pub part_number: String,

    /// Vehicle model year.
    #[serde(default)]
    pub year: Option<i32>,

    /// Vehicle make.
    #[serde(default)]
    pub make: Option<String>,

    /// Vehicle model.
    #[serde(default)]
    pub model: Option<String>,

    /// Vehicle trim, if the listing names one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trim: Option<String>,

    /// Vehicle engine, if the listing names one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,

    /// Quality signals used for weighting.
    #[serde(flatten)]
    pub quality: QualitySignals,

    /// Listing price.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listing_price: Option<f64>,

    /// Marketplace listing id the observation was scraped from.
    #[serde(default)]
    pub source_listing_id: String,

    /// When the observation was extracted.
    pub extracted_at: DateTime<Utc>,
}

impl Observation {
    /// Creates a builder for constructing an observation.
    #[must_use]
    pub fn builder() -> ObservationBuilder {
        ObservationBuilder::new()
    }

    /// Returns the first vehicle field that is missing or unparsable.
    #[must_use]
    pub fn missing_field(&self) -> Option<MissingField> {
        if !self.year.is_some_and(|y| y > 0) {
            return Some(MissingField::Year);
        }
        if is_blank(self.make.as_deref()) {
            return Some(MissingField::Make);
        }
        if is_blank(self.model.as_deref()) {
            return Some(MissingField::Model);
        }
        None
    }

    /// Returns true if year, make and model are all present.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.missing_field().is_none()
    }
}

/// Observation as it appears in an input file, where `id` may be absent.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ObservationRecord {
    #[serde(default)]
    pub id: Option<ObservationId>,
    pub part_number: String,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub make: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub trim: Option<String>,
    #[serde(default)]
    pub engine: Option<String>,
    #[serde(flatten)]
    pub quality: QualitySignals,
    #[serde(default)]
    pub listing_price: Option<f64>,
    #[serde(default)]
    pub source_listing_id: String,
    pub extracted_at: DateTime<Utc>,
}

impl From<ObservationRecord> for Observation {
    fn from(row: ObservationRecord) -> Self {
        let id = row.id.unwrap_or_else(|| ObservationId::derive(&row));
        Self {
            id,
            part_number: row.part_number,
            year: row.year,
            make: row.make,
            model: row.model,
            trim: row.trim,
            engine: row.engine,
            quality: row.quality,
            listing_price: row.listing_price,
            source_listing_id: row.source_listing_id,
            extracted_at: row.extracted_at,
        }
    }
}

fn is_blank(s: Option<&str>) -> bool {
    s.map_or(true, |s| s.trim().is_empty())
}

/// Builder for `Observation`.
#[derive(Debug, Default)]
pub struct ObservationBuilder {
    id: Option<ObservationId>,
    part_number: Option<String>,
    year: Option<i32>,
    make: Option<String>,
    model: Option<String>,
    trim: Option<String>,
    engine: Option<String>,
    quality: QualitySignals,
    listing_price: Option<f64>,
    source_listing_id: Option<String>,
    extracted_at: Option<DateTime<Utc>>,
}

impl ObservationBuilder {
    /// Creates a new observation builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the observation ID (optional, generated if not set).
    #[must_use]
    pub fn id(mut self, id: ObservationId) -> Self {
        self.id = Some(id);
        self
    }

    /// Sets the part number.
    #[must_use]
    pub fn part_number(mut self, part_number: impl Into<String>) -> Self {
        self.part_number = Some(part_number.into());
        self
    }

    /// Sets year, make and model together.
    #[must_use]
    pub fn vehicle(mut self, year: i32, make: impl Into<String>, model: impl Into<String>) -> Self {
        self.year = Some(year);
        self.make = Some(make.into());
        self.model = Some(model.into());
        self
    }

    #[must_use]
    pub fn year(mut self, year: i32) -> Self {
        self.year = Some(year);
        self
    }

    #[must_use]
    pub fn make(mut self, make: impl Into<String>) -> Self {
        self.make = Some(make.into());
        self
    }

    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    #[must_use]
    pub fn trim(mut self, trim: impl Into<String>) -> Self {
        self.trim = Some(trim.into());
        self
    }

    #[must_use]
    pub fn engine(mut self, engine: impl Into<String>) -> Self {
        self.engine = Some(engine.into());
        self
    }

    /// Sets all quality signals at once.
    #[must_use]
    pub fn quality(mut self, quality: QualitySignals) -> Self {
        self.quality = quality;
        self
    }

    #[must_use]
    pub fn seller_feedback_count(mut self, count: u32) -> Self {
        self.quality.seller_feedback_count = count;
        self
    }

    #[must_use]
    pub fn seller_is_business(mut self, value: bool) -> Self {
        self.quality.seller_is_business = value;
        self
    }

    #[must_use]
    pub fn seller_is_verified(mut self, value: bool) -> Self {
        self.quality.seller_is_verified = value;
        self
    }

    #[must_use]
    pub fn has_oem_reference(mut self, value: bool) -> Self {
        self.quality.has_oem_reference = value;
        self
    }

    #[must_use]
    pub fn has_detailed_description(mut self, value: bool) -> Self {
        self.quality.has_detailed_description = value;
        self
    }

    #[must_use]
    pub fn listing_price(mut self, price: f64) -> Self {
        self.listing_price = Some(price);
        self
    }

    #[must_use]
    pub fn source_listing_id(mut self, id: impl Into<String>) -> Self {
        self.source_listing_id = Some(id.into());
        self
    }

    /// Sets the extraction timestamp (defaults to now).
    #[must_use]
    pub fn extracted_at(mut self, at: DateTime<Utc>) -> Self {
        self.extracted_at = Some(at);
        self
    }

    /// Builds the observation.
    ///
    /// Only the part number is required. Missing vehicle fields are allowed
    /// so that malformed listings can be recorded and later excluded.
    pub fn build(self) -> Result<Observation, ValidationError> {
        let part_number = self.part_number.ok_or(ValidationError::MissingField {
            field: "part_number".to_string(),
        })?;

        if part_number.trim().is_empty() {
            return Err(ValidationError::EmptyPartNumber);
        }

        Ok(Observation {
            id: self.id.unwrap_or_else(ObservationId::new),
            part_number,
            year: self.year,
            make: self.make,
            model: self.model,
            trim: self.trim,
            engine: self.engine,
            quality: self.quality,
            listing_price: self.listing_price,
            source_listing_id: self.source_listing_id.unwrap_or_default(),
            extracted_at: self.extracted_at.unwrap_or_else(Utc::now),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_requires_part_number() {
        let err = Observation::builder().vehicle(2010, "Ford", "F-150").build().unwrap_err();
        assert!(matches!(err, ValidationError::MissingField { .. }));

        let err = Observation::builder().part_number("   ").build().unwrap_err();
        assert!(matches!(err, ValidationError::EmptyPartNumber));
    }

    #[test]
    fn test_missing_field_detection() {
        let ok = Observation::builder()
            .part_number("P1")
            .vehicle(2010, "Ford", "F-150")
            .build()
            .unwrap();
        assert!(ok.is_valid());

        let no_year = Observation::builder()
            .part_number("P1")
            .make("Ford")
            .model("F-150")
            .build()
            .unwrap();
        assert_eq!(no_year.missing_field(), Some(MissingField::Year));

        let blank_make = Observation::builder()
            .part_number("P1")
            .vehicle(2010, "  ", "F-150")
            .build()
            .unwrap();
        assert_eq!(blank_make.missing_field(), Some(MissingField::Make));

        let no_model = Observation::builder()
            .part_number("P1")
            .year(2010)
            .make("Ford")
            .build()
            .unwrap();
        assert_eq!(no_model.missing_field(), Some(MissingField::Model));
    }

    #[test]
    fn test_zero_year_is_malformed() {
        let obs = Observation::builder()
            .part_number("P1")
            .vehicle(0, "Ford", "F-150")
            .build()
            .unwrap();
        assert_eq!(obs.missing_field(), Some(MissingField::Year));
    }

    #[test]
    fn test_serde_flattens_quality_signals() {
        let obs = Observation::builder()
            .part_number("P1")
            .vehicle(2010, "Ford", "F-150")
            .seller_feedback_count(1200)
            .seller_is_business(true)
            .build()
            .unwrap();

        let json = serde_json::to_value(&obs).unwrap();
        assert_eq!(json["seller_feedback_count"], 1200);
        assert_eq!(json["seller_is_business"], true);

        let back: Observation = serde_json::from_value(json).unwrap();
        assert_eq!(back, obs);
    }

    #[test]
    fn test_deserialize_tolerates_missing_vehicle_fields() {
        let json = r#"{"part_number":"P9","extracted_at":"2024-01-01T00:00:00Z"}"#;
        let obs: Observation = serde_json::from_str(json).unwrap();
        assert_eq!(obs.part_number, "P9");
        assert!(!obs.is_valid());
    }

    #[test]
    fn test_rows_without_id_get_a_stable_id() {
        let json = r#"{"part_number":"AC45821","year":2007,"make":"Honda","model":"Civic",
            "source_listing_id":"ebay-1","extracted_at":"2024-03-01T12:00:00Z"}"#;
        let first: Observation = serde_json::from_str(json).unwrap();
        let second: Observation = serde_json::from_str(json).unwrap();
        assert_eq!(first.id, second.id);

        let other = json.replace("ebay-1", "ebay-2");
        let third: Observation = serde_json::from_str(&other).unwrap();
        assert_ne!(first.id, third.id);
    }

    #[test]
    fn test_explicit_id_is_kept() {
        let id = ObservationId::new();
        let obs = Observation::builder()
            .id(id)
            .part_number("P1")
            .vehicle(2010, "Ford", "F-150")
            .build()
            .unwrap();
        let json = serde_json::to_value(&obs).unwrap();
        let back: Observation = serde_json::from_value(json).unwrap();
        assert_eq!(back.id, id);
    }
}
