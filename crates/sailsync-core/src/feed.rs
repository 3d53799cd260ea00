//! Feed schema validator.
//!
//! Turns one provider feed record (one JSON object per sailing) into a
//! [`ValidatedRecord`] ready for reference resolution and upsert.
//!
//! The provider's schema drifts: numbers arrive as strings, optional
//! fields arrive as empty strings, and entity references arrive either as
//! objects or as bare ids. [`RawFeedRecord`] therefore accepts every
//! scalar as a [`serde_json::Value`] and the validator coerces, repairs,
//! or rejects field by field.
//!
//! # Outcome
//!
//! | Result | Meaning |
//! |--------|---------|
//! | `Ok((record, notes))` | Accepted. `notes` lists every repair applied. |
//! | `Err(errors)` | Rejected as a whole. `errors` lists every blocking field. |
//!
//! A record is rejected when it lacks a sailing id, a ship id, a cruise
//! line id, or a parsable sail date. Everything else is repaired:
//!
//! | Problem | Repair |
//! |---------|--------|
//! | negative `nights` | clamped to 0 |
//! | `end_date` missing, unparsable, or before `sail_date` | `sail_date + nights` |
//! | both dates present | `nights` set to the date span |
//! | missing, unparsable, or non-positive day number | position in the list |
//! | duplicate day numbers | renumbered by order |
//! | arrival earlier than a previous stop | arrival cleared |
//! | zero, negative, or unparsable price | price cleared |
//! | unknown cabin category | grade dropped |
//! | region without id | region dropped |
//! | `itinerary`, `cabins`, or `regions` not a list | treated as empty |
//! | list element of the wrong shape | element dropped |
//! | `prices` not an object | ignored |
//! | day number beyond `u32` | stop dropped |
//! | `nights` running past the calendar | clamped to 0 |
//!
//! Validation is pure and never panics on feed input.

use chrono::{DateTime, Days, NaiveDate, NaiveDateTime, NaiveTime};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::error::FieldError;
use crate::models::{CabinCategory, CabinGrade, CabinPrices, EntityAttrs};

// ═══════════════════════════════════════════════════════════════════════
// Raw shape
// ═══════════════════════════════════════════════════════════════════════

/// One sailing exactly as the provider sent it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawFeedRecord {
    #[serde(alias = "voyageId", alias = "voyage_code")]
    pub voyage_id: Option<Value>,
    #[serde(alias = "title")]
    pub name: Option<Value>,
    #[serde(alias = "cruise_line", alias = "cruiseLine", deserialize_with = "entity_or_id")]
    pub line: Option<RawEntity>,
    #[serde(deserialize_with = "entity_or_id")]
    pub ship: Option<RawEntity>,
    #[serde(alias = "sailDate", alias = "departure_date")]
    pub sail_date: Option<Value>,
    #[serde(alias = "endDate", alias = "return_date")]
    pub end_date: Option<Value>,
    pub nights: Option<Value>,
    #[serde(alias = "embarkPort", deserialize_with = "entity_or_id")]
    pub embark_port: Option<RawEntity>,
    #[serde(alias = "disembarkPort", deserialize_with = "entity_or_id")]
    pub disembark_port: Option<RawEntity>,
    /// Containers are shape-checked in [`validate`], not here.
    pub regions: Option<Value>,
    pub itinerary: Option<Value>,
    #[serde(alias = "cabin_grades", alias = "cabinGrades")]
    pub cabins: Option<Value>,
    pub prices: Option<Value>,
    pub currency: Option<Value>,
}

/// A cruise line, ship, port, or region reference.
///
/// Deserializes from an object or from a bare id (`"SHIP-42"`, `12`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawEntity {
    #[serde(alias = "externalId", alias = "external_id")]
    pub id: Option<Value>,
    pub name: Option<Value>,
    pub code: Option<Value>,
    pub description: Option<Value>,
    pub address: Option<Value>,
    #[serde(alias = "imageUrl", alias = "logo_url")]
    pub image_url: Option<Value>,
    pub country: Option<Value>,
    #[serde(alias = "lat")]
    pub latitude: Option<Value>,
    #[serde(alias = "lng", alias = "lon")]
    pub longitude: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawStop {
    #[serde(alias = "day_number", alias = "dayNumber")]
    pub day: Option<Value>,
    #[serde(deserialize_with = "entity_or_id")]
    pub port: Option<RawEntity>,
    #[serde(alias = "portId")]
    pub port_id: Option<Value>,
    #[serde(alias = "portName")]
    pub port_name: Option<Value>,
    #[serde(alias = "arrival")]
    pub arrive: Option<Value>,
    #[serde(alias = "departure")]
    pub depart: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawCabin {
    #[serde(alias = "grade", alias = "grade_code")]
    pub code: Option<Value>,
    pub name: Option<Value>,
    pub category: Option<Value>,
    pub price: Option<Value>,
}

/// Flat per-category price snapshot, used when the feed sends no grades.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawPrices {
    pub inside: Option<Value>,
    #[serde(alias = "ocean_view", alias = "outside")]
    pub oceanview: Option<Value>,
    pub balcony: Option<Value>,
    pub suite: Option<Value>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EntityShape {
    Object(RawEntity),
    Id(Value),
}

impl From<EntityShape> for RawEntity {
    fn from(shape: EntityShape) -> Self {
        match shape {
            EntityShape::Object(entity) => entity,
            EntityShape::Id(id) => RawEntity {
                id: Some(id),
                ..Default::default()
            },
        }
    }
}

fn entity_or_id<'de, D: Deserializer<'de>>(d: D) -> Result<Option<RawEntity>, D::Error> {
    Ok(Option::<EntityShape>::deserialize(d)?.map(RawEntity::from))
}


/// Parses one feed file.
pub fn parse_record(bytes: &[u8]) -> Result<RawFeedRecord, FieldError> {
    serde_json::from_slice(bytes).map_err(|e| FieldError::new("$", e.to_string()))
}

// ═══════════════════════════════════════════════════════════════════════
// Validated shape
// ═══════════════════════════════════════════════════════════════════════

/// An entity reference after normalization: a provider key plus whatever
/// descriptive attributes came with it.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityInput {
    pub external_id: String,
    pub attrs: EntityAttrs,
}

impl EntityInput {
    pub fn bare(external_id: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            attrs: EntityAttrs::default(),
        }
    }
}

/// An itinerary stop. `port` is `None` when the feed gave no port id; the
/// resolver reports that as a reference error.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedStop {
    pub day_number: u32,
    pub port: Option<EntityInput>,
    pub arrival: Option<NaiveDateTime>,
    pub departure: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRecord {
    pub external_id: String,
    pub name: Option<String>,
    pub line: EntityInput,
    pub ship: EntityInput,
    pub embark_port: Option<EntityInput>,
    pub disembark_port: Option<EntityInput>,
    pub sail_date: NaiveDate,
    pub end_date: NaiveDate,
    pub nights: u32,
    pub regions: Vec<EntityInput>,
    /// Sorted by day number; day numbers are unique.
    pub itinerary: Vec<ValidatedStop>,
    pub cabin_grades: Vec<CabinGrade>,
    pub prices: CabinPrices,
    pub currency: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════
// Coercion
// ═══════════════════════════════════════════════════════════════════════

/// Descriptive text: trimmed, empty becomes `None`, numbers stringified.
fn text(value: &Option<Value>) -> Option<String> {
    match value.as_ref()? {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Normalizes a provider key. Numeric keys take their canonical integer
/// form, so `12`, `"12"`, and `" 012 "` are the same key.
pub fn normalize_external_id(value: &Option<Value>) -> Option<String> {
    match value.as_ref()? {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            Some(match trimmed.parse::<i64>() {
                Ok(n) => n.to_string(),
                Err(_) => trimmed.to_string(),
            })
        }
        Value::Number(n) => Some(match n.as_i64() {
            Some(i) => i.to_string(),
            None => match n.as_f64() {
                Some(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => (f as i64).to_string(),
                _ => n.to_string(),
            },
        }),
        _ => None,
    }
}

struct Unparsable;

fn scalar_str(value: &Option<Value>) -> Result<Option<String>, Unparsable> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
        }
        Some(_) => Err(Unparsable),
    }
}

fn integer(value: &Option<Value>) -> Result<Option<i64>, Unparsable> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
            .map(Some)
            .ok_or(Unparsable),
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            if let Ok(n) = trimmed.parse::<i64>() {
                return Ok(Some(n));
            }
            trimmed
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(|f| Some(f.trunc() as i64))
                .ok_or(Unparsable)
        }
        Some(_) => Err(Unparsable),
    }
}

/// Decimal number; strings may carry `$`, thousands separators, and spaces.
fn decimal(value: &Option<Value>) -> Result<Option<f64>, Unparsable> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_f64()
            .filter(|f| f.is_finite())
            .map(Some)
            .ok_or(Unparsable),
        Some(Value::String(s)) => {
            let cleaned: String = s
                .chars()
                .filter(|c| !matches!(c, '$' | ',' | ' ' | '\u{a0}'))
                .collect();
            if cleaned.is_empty() {
                return Ok(None);
            }
            cleaned
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(Some)
                .ok_or(Unparsable)
        }
        Some(_) => Err(Unparsable),
    }
}

fn parse_date_str(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .or_else(|| s.get(..10).and_then(|p| NaiveDate::parse_from_str(p, "%Y-%m-%d").ok()))
        .or_else(|| NaiveDate::parse_from_str(s, "%Y%m%d").ok())
        .or_else(|| NaiveDate::parse_from_str(s, "%m/%d/%Y").ok())
}

fn date(value: &Option<Value>) -> Result<Option<NaiveDate>, Unparsable> {
    match scalar_str(value)? {
        None => Ok(None),
        Some(s) => parse_date_str(&s).map(Some).ok_or(Unparsable),
    }
}

const DATE_TIME_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// A timestamp, or a time of day anchored to `anchor`.
fn date_time(value: &Option<Value>, anchor: NaiveDate) -> Result<Option<NaiveDateTime>, Unparsable> {
    let Some(s) = scalar_str(value)? else {
        return Ok(None);
    };
    if let Ok(dt) = DateTime::parse_from_rfc3339(&s) {
        return Ok(Some(dt.naive_local()));
    }
    for format in DATE_TIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(&s, format) {
            return Ok(Some(dt));
        }
    }
    for format in ["%H:%M:%S", "%H:%M"] {
        if let Ok(t) = NaiveTime::parse_from_str(&s, format) {
            return Ok(Some(anchor.and_time(t)));
        }
    }
    Err(Unparsable)
}

// ═══════════════════════════════════════════════════════════════════════
// Containers
// ═══════════════════════════════════════════════════════════════════════

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

fn list_items<'a>(value: &'a Option<Value>, field: &str, notes: &mut Vec<FieldError>) -> &'a [Value] {
    match value {
        None | Some(Value::Null) => &[],
        Some(Value::Array(items)) => items.as_slice(),
        Some(other) => {
            notes.push(FieldError::new(
                field,
                format!("expected a list, got {}, ignored", json_kind(other)),
            ));
            &[]
        }
    }
}

/// Object elements of an optional list; anything else is dropped.
fn object_list<T: DeserializeOwned>(
    value: &Option<Value>,
    field: &str,
    notes: &mut Vec<FieldError>,
) -> Vec<T> {
    let items = list_items(value, field, notes);
    let mut parsed = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        if !item.is_object() {
            notes.push(FieldError::new(
                format!("{field}[{i}]"),
                format!("expected an object, got {}, dropped", json_kind(item)),
            ));
            continue;
        }
        match T::deserialize(item) {
            Ok(element) => parsed.push(element),
            Err(e) => notes.push(FieldError::new(format!("{field}[{i}]"), format!("{e}, dropped"))),
        }
    }
    parsed
}

/// Entity references of an optional list; elements may be objects or bare ids.
fn entity_list(value: &Option<Value>, field: &str, notes: &mut Vec<FieldError>) -> Vec<RawEntity> {
    let items = list_items(value, field, notes);
    let mut parsed = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        match EntityShape::deserialize(item) {
            Ok(shape) => parsed.push(RawEntity::from(shape)),
            Err(e) => notes.push(FieldError::new(format!("{field}[{i}]"), format!("{e}, dropped"))),
        }
    }
    parsed
}

fn price_snapshot(value: &Option<Value>, notes: &mut Vec<FieldError>) -> Option<RawPrices> {
    match value {
        None | Some(Value::Null) => None,
        Some(item @ Value::Object(_)) => match RawPrices::deserialize(item) {
            Ok(prices) => Some(prices),
            Err(e) => {
                notes.push(FieldError::new("prices", format!("{e}, ignored")));
                None
            }
        },
        Some(other) => {
            notes.push(FieldError::new(
                "prices",
                format!("expected an object, got {}, ignored", json_kind(other)),
            ));
            None
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Validation
// ═══════════════════════════════════════════════════════════════════════

fn coordinate(
    value: &Option<Value>,
    bound: f64,
    field: &str,
    notes: &mut Vec<FieldError>,
) -> Option<f64> {
    match decimal(value) {
        Ok(Some(v)) if v.abs() <= bound => Some(v),
        Ok(Some(v)) => {
            notes.push(FieldError::new(field, format!("{v} out of range, cleared")));
            None
        }
        Ok(None) => None,
        Err(Unparsable) => {
            notes.push(FieldError::new(field, "unparsable coordinate, cleared"));
            None
        }
    }
}

fn entity_input(raw: &RawEntity, field: &str, notes: &mut Vec<FieldError>) -> Option<EntityInput> {
    let external_id = normalize_external_id(&raw.id)?;
    let attrs = EntityAttrs {
        name: text(&raw.name),
        code: text(&raw.code),
        description: text(&raw.description),
        address: text(&raw.address),
        image_url: text(&raw.image_url),
        country: text(&raw.country),
        latitude: coordinate(&raw.latitude, 90.0, &format!("{field}.latitude"), notes),
        longitude: coordinate(&raw.longitude, 180.0, &format!("{field}.longitude"), notes),
        parent_id: None,
    };
    Some(EntityInput { external_id, attrs })
}

fn price_cents(value: &Option<Value>, field: &str, notes: &mut Vec<FieldError>) -> Option<i64> {
    match decimal(value) {
        Ok(None) => None,
        Ok(Some(units)) => {
            let cents = (units * 100.0).round();
            if cents <= 0.0 {
                notes.push(FieldError::new(field, format!("non-positive price {units}, cleared")));
                None
            } else if cents >= i64::MAX as f64 {
                notes.push(FieldError::new(field, "price out of range, cleared"));
                None
            } else {
                Some(cents as i64)
            }
        }
        Err(Unparsable) => {
            notes.push(FieldError::new(field, "unparsable price, cleared"));
            None
        }
    }
}

fn timestamp(
    value: &Option<Value>,
    anchor: NaiveDate,
    field: &str,
    notes: &mut Vec<FieldError>,
) -> Option<NaiveDateTime> {
    match date_time(value, anchor) {
        Ok(v) => v,
        Err(Unparsable) => {
            notes.push(FieldError::new(field, "unparsable time, cleared"));
            None
        }
    }
}

struct PendingStop<'a> {
    position: usize,
    day: i64,
    port: Option<EntityInput>,
    raw: &'a RawStop,
}

fn validate_itinerary(
    raw: &[RawStop],
    sail_date: NaiveDate,
    notes: &mut Vec<FieldError>,
) -> Vec<ValidatedStop> {
    let mut pending = Vec::with_capacity(raw.len());
    for (position, raw_stop) in raw.iter().enumerate() {
        let field = format!("itinerary[{position}]");
        let fallback = position as i64 + 1;
        let day = match integer(&raw_stop.day) {
            Ok(Some(d)) if d >= 1 => d,
            Ok(Some(d)) => {
                notes.push(FieldError::new(
                    format!("{field}.day"),
                    format!("non-positive day {d}, using position"),
                ));
                fallback
            }
            Ok(None) => {
                notes.push(FieldError::new(format!("{field}.day"), "missing, using position"));
                fallback
            }
            Err(Unparsable) => {
                notes.push(FieldError::new(format!("{field}.day"), "unparsable, using position"));
                fallback
            }
        };

        let mut port = raw_stop
            .port
            .as_ref()
            .and_then(|p| entity_input(p, &format!("{field}.port"), notes))
            .or_else(|| normalize_external_id(&raw_stop.port_id).map(EntityInput::bare));
        if let Some(port) = port.as_mut() {
            if port.attrs.name.is_none() {
                port.attrs.name = text(&raw_stop.port_name);
            }
        }

        pending.push(PendingStop {
            position,
            day,
            port,
            raw: raw_stop,
        });
    }

    pending.sort_by_key(|s| (s.day, s.position));
    if pending.windows(2).any(|w| w[0].day == w[1].day) {
        notes.push(FieldError::new("itinerary", "duplicate day numbers, renumbered by order"));
        for (i, stop) in pending.iter_mut().enumerate() {
            stop.day = i as i64 + 1;
        }
    }

    let mut stops = Vec::with_capacity(pending.len());
    let mut latest_arrival: Option<NaiveDateTime> = None;
    for stop in pending {
        let Ok(day_number) = u32::try_from(stop.day) else {
            notes.push(FieldError::new(
                format!("itinerary[{}].day", stop.position),
                format!("day {} out of range, stop dropped", stop.day),
            ));
            continue;
        };
        let anchor = sail_date
            .checked_add_days(Days::new(u64::from(day_number.saturating_sub(1))))
            .unwrap_or(sail_date);
        let field = format!("itinerary[day {day_number}]");

        let mut arrival = timestamp(&stop.raw.arrive, anchor, &format!("{field}.arrival"), notes);
        let departure = timestamp(&stop.raw.depart, anchor, &format!("{field}.departure"), notes);

        if let (Some(a), Some(latest)) = (arrival, latest_arrival) {
            if a < latest {
                notes.push(FieldError::new(
                    format!("{field}.arrival"),
                    "earlier than a previous stop, cleared",
                ));
                arrival = None;
            }
        }
        if arrival.is_some() {
            latest_arrival = arrival;
        }

        stops.push(ValidatedStop {
            day_number,
            port: stop.port,
            arrival,
            departure,
        });
    }
    stops
}

fn validate_cabins(raw: &[RawCabin], notes: &mut Vec<FieldError>) -> Vec<CabinGrade> {
    let mut grades = Vec::with_capacity(raw.len());
    for (i, cabin) in raw.iter().enumerate() {
        let field = format!("cabins[{i}]");
        let label = text(&cabin.category);
        let Some(category) = label.as_deref().and_then(CabinCategory::parse) else {
            notes.push(FieldError::new(
                format!("{field}.category"),
                format!("unknown category {:?}, grade dropped", label.unwrap_or_default()),
            ));
            continue;
        };
        let code = text(&cabin.code).unwrap_or_else(|| format!("{category}-{}", i + 1));
        grades.push(CabinGrade {
            code,
            name: text(&cabin.name),
            category,
            price_cents: price_cents(&cabin.price, &format!("{field}.price"), notes),
        });
    }
    grades
}

fn roll_up_prices(
    grades: &[CabinGrade],
    snapshot: Option<&RawPrices>,
    notes: &mut Vec<FieldError>,
) -> CabinPrices {
    let mut prices = CabinPrices::from_grades(grades);
    if let Some(snapshot) = snapshot {
        let columns = [
            (CabinCategory::Inside, &snapshot.inside),
            (CabinCategory::Oceanview, &snapshot.oceanview),
            (CabinCategory::Balcony, &snapshot.balcony),
            (CabinCategory::Suite, &snapshot.suite),
        ];
        for (category, value) in columns {
            if let Some(cents) = price_cents(value, &format!("prices.{category}"), notes) {
                prices.offer(category, cents);
            }
        }
    }
    prices
}

/// Validates and repairs one raw record.
pub fn validate(raw: &RawFeedRecord) -> Result<(ValidatedRecord, Vec<FieldError>), Vec<FieldError>> {
    let mut errors = Vec::new();
    let mut notes = Vec::new();

    let external_id = normalize_external_id(&raw.voyage_id);
    if external_id.is_none() {
        errors.push(FieldError::new("voyage_id", "missing sailing id"));
    }

    let line = raw
        .line
        .as_ref()
        .and_then(|l| entity_input(l, "line", &mut notes));
    if line.is_none() {
        errors.push(FieldError::new("line", "missing cruise line id"));
    }

    let ship = raw
        .ship
        .as_ref()
        .and_then(|s| entity_input(s, "ship", &mut notes));
    if ship.is_none() {
        errors.push(FieldError::new("ship", "missing ship id"));
    }

    let sail_date = match date(&raw.sail_date) {
        Ok(Some(d)) => Some(d),
        Ok(None) => {
            errors.push(FieldError::new("sail_date", "missing"));
            None
        }
        Err(Unparsable) => {
            errors.push(FieldError::new("sail_date", "unparsable date"));
            None
        }
    };

    let (Some(external_id), Some(line), Some(ship), Some(sail_date)) =
        (external_id, line, ship, sail_date)
    else {
        return Err(errors);
    };

    let feed_nights = match integer(&raw.nights) {
        Ok(Some(n)) if n < 0 => {
            notes.push(FieldError::new("nights", format!("negative value {n}, clamped to 0")));
            Some(0)
        }
        Ok(Some(n)) => Some(u32::try_from(n).unwrap_or(u32::MAX)),
        Ok(None) => None,
        Err(Unparsable) => {
            notes.push(FieldError::new("nights", "unparsable, ignored"));
            None
        }
    };

    let feed_end = match date(&raw.end_date) {
        Ok(Some(end)) if end < sail_date => {
            notes.push(FieldError::new("end_date", "before sail_date, derived from nights"));
            None
        }
        Ok(end) => end,
        Err(Unparsable) => {
            notes.push(FieldError::new("end_date", "unparsable, derived from nights"));
            None
        }
    };

    let (end_date, nights) = match feed_end {
        Some(end) => {
            let span = u32::try_from((end - sail_date).num_days()).unwrap_or(u32::MAX);
            if let Some(n) = feed_nights.filter(|n| *n != span) {
                notes.push(FieldError::new(
                    "nights",
                    format!("{n} disagrees with date span {span}, using span"),
                ));
            }
            (end, span)
        }
        None => {
            let nights = feed_nights.unwrap_or(0);
            match sail_date.checked_add_days(Days::new(u64::from(nights))) {
                Some(end) => (end, nights),
                None => {
                    notes.push(FieldError::new(
                        "nights",
                        format!("{nights} runs past the calendar, clamped to 0"),
                    ));
                    (sail_date, 0)
                }
            }
        }
    };

    let raw_stops: Vec<RawStop> = object_list(&raw.itinerary, "itinerary", &mut notes);
    let itinerary = validate_itinerary(&raw_stops, sail_date, &mut notes);

    let raw_regions = entity_list(&raw.regions, "regions", &mut notes);
    let mut regions = Vec::with_capacity(raw_regions.len());
    for (i, region) in raw_regions.iter().enumerate() {
        match entity_input(region, &format!("regions[{i}]"), &mut notes) {
            Some(input) if !regions.iter().any(|r: &EntityInput| r.external_id == input.external_id) => {
                regions.push(input)
            }
            Some(_) => {}
            None => notes.push(FieldError::new(format!("regions[{i}]"), "missing id, dropped")),
        }
    }

    let embark_port = raw
        .embark_port
        .as_ref()
        .and_then(|p| entity_input(p, "embark_port", &mut notes))
        .or_else(|| itinerary.first().and_then(|s| s.port.clone()));
    let disembark_port = raw
        .disembark_port
        .as_ref()
        .and_then(|p| entity_input(p, "disembark_port", &mut notes))
        .or_else(|| itinerary.last().and_then(|s| s.port.clone()));

    let raw_cabins: Vec<RawCabin> = object_list(&raw.cabins, "cabins", &mut notes);
    let cabin_grades = validate_cabins(&raw_cabins, &mut notes);
    let snapshot = price_snapshot(&raw.prices, &mut notes);
    let prices = roll_up_prices(&cabin_grades, snapshot.as_ref(), &mut notes);

    let record = ValidatedRecord {
        external_id,
        name: text(&raw.name),
        line,
        ship,
        embark_port,
        disembark_port,
        sail_date,
        end_date,
        nights,
        regions,
        itinerary,
        cabin_grades,
        prices,
        currency: text(&raw.currency).map(|c| c.to_ascii_uppercase()),
    };
    Ok((record, notes))
}
