//! Sailing upsert engine.
//!
//! Builds the feed-owned column set of a sailing from a validated record
//! and its resolved references, and hands it to the store as one atomic
//! write keyed by `external_id`.

use chrono::{NaiveDate, Utc};
use uuid::Uuid;

use crate::error::RecordError;
use crate::feed::ValidatedRecord;
use crate::models::{CabinGrade, CabinPrices, ItineraryStop, Sailing};
use crate::resolve::ResolvedRefs;
use crate::store::CatalogStore;

/// Everything the feed owns about a sailing.
///
/// `id` is a candidate used only when `external_id` is new; an existing
/// sailing keeps its id.
#[derive(Debug, Clone, PartialEq)]
pub struct SailingUpsert {
    pub id: String,
    pub external_id: String,
    pub name: Option<String>,
    pub cruise_line_id: String,
    pub ship_id: String,
    pub embark_port_id: Option<String>,
    pub disembark_port_id: Option<String>,
    pub sail_date: NaiveDate,
    pub end_date: NaiveDate,
    pub nights: u32,
    pub itinerary: Vec<ItineraryStop>,
    pub region_ids: Vec<String>,
    pub cabin_grades: Vec<CabinGrade>,
    pub prices: CabinPrices,
    pub cheapest_price: Option<i64>,
    pub currency: Option<String>,
    pub feed_hash: Option<String>,
    pub synced_at: i64,
}

impl SailingUpsert {
    pub fn build(
        record: &ValidatedRecord,
        refs: &ResolvedRefs,
        feed_hash: Option<&str>,
        now: i64,
    ) -> Self {
        let itinerary = record
            .itinerary
            .iter()
            .zip(&refs.stop_port_ids)
            .map(|(stop, port_id)| ItineraryStop {
                day_number: stop.day_number,
                port_id: port_id.clone(),
                arrival: stop.arrival,
                departure: stop.departure,
            })
            .collect();

        Self {
            id: Uuid::new_v4().to_string(),
            external_id: record.external_id.clone(),
            name: record.name.clone(),
            cruise_line_id: refs.cruise_line_id.clone(),
            ship_id: refs.ship_id.clone(),
            embark_port_id: refs.embark_port_id.clone(),
            disembark_port_id: refs.disembark_port_id.clone(),
            sail_date: record.sail_date,
            end_date: record.end_date,
            nights: record.nights,
            itinerary,
            region_ids: refs.region_ids.clone(),
            cabin_grades: record.cabin_grades.clone(),
            prices: record.prices,
            cheapest_price: record.prices.cheapest(),
            currency: record.currency.clone(),
            feed_hash: feed_hash.map(str::to_string),
            synced_at: now,
        }
    }

    /// The sailing as first inserted. Stores use this for new rows and
    /// [`apply_to`](Self::apply_to) for existing ones.
    pub fn into_new_sailing(self) -> Sailing {
        Sailing {
            id: self.id,
            external_id: self.external_id,
            name: self.name,
            cruise_line_id: self.cruise_line_id,
            ship_id: self.ship_id,
            embark_port_id: self.embark_port_id,
            disembark_port_id: self.disembark_port_id,
            sail_date: self.sail_date,
            end_date: self.end_date,
            nights: self.nights,
            itinerary: self.itinerary,
            region_ids: self.region_ids,
            cabin_grades: self.cabin_grades,
            prices: self.prices,
            cheapest_price: self.cheapest_price,
            currency: self.currency,
            feed_hash: self.feed_hash,
            last_synced_at: self.synced_at,
            created_at: self.synced_at,
            updated_at: self.synced_at,
            notes: None,
        }
    }

    /// Overwrites the feed-owned fields of an existing sailing.
    pub fn apply_to(&self, existing: &mut Sailing) {
        existing.name = self.name.clone();
        existing.cruise_line_id = self.cruise_line_id.clone();
        existing.ship_id = self.ship_id.clone();
        existing.embark_port_id = self.embark_port_id.clone();
        existing.disembark_port_id = self.disembark_port_id.clone();
        existing.sail_date = self.sail_date;
        existing.end_date = self.end_date;
        existing.nights = self.nights;
        existing.itinerary = self.itinerary.clone();
        existing.region_ids = self.region_ids.clone();
        existing.cabin_grades = self.cabin_grades.clone();
        existing.prices = self.prices;
        existing.cheapest_price = self.cheapest_price;
        existing.currency = self.currency.clone();
        existing.feed_hash = self.feed_hash.clone();
        existing.last_synced_at = self.synced_at;
        existing.updated_at = self.synced_at;
    }
}

/// Writes one validated, resolved record.
pub async fn upsert<S: CatalogStore + ?Sized>(
    store: &S,
    record: &ValidatedRecord,
    refs: &ResolvedRefs,
    feed_hash: Option<&str>,
) -> Result<Sailing, RecordError> {
    let row = SailingUpsert::build(record, refs, feed_hash, Utc::now().timestamp());
    store
        .upsert_sailing(&row)
        .await
        .map_err(RecordError::storage)
}
