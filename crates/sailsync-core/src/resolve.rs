//! Canonical entity resolver.
//!
//! Maps provider references to canonical rows. Identity is always
//! `(kind, external_id)`: two ships with the same name but different ids
//! stay two rows, and the coverage report surfaces the collision.
//!
//! An unseen id becomes a stub (`is_stub = true`, `needs_review = true`).
//! Later records may fill in a stub's attributes, but only an operator
//! review clears the flags.

use std::collections::HashMap;

use chrono::Utc;
use tracing::debug;

use crate::error::RecordError;
use crate::feed::{EntityInput, ValidatedRecord};
use crate::models::{EntityAttrs, EntityKind};
use crate::store::{CatalogStore, Resolution};

/// Internal ids for every reference in one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRefs {
    pub cruise_line_id: String,
    pub ship_id: String,
    pub embark_port_id: Option<String>,
    pub disembark_port_id: Option<String>,
    pub region_ids: Vec<String>,
    /// One port id per itinerary stop, in itinerary order.
    pub stop_port_ids: Vec<String>,
    pub stubs_created: u64,
}

/// Resolves one reference.
pub async fn resolve<S: CatalogStore + ?Sized>(
    store: &S,
    kind: EntityKind,
    external_id: &str,
    attrs: &EntityAttrs,
) -> anyhow::Result<Resolution> {
    let external_id = external_id.trim();
    if external_id.is_empty() {
        anyhow::bail!("{kind} reference has an empty external id");
    }
    let resolution = store
        .resolve_entity(kind, external_id, &attrs.normalized(), Utc::now().timestamp())
        .await?;
    if resolution.created {
        debug!(%kind, external_id, "created stub");
    }
    Ok(resolution)
}

struct RefResolver<'a, S: ?Sized> {
    store: &'a S,
    ports: HashMap<String, String>,
    stubs_created: u64,
}

impl<S: CatalogStore + ?Sized> RefResolver<'_, S> {
    async fn entity(&mut self, kind: EntityKind, input: &EntityInput) -> Result<String, RecordError> {
        let resolution = resolve(self.store, kind, &input.external_id, &input.attrs)
            .await
            .map_err(RecordError::storage)?;
        if resolution.created {
            self.stubs_created += 1;
        }
        Ok(resolution.entity.id)
    }

    /// Ports repeat within a record (round trips, embark = day 1), so each
    /// external id is resolved once.
    async fn port(&mut self, input: &EntityInput) -> Result<String, RecordError> {
        if let Some(id) = self.ports.get(&input.external_id) {
            return Ok(id.clone());
        }
        let id = self.entity(EntityKind::Port, input).await?;
        self.ports.insert(input.external_id.clone(), id.clone());
        Ok(id)
    }
}

/// Resolves every reference in `record`: the cruise line first, then the
/// ship linked to it, then ports and regions.
///
/// An itinerary stop without a port id fails the whole record with a
/// reference error; entities resolved before the failure remain.
pub async fn resolve_refs<S: CatalogStore + ?Sized>(
    store: &S,
    record: &ValidatedRecord,
) -> Result<ResolvedRefs, RecordError> {
    let mut resolver = RefResolver {
        store,
        ports: HashMap::new(),
        stubs_created: 0,
    };

    let cruise_line_id = resolver.entity(EntityKind::CruiseLine, &record.line).await?;

    let ship = EntityInput {
        external_id: record.ship.external_id.clone(),
        attrs: EntityAttrs {
            parent_id: Some(cruise_line_id.clone()),
            ..record.ship.attrs.clone()
        },
    };
    let ship_id = resolver.entity(EntityKind::Ship, &ship).await?;

    let mut stop_port_ids = Vec::with_capacity(record.itinerary.len());
    for stop in &record.itinerary {
        let Some(port) = &stop.port else {
            return Err(RecordError::Reference(format!(
                "itinerary day {} has no port id",
                stop.day_number
            )));
        };
        stop_port_ids.push(resolver.port(port).await?);
    }

    let embark_port_id = match &record.embark_port {
        Some(port) => Some(resolver.port(port).await?),
        None => None,
    };
    let disembark_port_id = match &record.disembark_port {
        Some(port) => Some(resolver.port(port).await?),
        None => None,
    };

    let mut region_ids = Vec::with_capacity(record.regions.len());
    for region in &record.regions {
        let id = resolver.entity(EntityKind::Region, region).await?;
        if !region_ids.contains(&id) {
            region_ids.push(id);
        }
    }

    Ok(ResolvedRefs {
        cruise_line_id,
        ship_id,
        embark_port_id,
        disembark_port_id,
        region_ids,
        stop_port_ids,
        stubs_created: resolver.stubs_created,
    })
}
