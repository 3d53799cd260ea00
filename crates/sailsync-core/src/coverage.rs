//! Coverage and stub reporting.
//!
//! A read-only view of catalog completeness, computed on demand from the
//! entity rows. Nothing here mutates state.
//!
//! An entity "needs review" when it is a stub, is flagged for review, or
//! lacks a mandatory attribute (see
//! [`CanonicalEntity::missing_mandatory`]). Names shared by several
//! external ids of one kind are reported as collisions and never merged.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::models::{fold_name, CanonicalEntity, EntityKind};
use crate::store::CatalogStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameCollision {
    /// Lexicographically smallest spelling in the group.
    pub name: String,
    pub external_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindCoverage {
    pub kind: EntityKind,
    pub total: u64,
    pub with_key_media: u64,
    pub needs_review: u64,
    pub stubs: u64,
    pub name_collisions: Vec<NameCollision>,
}

impl KindCoverage {
    pub fn empty(kind: EntityKind) -> Self {
        Self {
            kind,
            total: 0,
            with_key_media: 0,
            needs_review: 0,
            stubs: 0,
            name_collisions: Vec::new(),
        }
    }
}

/// A pending stub, for the review queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StubRef {
    pub id: String,
    pub kind: EntityKind,
    pub external_id: String,
    pub name: Option<String>,
    pub created_at: i64,
}

impl From<&CanonicalEntity> for StubRef {
    fn from(e: &CanonicalEntity) -> Self {
        Self {
            id: e.id.clone(),
            kind: e.kind,
            external_id: e.external_id.clone(),
            name: e.attrs.name.clone(),
            created_at: e.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageStats {
    pub generated_at: i64,
    /// One entry per kind, in [`EntityKind::ALL`] order.
    pub kinds: Vec<KindCoverage>,
    pub total_pending: u64,
    /// Oldest stubs first, ties by id.
    pub oldest_stubs: Vec<StubRef>,
}

impl CoverageStats {
    pub fn kind(&self, kind: EntityKind) -> Option<&KindCoverage> {
        self.kinds.iter().find(|k| k.kind == kind)
    }
}

/// Aggregates coverage over a full entity listing.
pub fn compute(entities: &[CanonicalEntity], oldest_limit: usize, now: i64) -> CoverageStats {
    let mut kinds: Vec<KindCoverage> = EntityKind::ALL.iter().map(|k| KindCoverage::empty(*k)).collect();
    let mut names: BTreeMap<(EntityKind, String), (String, Vec<String>)> = BTreeMap::new();

    for entity in entities {
        let Some(stats) = kinds.iter_mut().find(|k| k.kind == entity.kind) else {
            continue;
        };
        stats.total += 1;
        if entity.has_key_media() {
            stats.with_key_media += 1;
        }
        if entity.requires_review() {
            stats.needs_review += 1;
        }
        if entity.is_stub {
            stats.stubs += 1;
        }
        if let Some(name) = entity.name() {
            let slot = names
                .entry((entity.kind, fold_name(name)))
                .or_insert_with(|| (name.to_string(), Vec::new()));
            if name < slot.0.as_str() {
                slot.0 = name.to_string();
            }
            slot.1.push(entity.external_id.clone());
        }
    }

    for ((kind, _), (name, mut external_ids)) in names {
        if external_ids.len() < 2 {
            continue;
        }
        external_ids.sort();
        if let Some(stats) = kinds.iter_mut().find(|k| k.kind == kind) {
            stats.name_collisions.push(NameCollision { name, external_ids });
        }
    }

    let mut stubs: Vec<&CanonicalEntity> = entities.iter().filter(|e| e.is_stub).collect();
    stubs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

    CoverageStats {
        generated_at: now,
        total_pending: stubs.len() as u64,
        oldest_stubs: stubs.into_iter().take(oldest_limit).map(StubRef::from).collect(),
        kinds,
    }
}

/// Builds the coverage report from the store.
pub async fn report<S: CatalogStore + ?Sized>(
    store: &S,
    oldest_limit: usize,
) -> anyhow::Result<CoverageStats> {
    store.coverage(oldest_limit, Utc::now().timestamp()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntityAttrs;

    fn entity(kind: EntityKind, external_id: &str, name: Option<&str>, created_at: i64) -> CanonicalEntity {
        let attrs = EntityAttrs {
            name: name.map(str::to_string),
            ..Default::default()
        };
        CanonicalEntity::new_stub(kind, external_id, &attrs, created_at)
    }

    fn confirmed(mut e: CanonicalEntity) -> CanonicalEntity {
        e.is_stub = false;
        e.needs_review = false;
        e
    }

    #[test]
    fn counts_per_kind() {
        let mut port = confirmed(entity(EntityKind::Port, "MIA", Some("Miami"), 1));
        port.attrs.latitude = Some(25.77);
        port.attrs.longitude = Some(-80.19);
        port.attrs.image_url = Some("https://img/mia.jpg".into());
        let entities = vec![
            port,
            confirmed(entity(EntityKind::Port, "NAS", Some("Nassau"), 2)),
            entity(EntityKind::Port, "CZM", None, 3),
            entity(EntityKind::Ship, "SHIP-42", Some("Wonder"), 4),
        ];
        let stats = compute(&entities, 10, 99);

        let ports = stats.kind(EntityKind::Port).unwrap();
        assert_eq!(ports.total, 3);
        assert_eq!(ports.with_key_media, 1);
        // NAS has no coordinates, CZM is a stub
        assert_eq!(ports.needs_review, 2);
        assert_eq!(ports.stubs, 1);

        let regions = stats.kind(EntityKind::Region).unwrap();
        assert_eq!(regions.total, 0);
        assert_eq!(stats.total_pending, 2);
        assert_eq!(stats.generated_at, 99);
    }

    #[test]
    fn name_collisions_are_reported_not_merged() {
        let entities = vec![
            entity(EntityKind::Ship, "S-1", Some("Harmony"), 1),
            entity(EntityKind::Ship, "S-2", Some(" harmony "), 2),
            entity(EntityKind::Port, "P-1", Some("Harmony"), 3),
        ];
        let stats = compute(&entities, 10, 0);
        let ships = stats.kind(EntityKind::Ship).unwrap();
        assert_eq!(ships.total, 2);
        assert_eq!(
            ships.name_collisions,
            vec![NameCollision {
                name: "Harmony".into(),
                external_ids: vec!["S-1".into(), "S-2".into()],
            }]
        );
        assert!(stats.kind(EntityKind::Port).unwrap().name_collisions.is_empty());
    }

    #[test]
    fn oldest_stubs_first_and_limited() {
        let entities = vec![
            entity(EntityKind::Region, "R-3", None, 30),
            entity(EntityKind::Region, "R-1", None, 10),
            confirmed(entity(EntityKind::Region, "R-0", Some("Alaska"), 0)),
            entity(EntityKind::Region, "R-2", None, 20),
        ];
        let stats = compute(&entities, 2, 0);
        let oldest: Vec<&str> = stats.oldest_stubs.iter().map(|s| s.external_id.as_str()).collect();
        assert_eq!(oldest, vec!["R-1", "R-2"]);
        assert_eq!(stats.total_pending, 3);
    }
}
