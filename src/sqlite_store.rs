//! SQLite-backed [`CatalogStore`] and [`RunStore`].
//!
//! | Concern | Mechanism |
//! |---------|-----------|
//! | Entity identity | `UNIQUE(kind, external_id)` + `INSERT ... ON CONFLICT DO NOTHING` |
//! | Attribute merge | `COALESCE(incoming, current)`: non-null values win, nulls never erase |
//! | Sailing upsert | `ON CONFLICT(external_id) DO UPDATE` of feed-owned columns, child rows replaced in the same transaction |
//! | Single running run | partial unique index on `sync_runs(status) WHERE status = 'running'` |
//! | Run immutability | every run mutation is guarded by `WHERE status = 'running'` |
//! | Search | one `SELECT` built with [`QueryBuilder`], plus a `COUNT(*)` over the same filters |
//! | Text matching | `search_name` columns hold [`fold_name`] output, written with every name |

use std::collections::HashMap;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::instrument;
use uuid::Uuid;

use sailsync_core::coverage::{CoverageStats, KindCoverage, NameCollision, StubRef};
use sailsync_core::models::{
    fold_name, CabinCategory, CabinGrade, CabinPrices, CanonicalEntity, EntityAttrs, EntityKind,
    ErrorType, ItineraryStop, RunSummary, Sailing, SyncError, SyncMetrics, SyncRun, SyncStatus, SyncTrigger,
};
use sailsync_core::search::{SailingPage, SailingSummary, SearchQuery, SortDir, SortField};
use sailsync_core::store::{CatalogStore, Resolution, RunStore};
use sailsync_core::upsert::SailingUpsert;

use crate::config::Config;
use crate::{db, migrate};

const DATE_FORMAT: &str = "%Y-%m-%d";
const DATE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// SQLite implementation of the store traits.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connects and brings the schema up to date.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Sets the operator annotation on a sailing. Feed upserts never touch it.
    pub async fn set_notes(&self, sailing_id: &str, notes: &str) -> Result<()> {
        let result = sqlx::query("UPDATE sailings SET notes = ? WHERE id = ?")
            .bind(notes)
            .bind(sailing_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            bail!("unknown sailing {sailing_id}");
        }
        Ok(())
    }
}

fn parse_date(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, DATE_FORMAT)
        .with_context(|| format!("invalid stored date '{value}'"))
}

fn parse_date_time(value: Option<String>) -> Result<Option<NaiveDateTime>> {
    value
        .map(|v| {
            NaiveDateTime::parse_from_str(&v, DATE_TIME_FORMAT)
                .with_context(|| format!("invalid stored timestamp '{v}'"))
        })
        .transpose()
}

fn format_date_time(value: Option<NaiveDateTime>) -> Option<String> {
    value.map(|v| v.format(DATE_TIME_FORMAT).to_string())
}

fn count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn nights(value: i64) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

const ENTITY_COLUMNS: &str = "id, kind, external_id, name, code, description, address, image_url, \
     country, latitude, longitude, parent_id, is_stub, needs_review, created_at, updated_at";

fn entity_from_row(row: &SqliteRow) -> Result<CanonicalEntity> {
    let kind: String = row.try_get("kind")?;
    Ok(CanonicalEntity {
        id: row.try_get("id")?,
        kind: EntityKind::parse(&kind).ok_or_else(|| anyhow!("unknown entity kind '{kind}'"))?,
        external_id: row.try_get("external_id")?,
        attrs: EntityAttrs {
            name: row.try_get("name")?,
            code: row.try_get("code")?,
            description: row.try_get("description")?,
            address: row.try_get("address")?,
            image_url: row.try_get("image_url")?,
            country: row.try_get("country")?,
            latitude: row.try_get("latitude")?,
            longitude: row.try_get("longitude")?,
            parent_id: row.try_get("parent_id")?,
        },
        is_stub: row.try_get("is_stub")?,
        needs_review: row.try_get("needs_review")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn prices_from_row(row: &SqliteRow) -> Result<CabinPrices> {
    Ok(CabinPrices {
        inside: row.try_get("price_inside")?,
        oceanview: row.try_get("price_oceanview")?,
        balcony: row.try_get("price_balcony")?,
        suite: row.try_get("price_suite")?,
    })
}

const SUMMARY_SELECT: &str = "SELECT s.id, s.external_id, s.name, \
     s.cruise_line_id, l.name AS cruise_line_name, \
     s.ship_id, sh.name AS ship_name, \
     s.embark_port_id, ep.name AS embark_port_name, \
     s.disembark_port_id, dp.name AS disembark_port_name, \
     s.sail_date, s.end_date, s.nights, \
     s.price_inside, s.price_oceanview, s.price_balcony, s.price_suite, \
     s.cheapest_price, s.currency, s.last_synced_at";

const SUMMARY_FROM: &str = " FROM sailings s \
     JOIN canonical_entities l ON l.id = s.cruise_line_id \
     JOIN canonical_entities sh ON sh.id = s.ship_id \
     LEFT JOIN canonical_entities ep ON ep.id = s.embark_port_id \
     LEFT JOIN canonical_entities dp ON dp.id = s.disembark_port_id";

fn summary_from_row(row: &SqliteRow) -> Result<SailingSummary> {
    let sail_date: String = row.try_get("sail_date")?;
    let end_date: String = row.try_get("end_date")?;
    Ok(SailingSummary {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        name: row.try_get("name")?,
        cruise_line_id: row.try_get("cruise_line_id")?,
        cruise_line_name: row.try_get("cruise_line_name")?,
        ship_id: row.try_get("ship_id")?,
        ship_name: row.try_get("ship_name")?,
        embark_port_id: row.try_get("embark_port_id")?,
        embark_port_name: row.try_get("embark_port_name")?,
        disembark_port_id: row.try_get("disembark_port_id")?,
        disembark_port_name: row.try_get("disembark_port_name")?,
        sail_date: parse_date(&sail_date)?,
        end_date: parse_date(&end_date)?,
        nights: nights(row.try_get("nights")?),
        prices: prices_from_row(row)?,
        cheapest_price: row.try_get("cheapest_price")?,
        currency: row.try_get("currency")?,
        last_synced_at: row.try_get("last_synced_at")?,
    })
}

/// Escapes `%`, `_`, and `\` for a `LIKE ... ESCAPE '\'` pattern.
fn like_pattern(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len() + 2);
    escaped.push('%');
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

fn price_column(query: &SearchQuery) -> &'static str {
    match query.filters.cabin_category {
        Some(CabinCategory::Inside) => "s.price_inside",
        Some(CabinCategory::Oceanview) => "s.price_oceanview",
        Some(CabinCategory::Balcony) => "s.price_balcony",
        Some(CabinCategory::Suite) => "s.price_suite",
        None => "s.cheapest_price",
    }
}

fn push_id_list(qb: &mut QueryBuilder<'static, Sqlite>, ids: &[String]) {
    qb.push("(");
    let mut separated = qb.separated(", ");
    for id in ids {
        separated.push_bind(id.clone());
    }
    separated.push_unseparated(")");
}

/// Appends the `WHERE` clause for `query`. Mirrors [`SearchQuery::matches`].
fn push_filters(qb: &mut QueryBuilder<'static, Sqlite>, query: &SearchQuery) {
    let f = &query.filters;
    qb.push(" WHERE 1 = 1");

    if let Some(text) = &f.text {
        let pattern = like_pattern(text);
        qb.push(" AND (");
        for (i, column) in [
            "s.search_name",
            "sh.search_name",
            "l.search_name",
            "ep.search_name",
            "dp.search_name",
        ]
        .iter()
        .enumerate()
        {
            if i > 0 {
                qb.push(" OR ");
            }
            qb.push(format!("{column} LIKE "))
                .push_bind(pattern.clone())
                .push(" ESCAPE '\\'");
        }
        qb.push(
            " OR EXISTS (SELECT 1 FROM itinerary_stops st \
             JOIN canonical_entities p ON p.id = st.port_id \
             WHERE st.sailing_id = s.id AND p.search_name LIKE ",
        )
        .push_bind(pattern)
        .push(" ESCAPE '\\'))");
    }

    if !f.cruise_line_ids.is_empty() {
        qb.push(" AND s.cruise_line_id IN ");
        push_id_list(qb, &f.cruise_line_ids);
    }
    if !f.ship_ids.is_empty() {
        qb.push(" AND s.ship_id IN ");
        push_id_list(qb, &f.ship_ids);
    }
    if !f.region_ids.is_empty() {
        qb.push(
            " AND EXISTS (SELECT 1 FROM sailing_regions r \
             WHERE r.sailing_id = s.id AND r.region_id IN ",
        );
        push_id_list(qb, &f.region_ids);
        qb.push(")");
    }
    if !f.port_ids.is_empty() {
        qb.push(" AND (s.embark_port_id IN ");
        push_id_list(qb, &f.port_ids);
        qb.push(" OR s.disembark_port_id IN ");
        push_id_list(qb, &f.port_ids);
        qb.push(")");
    }
    for port_id in &f.ports_visited {
        qb.push(
            " AND EXISTS (SELECT 1 FROM itinerary_stops v \
             WHERE v.sailing_id = s.id AND v.port_id = ",
        )
        .push_bind(port_id.clone())
        .push(")");
    }

    if let Some(from) = f.sail_date_from {
        qb.push(" AND s.sail_date >= ")
            .push_bind(from.format(DATE_FORMAT).to_string());
    }
    if let Some(to) = f.sail_date_to {
        qb.push(" AND s.sail_date <= ")
            .push_bind(to.format(DATE_FORMAT).to_string());
    }
    if let Some(min) = f.nights_min {
        qb.push(" AND s.nights >= ").push_bind(i64::from(min));
    }
    if let Some(max) = f.nights_max {
        qb.push(" AND s.nights <= ").push_bind(i64::from(max));
    }

    if f.price_min_cents.is_some() || f.price_max_cents.is_some() {
        let column = price_column(query);
        qb.push(format!(" AND {column} IS NOT NULL"));
        if let Some(min) = f.price_min_cents {
            qb.push(format!(" AND {column} >= ")).push_bind(min);
        }
        if let Some(max) = f.price_max_cents {
            qb.push(format!(" AND {column} <= ")).push_bind(max);
        }
    }
}

fn push_order(qb: &mut QueryBuilder<'static, Sqlite>, query: &SearchQuery) {
    let column = match query.sort_by {
        SortField::SailDate => "s.sail_date",
        SortField::Price => price_column(query),
        SortField::Nights => "s.nights",
        SortField::ShipName => "sh.search_name",
        SortField::LineName => "l.search_name",
    };
    let dir = match query.sort_dir {
        SortDir::Asc => "ASC",
        SortDir::Desc => "DESC",
    };
    qb.push(format!(
        " ORDER BY ({column} IS NULL) ASC, {column} {dir}, s.id ASC"
    ));
}

#[async_trait]
impl CatalogStore for SqliteStore {
    #[instrument(skip_all, fields(%kind, external_id = %external_id))]
    async fn resolve_entity(
        &self,
        kind: EntityKind,
        external_id: &str,
        attrs: &EntityAttrs,
        now: i64,
    ) -> Result<Resolution> {
        let search_name = attrs.name.as_deref().map(fold_name);
        let mut tx = self.pool.begin().await?;

        // Write first so the transaction holds the write lock from the start.
        let inserted = sqlx::query(
            r#"
            INSERT INTO canonical_entities (id, kind, external_id, name, search_name, code,
                                            description, address, image_url, country, latitude,
                                            longitude, parent_id, is_stub, needs_review,
                                            created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, 1, ?, ?)
            ON CONFLICT(kind, external_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(kind.as_str())
        .bind(external_id)
        .bind(&attrs.name)
        .bind(&search_name)
        .bind(&attrs.code)
        .bind(&attrs.description)
        .bind(&attrs.address)
        .bind(&attrs.image_url)
        .bind(&attrs.country)
        .bind(attrs.latitude)
        .bind(attrs.longitude)
        .bind(&attrs.parent_id)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        let created = inserted.rows_affected() == 1;

        if !created && *attrs != EntityAttrs::default() {
            sqlx::query(
                r#"
                UPDATE canonical_entities SET
                    name = COALESCE(?, name),
                    search_name = COALESCE(?, search_name),
                    code = COALESCE(?, code),
                    description = COALESCE(?, description),
                    address = COALESCE(?, address),
                    image_url = COALESCE(?, image_url),
                    country = COALESCE(?, country),
                    latitude = COALESCE(?, latitude),
                    longitude = COALESCE(?, longitude),
                    parent_id = COALESCE(?, parent_id),
                    updated_at = ?
                WHERE kind = ? AND external_id = ?
                "#,
            )
            .bind(&attrs.name)
            .bind(&search_name)
            .bind(&attrs.code)
            .bind(&attrs.description)
            .bind(&attrs.address)
            .bind(&attrs.image_url)
            .bind(&attrs.country)
            .bind(attrs.latitude)
            .bind(attrs.longitude)
            .bind(&attrs.parent_id)
            .bind(now)
            .bind(kind.as_str())
            .bind(external_id)
            .execute(&mut *tx)
            .await?;
        }

        let row = sqlx::query(&format!(
            "SELECT {ENTITY_COLUMNS} FROM canonical_entities WHERE kind = ? AND external_id = ?"
        ))
        .bind(kind.as_str())
        .bind(external_id)
        .fetch_one(&mut *tx)
        .await?;
        let entity = entity_from_row(&row)?;

        tx.commit().await?;
        Ok(Resolution { entity, created })
    }

    async fn get_entity(
        &self,
        kind: EntityKind,
        external_id: &str,
    ) -> Result<Option<CanonicalEntity>> {
        let row = sqlx::query(&format!(
            "SELECT {ENTITY_COLUMNS} FROM canonical_entities WHERE kind = ? AND external_id = ?"
        ))
        .bind(kind.as_str())
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(entity_from_row).transpose()
    }

    async fn entity_names(&self, ids: &[String]) -> Result<HashMap<String, String>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let mut qb: QueryBuilder<'static, Sqlite> = QueryBuilder::new(
            "SELECT id, name FROM canonical_entities WHERE name IS NOT NULL AND id IN ",
        );
        push_id_list(&mut qb, ids);
        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut names = HashMap::with_capacity(rows.len());
        for row in &rows {
            names.insert(row.try_get("id")?, row.try_get("name")?);
        }
        Ok(names)
    }

    #[instrument(skip_all, fields(%kind, external_id = %external_id))]
    async fn confirm_entity(
        &self,
        kind: EntityKind,
        external_id: &str,
        now: i64,
    ) -> Result<Option<CanonicalEntity>> {
        let result = sqlx::query(
            "UPDATE canonical_entities SET is_stub = 0, needs_review = 0, updated_at = ? \
             WHERE kind = ? AND external_id = ?",
        )
        .bind(now)
        .bind(kind.as_str())
        .bind(external_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_entity(kind, external_id).await
    }

    #[instrument(skip_all, fields(external_id = %row.external_id))]
    async fn upsert_sailing(&self, row: &SailingUpsert) -> Result<Sailing> {
        let mut tx = self.pool.begin().await?;

        let returned = sqlx::query(
            r#"
            INSERT INTO sailings (id, external_id, name, search_name, cruise_line_id, ship_id,
                                  embark_port_id, disembark_port_id, sail_date, end_date, nights,
                                  price_inside, price_oceanview, price_balcony, price_suite,
                                  cheapest_price, currency, feed_hash,
                                  last_synced_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(external_id) DO UPDATE SET
                name = excluded.name,
                search_name = excluded.search_name,
                cruise_line_id = excluded.cruise_line_id,
                ship_id = excluded.ship_id,
                embark_port_id = excluded.embark_port_id,
                disembark_port_id = excluded.disembark_port_id,
                sail_date = excluded.sail_date,
                end_date = excluded.end_date,
                nights = excluded.nights,
                price_inside = excluded.price_inside,
                price_oceanview = excluded.price_oceanview,
                price_balcony = excluded.price_balcony,
                price_suite = excluded.price_suite,
                cheapest_price = excluded.cheapest_price,
                currency = excluded.currency,
                feed_hash = excluded.feed_hash,
                last_synced_at = excluded.last_synced_at,
                updated_at = excluded.updated_at
            RETURNING id
            "#,
        )
        .bind(&row.id)
        .bind(&row.external_id)
        .bind(&row.name)
        .bind(row.name.as_deref().map(fold_name))
        .bind(&row.cruise_line_id)
        .bind(&row.ship_id)
        .bind(&row.embark_port_id)
        .bind(&row.disembark_port_id)
        .bind(row.sail_date.format(DATE_FORMAT).to_string())
        .bind(row.end_date.format(DATE_FORMAT).to_string())
        .bind(i64::from(row.nights))
        .bind(row.prices.inside)
        .bind(row.prices.oceanview)
        .bind(row.prices.balcony)
        .bind(row.prices.suite)
        .bind(row.cheapest_price)
        .bind(&row.currency)
        .bind(&row.feed_hash)
        .bind(row.synced_at)
        .bind(row.synced_at)
        .bind(row.synced_at)
        .fetch_one(&mut *tx)
        .await?;
        let sailing_id: String = returned.try_get("id")?;

        sqlx::query("DELETE FROM itinerary_stops WHERE sailing_id = ?")
            .bind(&sailing_id)
            .execute(&mut *tx)
            .await?;
        for stop in &row.itinerary {
            sqlx::query(
                "INSERT INTO itinerary_stops (sailing_id, day_number, port_id, arrival, departure) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&sailing_id)
            .bind(i64::from(stop.day_number))
            .bind(&stop.port_id)
            .bind(format_date_time(stop.arrival))
            .bind(format_date_time(stop.departure))
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("DELETE FROM sailing_regions WHERE sailing_id = ?")
            .bind(&sailing_id)
            .execute(&mut *tx)
            .await?;
        for (position, region_id) in row.region_ids.iter().enumerate() {
            sqlx::query(
                "INSERT INTO sailing_regions (sailing_id, region_id, position) VALUES (?, ?, ?)",
            )
            .bind(&sailing_id)
            .bind(region_id)
            .bind(position as i64)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("DELETE FROM cabin_grades WHERE sailing_id = ?")
            .bind(&sailing_id)
            .execute(&mut *tx)
            .await?;
        for (position, grade) in row.cabin_grades.iter().enumerate() {
            sqlx::query(
                "INSERT INTO cabin_grades (sailing_id, position, code, name, category, price_cents) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&sailing_id)
            .bind(position as i64)
            .bind(&grade.code)
            .bind(&grade.name)
            .bind(grade.category.as_str())
            .bind(grade.price_cents)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        self.get_sailing(&sailing_id)
            .await?
            .ok_or_else(|| anyhow!("sailing {} vanished after upsert", row.external_id))
    }

    async fn get_sailing(&self, id: &str) -> Result<Option<Sailing>> {
        let Some(row) = sqlx::query(
            "SELECT * FROM sailings WHERE id = ? OR external_id = ? ORDER BY (id = ?) DESC LIMIT 1",
        )
        .bind(id)
        .bind(id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };
        let sailing_id: String = row.try_get("id")?;

        let stops = sqlx::query(
            "SELECT day_number, port_id, arrival, departure FROM itinerary_stops \
             WHERE sailing_id = ? ORDER BY day_number",
        )
        .bind(&sailing_id)
        .fetch_all(&self.pool)
        .await?;
        let itinerary = stops
            .iter()
            .map(|r| {
                Ok(ItineraryStop {
                    day_number: nights(r.try_get("day_number")?),
                    port_id: r.try_get("port_id")?,
                    arrival: parse_date_time(r.try_get("arrival")?)?,
                    departure: parse_date_time(r.try_get("departure")?)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let region_ids: Vec<String> = sqlx::query_scalar(
            "SELECT region_id FROM sailing_regions WHERE sailing_id = ? ORDER BY position",
        )
        .bind(&sailing_id)
        .fetch_all(&self.pool)
        .await?;

        let grades = sqlx::query(
            "SELECT code, name, category, price_cents FROM cabin_grades \
             WHERE sailing_id = ? ORDER BY position",
        )
        .bind(&sailing_id)
        .fetch_all(&self.pool)
        .await?;
        let cabin_grades = grades
            .iter()
            .map(|r| {
                let category: String = r.try_get("category")?;
                Ok(CabinGrade {
                    code: r.try_get("code")?,
                    name: r.try_get("name")?,
                    category: CabinCategory::parse(&category)
                        .ok_or_else(|| anyhow!("unknown cabin category '{category}'"))?,
                    price_cents: r.try_get("price_cents")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let sail_date: String = row.try_get("sail_date")?;
        let end_date: String = row.try_get("end_date")?;
        Ok(Some(Sailing {
            id: sailing_id,
            external_id: row.try_get("external_id")?,
            name: row.try_get("name")?,
            cruise_line_id: row.try_get("cruise_line_id")?,
            ship_id: row.try_get("ship_id")?,
            embark_port_id: row.try_get("embark_port_id")?,
            disembark_port_id: row.try_get("disembark_port_id")?,
            sail_date: parse_date(&sail_date)?,
            end_date: parse_date(&end_date)?,
            nights: nights(row.try_get("nights")?),
            itinerary,
            region_ids,
            cabin_grades,
            prices: prices_from_row(&row)?,
            cheapest_price: row.try_get("cheapest_price")?,
            currency: row.try_get("currency")?,
            feed_hash: row.try_get("feed_hash")?,
            last_synced_at: row.try_get("last_synced_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            notes: row.try_get("notes")?,
        }))
    }

    #[instrument(skip_all, fields(page = query.page, page_size = query.page_size))]
    async fn query_sailings(&self, query: &SearchQuery) -> Result<SailingPage> {
        // One read transaction so the page and the total see the same snapshot.
        let mut tx = self.pool.begin().await?;

        let mut count_qb: QueryBuilder<'static, Sqlite> =
            QueryBuilder::new(format!("SELECT COUNT(*) AS total{SUMMARY_FROM}"));
        push_filters(&mut count_qb, query);
        let total: i64 = count_qb
            .build()
            .fetch_one(&mut *tx)
            .await?
            .try_get("total")?;

        let mut qb: QueryBuilder<'static, Sqlite> =
            QueryBuilder::new(format!("{SUMMARY_SELECT}{SUMMARY_FROM}"));
        push_filters(&mut qb, query);
        push_order(&mut qb, query);
        qb.push(" LIMIT ")
            .push_bind(i64::from(query.page_size))
            .push(" OFFSET ")
            .push_bind(i64::try_from(query.offset()).unwrap_or(i64::MAX));
        let rows = qb.build().fetch_all(&mut *tx).await?;
        tx.commit().await?;

        let items = rows
            .iter()
            .map(summary_from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok(SailingPage {
            items,
            total: count(total),
        })
    }

    async fn coverage(&self, oldest_limit: usize, now: i64) -> Result<CoverageStats> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            r#"
            SELECT kind,
                   COUNT(*) AS total,
                   SUM(CASE WHEN image_url IS NOT NULL THEN 1 ELSE 0 END) AS with_key_media,
                   SUM(CASE WHEN is_stub = 1 OR needs_review = 1 OR name IS NULL
                             OR (kind = 'port' AND (latitude IS NULL OR longitude IS NULL))
                             OR (kind = 'ship' AND parent_id IS NULL)
                        THEN 1 ELSE 0 END) AS needs_review,
                   SUM(CASE WHEN is_stub = 1 THEN 1 ELSE 0 END) AS stubs
            FROM canonical_entities
            GROUP BY kind
            "#,
        )
        .fetch_all(&mut *tx)
        .await?;

        let mut kinds: Vec<KindCoverage> =
            EntityKind::ALL.iter().map(|k| KindCoverage::empty(*k)).collect();
        let mut total_pending = 0;
        for row in &rows {
            let kind: String = row.try_get("kind")?;
            let Some(stats) = EntityKind::parse(&kind)
                .and_then(|k| kinds.iter_mut().find(|s| s.kind == k))
            else {
                continue;
            };
            stats.total = count(row.try_get("total")?);
            stats.with_key_media = count(row.try_get("with_key_media")?);
            stats.needs_review = count(row.try_get("needs_review")?);
            stats.stubs = count(row.try_get("stubs")?);
            total_pending += stats.stubs;
        }

        let collisions = sqlx::query(
            r#"
            SELECT kind, MIN(name) AS name, group_concat(external_id, char(31)) AS external_ids
            FROM canonical_entities
            WHERE name IS NOT NULL
            GROUP BY kind, search_name
            HAVING COUNT(*) > 1
            ORDER BY search_name
            "#,
        )
        .fetch_all(&mut *tx)
        .await?;
        for row in &collisions {
            let kind: String = row.try_get("kind")?;
            let joined: String = row.try_get("external_ids")?;
            let mut external_ids: Vec<String> = joined.split('\u{1f}').map(str::to_string).collect();
            external_ids.sort();
            if let Some(stats) = EntityKind::parse(&kind)
                .and_then(|k| kinds.iter_mut().find(|s| s.kind == k))
            {
                stats.name_collisions.push(NameCollision {
                    name: row.try_get("name")?,
                    external_ids,
                });
            }
        }

        let stubs = sqlx::query(
            "SELECT id, kind, external_id, name, created_at FROM canonical_entities \
             WHERE is_stub = 1 ORDER BY created_at ASC, id ASC LIMIT ?",
        )
        .bind(i64::try_from(oldest_limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await?;
        let oldest_stubs = stubs
            .iter()
            .map(|row| {
                let kind: String = row.try_get("kind")?;
                Ok(StubRef {
                    id: row.try_get("id")?,
                    kind: EntityKind::parse(&kind)
                        .ok_or_else(|| anyhow!("unknown entity kind '{kind}'"))?,
                    external_id: row.try_get("external_id")?,
                    name: row.try_get("name")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        tx.commit().await?;
        Ok(CoverageStats {
            generated_at: now,
            kinds,
            total_pending,
            oldest_stubs,
        })
    }
}

const RUN_COLUMNS: &str = "id, started_at, completed_at, status, triggered_by, feed_label, \
     files_processed, files_skipped, sailings_upserted, stubs_created, fatal_error";

fn run_from_row(row: &SqliteRow) -> Result<SyncRun> {
    let status: String = row.try_get("status")?;
    let trigger: String = row.try_get("triggered_by")?;
    Ok(SyncRun {
        id: row.try_get("id")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        status: SyncStatus::parse(&status).ok_or_else(|| anyhow!("unknown run status '{status}'"))?,
        trigger: SyncTrigger::parse(&trigger)
            .ok_or_else(|| anyhow!("unknown run trigger '{trigger}'"))?,
        feed_label: row.try_get("feed_label")?,
        metrics: SyncMetrics {
            files_processed: count(row.try_get("files_processed")?),
            files_skipped: count(row.try_get("files_skipped")?),
            sailings_upserted: count(row.try_get("sailings_upserted")?),
            stubs_created: count(row.try_get("stubs_created")?),
        },
        errors: Vec::new(),
        fatal_error: row.try_get("fatal_error")?,
    })
}

fn error_from_row(row: &SqliteRow) -> Result<SyncError> {
    let error_type: String = row.try_get("error_type")?;
    Ok(SyncError {
        file_path: row.try_get("file_path")?,
        error_type: ErrorType::parse(&error_type)
            .ok_or_else(|| anyhow!("unknown error type '{error_type}'"))?,
        message: row.try_get("message")?,
        external_id: row.try_get("external_id")?,
        created_at: row.try_get("created_at")?,
    })
}

impl SqliteStore {
    async fn run_errors(&self, run_id: &str, limit: Option<usize>) -> Result<Vec<SyncError>> {
        let limit = limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));
        let rows = sqlx::query(
            "SELECT file_path, error_type, message, external_id, created_at FROM sync_errors \
             WHERE run_id = ? ORDER BY id LIMIT ?",
        )
        .bind(run_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(error_from_row).collect()
    }
}

#[async_trait]
impl RunStore for SqliteStore {
    #[instrument(skip_all, fields(run_id = %run.id))]
    async fn start_run(&self, run: &SyncRun) -> Result<bool> {
        let result = sqlx::query(&format!(
            "INSERT INTO sync_runs ({RUN_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&run.id)
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(run.status.as_str())
        .bind(run.trigger.as_str())
        .bind(&run.feed_label)
        .bind(run.metrics.files_processed as i64)
        .bind(run.metrics.files_skipped as i64)
        .bind(run.metrics.sailings_upserted as i64)
        .bind(run.metrics.stubs_created as i64)
        .bind(&run.fatal_error)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn record_success(&self, run_id: &str, sailings: u64, stubs_created: u64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE sync_runs SET files_processed = files_processed + 1, \
             sailings_upserted = sailings_upserted + ?, stubs_created = stubs_created + ? \
             WHERE id = ? AND status = 'running'",
        )
        .bind(sailings as i64)
        .bind(stubs_created as i64)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            bail!("sync run {run_id} is not running");
        }
        Ok(())
    }

    async fn record_failure(&self, run_id: &str, error: &SyncError) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE sync_runs SET files_skipped = files_skipped + 1 \
             WHERE id = ? AND status = 'running'",
        )
        .bind(run_id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            bail!("sync run {run_id} is not running");
        }
        sqlx::query(
            "INSERT INTO sync_errors (run_id, file_path, error_type, message, external_id, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(run_id)
        .bind(&error.file_path)
        .bind(error.error_type.as_str())
        .bind(&error.message)
        .bind(&error.external_id)
        .bind(error.created_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip_all, fields(run_id = %run_id, %status))]
    async fn finish_run(
        &self,
        run_id: &str,
        status: SyncStatus,
        completed_at: i64,
        fatal_error: Option<&str>,
    ) -> Result<()> {
        if !status.is_terminal() {
            bail!("a run can only be finished with a terminal status");
        }
        let result = sqlx::query(
            "UPDATE sync_runs SET status = ?, completed_at = ?, fatal_error = ? \
             WHERE id = ? AND status = 'running'",
        )
        .bind(status.as_str())
        .bind(completed_at)
        .bind(fatal_error)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            bail!("sync run {run_id} is not running");
        }
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<SyncRun>> {
        let row = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM sync_runs WHERE id = ?"))
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut run = run_from_row(&row)?;
        run.errors = self.run_errors(&run.id, None).await?;
        Ok(Some(run))
    }

    async fn list_runs(&self, limit: usize, error_preview: usize) -> Result<Vec<RunSummary>> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM sync_runs ORDER BY started_at DESC, rowid DESC LIMIT ?"
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let mut summaries = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut run = run_from_row(row)?;
            let error_count: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM sync_errors WHERE run_id = ?")
                    .bind(&run.id)
                    .fetch_one(&self.pool)
                    .await?;
            run.errors = self.run_errors(&run.id, Some(error_preview)).await?;
            summaries.push(RunSummary {
                errors_truncated: count(error_count) > run.errors.len() as u64,
                error_count: count(error_count),
                run,
            });
        }
        Ok(summaries)
    }

    async fn latest_run(&self) -> Result<Option<SyncRun>> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM sync_runs ORDER BY started_at DESC, rowid DESC LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn fail_stale_runs(
        &self,
        started_before: i64,
        now: i64,
        message: &str,
    ) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "UPDATE sync_runs SET status = 'failed', completed_at = ?, fatal_error = ? \
             WHERE status = 'running' AND started_at < ? RETURNING id",
        )
        .bind(now)
        .bind(message)
        .bind(started_before)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}
