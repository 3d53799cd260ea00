use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Creates every table and index. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Canonical entities: one row per (kind, external_id)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS canonical_entities (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            external_id TEXT NOT NULL,
            name TEXT,
            search_name TEXT,
            code TEXT,
            description TEXT,
            address TEXT,
            image_url TEXT,
            country TEXT,
            latitude REAL,
            longitude REAL,
            parent_id TEXT REFERENCES canonical_entities(id),
            is_stub INTEGER NOT NULL DEFAULT 1,
            needs_review INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(kind, external_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Sailings
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sailings (
            id TEXT PRIMARY KEY,
            external_id TEXT NOT NULL UNIQUE,
            name TEXT,
            search_name TEXT,
            cruise_line_id TEXT NOT NULL REFERENCES canonical_entities(id),
            ship_id TEXT NOT NULL REFERENCES canonical_entities(id),
            embark_port_id TEXT REFERENCES canonical_entities(id),
            disembark_port_id TEXT REFERENCES canonical_entities(id),
            sail_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            nights INTEGER NOT NULL CHECK (nights >= 0),
            price_inside INTEGER,
            price_oceanview INTEGER,
            price_balcony INTEGER,
            price_suite INTEGER,
            cheapest_price INTEGER,
            currency TEXT,
            feed_hash TEXT,
            notes TEXT,
            last_synced_at INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            CHECK (end_date >= sail_date)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS itinerary_stops (
            sailing_id TEXT NOT NULL REFERENCES sailings(id) ON DELETE CASCADE,
            day_number INTEGER NOT NULL,
            port_id TEXT NOT NULL REFERENCES canonical_entities(id),
            arrival TEXT,
            departure TEXT,
            PRIMARY KEY (sailing_id, day_number)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sailing_regions (
            sailing_id TEXT NOT NULL REFERENCES sailings(id) ON DELETE CASCADE,
            region_id TEXT NOT NULL REFERENCES canonical_entities(id),
            position INTEGER NOT NULL,
            PRIMARY KEY (sailing_id, region_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cabin_grades (
            sailing_id TEXT NOT NULL REFERENCES sailings(id) ON DELETE CASCADE,
            position INTEGER NOT NULL,
            code TEXT NOT NULL,
            name TEXT,
            category TEXT NOT NULL,
            price_cents INTEGER,
            PRIMARY KEY (sailing_id, position)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Sync runs and their append-only error log
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_runs (
            id TEXT PRIMARY KEY,
            started_at INTEGER NOT NULL,
            completed_at INTEGER,
            status TEXT NOT NULL,
            triggered_by TEXT NOT NULL,
            feed_label TEXT NOT NULL,
            files_processed INTEGER NOT NULL DEFAULT 0,
            files_skipped INTEGER NOT NULL DEFAULT 0,
            sailings_upserted INTEGER NOT NULL DEFAULT 0,
            stubs_created INTEGER NOT NULL DEFAULT 0,
            fatal_error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_errors (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL REFERENCES sync_runs(id),
            file_path TEXT NOT NULL,
            error_type TEXT NOT NULL,
            message TEXT NOT NULL,
            external_id TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // At most one running run
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_sync_runs_single_running \
         ON sync_runs(status) WHERE status = 'running'",
    )
    .execute(pool)
    .await?;

    // Create indexes
    for statement in [
        "CREATE INDEX IF NOT EXISTS idx_sync_runs_started_at ON sync_runs(started_at DESC)",
        "CREATE INDEX IF NOT EXISTS idx_sync_errors_run_id ON sync_errors(run_id)",
        "CREATE INDEX IF NOT EXISTS idx_entities_stub ON canonical_entities(is_stub, created_at)",
        "CREATE INDEX IF NOT EXISTS idx_entities_search_name ON canonical_entities(kind, search_name)",
        "CREATE INDEX IF NOT EXISTS idx_sailings_sail_date ON sailings(sail_date)",
        "CREATE INDEX IF NOT EXISTS idx_sailings_cheapest ON sailings(cheapest_price)",
        "CREATE INDEX IF NOT EXISTS idx_sailings_ship ON sailings(ship_id)",
        "CREATE INDEX IF NOT EXISTS idx_sailings_line ON sailings(cruise_line_id)",
        "CREATE INDEX IF NOT EXISTS idx_stops_port ON itinerary_stops(port_id)",
        "CREATE INDEX IF NOT EXISTS idx_regions_region ON sailing_regions(region_id)",
    ] {
        sqlx::query(statement).execute(pool).await?;
    }

    Ok(())
}
