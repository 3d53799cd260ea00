//! Catalog coverage overview and the stub review queue.
//!
//! `sailsync coverage` prints per-kind completeness, name collisions, and the
//! oldest pending stubs. `sailsync review confirm` is the only way a stub
//! becomes confirmed; the sync pipeline never does it.

use anyhow::{bail, Result};
use chrono::Utc;
use tracing::info;

use sailsync_core::coverage::{self, CoverageStats};
use sailsync_core::models::EntityKind;
use sailsync_core::store::CatalogStore;

use crate::config::Config;
use crate::sqlite_store::SqliteStore;

/// Run the coverage command: compute the report and print a summary.
pub async fn run_coverage(config: &Config, oldest: Option<usize>) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let stats = coverage::report(&store, oldest.unwrap_or(config.review.oldest_stubs)).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("SailSync — Catalog Coverage");
    println!("===========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    print_report(&stats);

    store.pool().close().await;
    Ok(())
}

fn print_report(stats: &CoverageStats) {
    println!(
        "  {:<12} {:>7} {:>7} {:>7} {:>7} {:>11}",
        "KIND", "TOTAL", "MEDIA", "REVIEW", "STUBS", "COLLISIONS"
    );
    println!("  {}", "-".repeat(58));
    for k in &stats.kinds {
        println!(
            "  {:<12} {:>7} {:>7} {:>7} {:>7} {:>11}",
            k.kind.as_str(),
            k.total,
            k.with_key_media,
            k.needs_review,
            k.stubs,
            k.name_collisions.len()
        );
    }
    println!();
    println!("  Pending stubs: {}", stats.total_pending);

    let collisions: Vec<_> = stats
        .kinds
        .iter()
        .flat_map(|k| k.name_collisions.iter().map(move |c| (k.kind, c)))
        .collect();
    if !collisions.is_empty() {
        println!();
        println!("  Name collisions:");
        for (kind, c) in collisions {
            println!("    {:<12} {:<32} {}", kind.as_str(), c.name, c.external_ids.join(", "));
        }
    }

    if !stats.oldest_stubs.is_empty() {
        println!();
        println!("  Oldest stubs:");
        println!(
            "    {:<12} {:<20} {:<28} {}",
            "KIND", "EXTERNAL ID", "NAME", "CREATED"
        );
        for stub in &stats.oldest_stubs {
            println!(
                "    {:<12} {:<20} {:<28} {}",
                stub.kind.as_str(),
                stub.external_id,
                stub.name.as_deref().unwrap_or("-"),
                format_ts_relative(stub.created_at)
            );
        }
    }
    println!();
}

/// Marks a stub as reviewed and confirmed.
pub async fn run_confirm(config: &Config, kind: &str, external_id: &str) -> Result<()> {
    let Some(kind) = EntityKind::parse(kind) else {
        bail!("Unknown entity kind: '{kind}'. Use cruise_line, ship, port, or region.");
    };
    let store = SqliteStore::open(config).await?;
    let confirmed = store
        .confirm_entity(kind, external_id, Utc::now().timestamp())
        .await?;
    store.pool().close().await;

    match confirmed {
        Some(entity) => {
            info!(%kind, external_id, "entity confirmed");
            println!(
                "confirmed {} {} ({})",
                kind,
                entity.external_id,
                entity.name().unwrap_or("unnamed")
            );
            Ok(())
        }
        None => bail!("No {kind} with external id '{external_id}'"),
    }
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
pub(crate) fn format_ts_relative(ts: i64) -> String {
    relative_to(ts, Utc::now().timestamp())
}

fn relative_to(ts: i64, now: i64) -> String {
    let delta = now - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

pub(crate) fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
