//! `sailsync search` and `sailsync sailing <id>`.

use anyhow::{bail, Result};
use chrono::NaiveDate;
use clap::Args;

use sailsync_core::models::CabinCategory;
use sailsync_core::search::{
    sailing_detail, search, SailingSummary, SearchError, SearchFilters, SearchRequest, SortDir,
    SortField,
};

use crate::config::Config;
use crate::sqlite_store::SqliteStore;

/// Search filters as CLI flags. Id lists are comma-separated.
#[derive(Args, Debug, Clone, Default)]
pub struct SearchArgs {
    /// Substring of the sailing, ship, line, or any port name
    pub text: Option<String>,
    #[arg(long, value_delimiter = ',')]
    pub line: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    pub ship: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    pub region: Vec<String>,
    /// Embarkation or disembarkation port ids
    #[arg(long, value_delimiter = ',')]
    pub port: Vec<String>,
    /// Port ids that must all appear in the itinerary
    #[arg(long, value_delimiter = ',')]
    pub visits: Vec<String>,
    /// Earliest sail date (YYYY-MM-DD)
    #[arg(long)]
    pub from: Option<NaiveDate>,
    /// Latest sail date (YYYY-MM-DD)
    #[arg(long)]
    pub to: Option<NaiveDate>,
    #[arg(long)]
    pub nights_min: Option<u32>,
    #[arg(long)]
    pub nights_max: Option<u32>,
    #[arg(long)]
    pub price_min_cents: Option<i64>,
    #[arg(long)]
    pub price_max_cents: Option<i64>,
    /// inside, oceanview, balcony, or suite
    #[arg(long, value_parser = parse_category)]
    pub cabin: Option<CabinCategory>,
    /// sail_date, price, nights, ship_name, or line_name
    #[arg(long, value_parser = parse_sort_field, default_value = "sail_date")]
    pub sort: SortField,
    #[arg(long, value_parser = parse_sort_dir, default_value = "asc")]
    pub dir: SortDir,
    #[arg(long)]
    pub page: Option<u32>,
    #[arg(long)]
    pub page_size: Option<u32>,
}

pub fn parse_category(s: &str) -> Result<CabinCategory, String> {
    CabinCategory::parse(s).ok_or_else(|| format!("unknown cabin category '{s}'"))
}

pub fn parse_sort_field(s: &str) -> Result<SortField, String> {
    SortField::parse(s).ok_or_else(|| format!("unknown sort field '{s}'"))
}

pub fn parse_sort_dir(s: &str) -> Result<SortDir, String> {
    SortDir::parse(s).ok_or_else(|| format!("unknown sort direction '{s}'"))
}

impl SearchArgs {
    pub fn into_request(self) -> SearchRequest {
        SearchRequest {
            filters: SearchFilters {
                text: self.text,
                cruise_line_ids: self.line,
                ship_ids: self.ship,
                region_ids: self.region,
                port_ids: self.port,
                ports_visited: self.visits,
                sail_date_from: self.from,
                sail_date_to: self.to,
                nights_min: self.nights_min,
                nights_max: self.nights_max,
                price_min_cents: self.price_min_cents,
                price_max_cents: self.price_max_cents,
                cabin_category: self.cabin,
            },
            page: self.page,
            page_size: self.page_size,
            sort_by: self.sort,
            sort_dir: self.dir,
        }
    }
}

pub(crate) fn format_cents(cents: Option<i64>, currency: Option<&str>) -> String {
    match cents {
        Some(c) => format!(
            "{}{}.{:02}",
            currency.map(|c| format!("{c} ")).unwrap_or_default(),
            c / 100,
            c % 100
        ),
        None => "-".to_string(),
    }
}

pub async fn run_search(config: &Config, args: SearchArgs) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let request = args.into_request();
    let result = search(&store, &request, config.page_limits()).await;
    store.pool().close().await;

    let page = match result {
        Ok(page) => page,
        Err(SearchError::InvalidQuery(message)) => bail!("{message}"),
        Err(SearchError::Store(e)) => return Err(e),
    };

    if page.sync_in_progress {
        eprintln!("note: a sync run is in progress; results may change");
    }
    if page.items.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, item) in page.items.iter().enumerate() {
        print_summary(
            (u64::from(page.page) - 1) * u64::from(page.page_size) + i as u64 + 1,
            item,
        );
    }
    println!(
        "page {} of {} ({} sailings)",
        page.page, page.total_pages, page.total
    );
    Ok(())
}

fn print_summary(rank: u64, item: &SailingSummary) {
    println!(
        "{}. {}  [{}]",
        rank,
        item.name.as_deref().unwrap_or("(unnamed sailing)"),
        item.external_id
    );
    println!(
        "    {} → {}, {} nights",
        item.sail_date, item.end_date, item.nights
    );
    println!(
        "    {} / {}",
        item.cruise_line_name.as_deref().unwrap_or(&item.cruise_line_id),
        item.ship_name.as_deref().unwrap_or(&item.ship_id)
    );
    println!(
        "    from {}",
        format_cents(item.cheapest_price, item.currency.as_deref())
    );
    println!("    id: {}", item.id);
    println!();
}

pub async fn run_sailing(config: &Config, id: &str) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let detail = sailing_detail(&store, id).await?;
    store.pool().close().await;

    let Some(detail) = detail else {
        bail!("No sailing with id '{id}'");
    };
    let s = &detail.sailing;
    let currency = s.currency.as_deref();

    println!(
        "{}  [{}]",
        s.name.as_deref().unwrap_or("(unnamed sailing)"),
        s.external_id
    );
    println!("  id:        {}", s.id);
    println!(
        "  line:      {}",
        detail.cruise_line.name.as_deref().unwrap_or(&detail.cruise_line.id)
    );
    println!("  ship:      {}", detail.ship.name.as_deref().unwrap_or(&detail.ship.id));
    println!("  dates:     {} → {} ({} nights)", s.sail_date, s.end_date, s.nights);
    if let Some(port) = &detail.embark_port {
        println!("  embark:    {}", port.name.as_deref().unwrap_or(&port.id));
    }
    if let Some(port) = &detail.disembark_port {
        println!("  disembark: {}", port.name.as_deref().unwrap_or(&port.id));
    }
    if !detail.regions.is_empty() {
        let names: Vec<&str> = detail
            .regions
            .iter()
            .map(|r| r.name.as_deref().unwrap_or(&r.id))
            .collect();
        println!("  regions:   {}", names.join(", "));
    }

    println!("  prices:");
    for category in CabinCategory::ALL {
        println!(
            "    {:<10} {}",
            category.as_str(),
            format_cents(s.prices.get(category), currency)
        );
    }

    if !detail.itinerary.is_empty() {
        println!("  itinerary:");
        for stop in &detail.itinerary {
            println!(
                "    day {:>2}  {:<28} {}",
                stop.stop.day_number,
                stop.port_name.as_deref().unwrap_or(&stop.stop.port_id),
                match (stop.stop.arrival, stop.stop.departure) {
                    (Some(a), Some(d)) => format!("{} - {}", a.format("%H:%M"), d.format("%H:%M")),
                    (Some(a), None) => format!("arrive {}", a.format("%H:%M")),
                    (None, Some(d)) => format!("depart {}", d.format("%H:%M")),
                    (None, None) => String::new(),
                }
            );
        }
    }

    if !s.cabin_grades.is_empty() {
        println!("  cabin grades:");
        for grade in &s.cabin_grades {
            println!(
                "    {:<6} {:<10} {:<24} {}",
                grade.code,
                grade.category.as_str(),
                grade.name.as_deref().unwrap_or(""),
                format_cents(grade.price_cents, currency)
            );
        }
    }
    if let Some(notes) = &s.notes {
        println!("  notes:     {notes}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cents_render_with_currency() {
        assert_eq!(format_cents(Some(64900), Some("USD")), "USD 649.00");
        assert_eq!(format_cents(Some(5), None), "0.05");
        assert_eq!(format_cents(None, Some("USD")), "-");
    }

    #[test]
    fn args_map_onto_request() {
        let args = SearchArgs {
            text: Some("Cozumel".to_string()),
            visits: vec!["p1".to_string(), "p2".to_string()],
            cabin: Some(CabinCategory::Inside),
            price_max_cents: Some(50_000),
            sort: SortField::Price,
            ..SearchArgs::default()
        };
        let request = args.into_request();
        assert_eq!(request.filters.ports_visited, vec!["p1", "p2"]);
        assert_eq!(request.filters.cabin_category, Some(CabinCategory::Inside));
        assert_eq!(request.sort_by, SortField::Price);
        assert_eq!(request.sort_dir, SortDir::Asc);
    }
}
