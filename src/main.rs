use clap::Parser;
use lokalkarte::config::GeocoderConfig;
use lokalkarte::geocode::{
    cancel_on, BatchSession, GeocodeError, GeocodeNotice, JsonFileStore, ResolvedItem, RestaurantItem,
};
use lokalkarte::server::{self, AppState};
use serde::Deserialize;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Lokalkarte: geocode restaurant listings for a map view.
///
/// Resolves postal addresses through a tiered Nominatim cascade, caching
/// results for 30 days. Requests are paced at one per 1.1 s.
///
/// Examples:
///   lokalkarte --input restaurants.json > located.json
///   lokalkarte --address "1040 Wien, Rechte Wienzeile 1" --name "Naschmarkt Deli"
///   lokalkarte --input restaurants.json --plan
///   lokalkarte --stats
///   lokalkarte --serve --port 3000
#[derive(Parser)]
#[command(name = "lokalkarte", version, about, long_about = None)]
struct Cli {
    /// JSON file with listings: an array of {id, name, address, ...} or
    /// {"items": [...]}. Use "-" for stdin.
    #[arg(long, short = 'i')]
    input: Option<String>,

    /// Resolve a single address.
    #[arg(long, short = 'a')]
    address: Option<String>,

    /// Restaurant name for --address (tried as a point of interest first).
    #[arg(long, short = 'n')]
    name: Option<String>,

    /// Show what a batch would cost without resolving anything.
    #[arg(long)]
    plan: bool,

    /// Skip the confirmation for batches above the usage warning threshold.
    #[arg(long, short = 'y')]
    yes: bool,

    /// Show cache statistics.
    #[arg(long)]
    stats: bool,

    /// Remove every cached address.
    #[arg(long)]
    clear_cache: bool,

    /// Drop expired cache entries.
    #[arg(long)]
    clean_cache: bool,

    /// Run the HTTP API.
    #[arg(long)]
    serve: bool,

    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 3000)]
    port: u16,

    /// Config file. Defaults to ~/.lokalkarte/config.json.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Cache storage file. Defaults to ~/.lokalkarte/storage.json.
    #[arg(long)]
    storage: Option<PathBuf>,

    /// Country filter (ISO 3166-1 alpha-2). Empty string searches worldwide.
    #[arg(long)]
    country: Option<String>,

    /// Nominatim-compatible search endpoint.
    #[arg(long)]
    endpoint: Option<String>,

    /// Never fall back to a city-level (approximate) position.
    #[arg(long)]
    no_city_fallback: bool,

    /// Debug logging.
    #[arg(long, short = 'v')]
    verbose: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum InputDoc {
    List(Vec<RestaurantItem>),
    Wrapped { items: Vec<RestaurantItem> },
}

impl InputDoc {
    fn into_items(self) -> Vec<RestaurantItem> {
        match self {
            Self::List(items) | Self::Wrapped { items } => items,
        }
    }
}

fn exit_with(msg: impl std::fmt::Display) -> ! {
    eprintln!("Error: {}", msg);
    std::process::exit(1);
}

fn load_config(cli: &Cli) -> GeocoderConfig {
    let path = cli.config.clone().unwrap_or_else(GeocoderConfig::default_path);
    let mut config = GeocoderConfig::load(&path).unwrap_or_else(|e| exit_with(e));
    if let Some(country) = &cli.country {
        config.country_code = country.clone();
    }
    if let Some(endpoint) = &cli.endpoint {
        config.endpoint = endpoint.clone();
    }
    if cli.no_city_fallback {
        config.city_fallback = false;
    }
    config
}

fn read_items(source: &str) -> Vec<RestaurantItem> {
    let data = if source == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .unwrap_or_else(|e| exit_with(format!("Cannot read stdin: {}", e)));
        buf
    } else {
        std::fs::read_to_string(source).unwrap_or_else(|e| exit_with(format!("Cannot read '{}': {}", source, e)))
    };
    serde_json::from_str::<InputDoc>(&data)
        .map(InputDoc::into_items)
        .unwrap_or_else(|e| exit_with(format!("Invalid listings in '{}': {}", source, e)))
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => exit_with(e),
    }
}

fn print_notice(notice: &GeocodeNotice) {
    eprintln!("  \u{26A0}\u{FE0F}  {}", notice);
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if cli.verbose { "debug" } else { "info" }),
    )
    .init();

    let config = load_config(&cli);

    let store = Arc::new(match &cli.storage {
        Some(path) => JsonFileStore::new(path),
        None => JsonFileStore::open_default(),
    });
    log::debug!("Cache storage at {}", store.path().display());
    let cache = Arc::new(config.cache(store));

    // ── Cache maintenance ───────────────────────────────────────

    if cli.clear_cache {
        cache.clear().await.unwrap_or_else(|e| exit_with(e));
        eprintln!("  Cache cleared.");
    }
    if cli.clean_cache {
        let report = cache.clean_expired().await.unwrap_or_else(|e| exit_with(e));
        eprintln!(
            "  Removed {} expired entries, {} remaining.",
            report.removed, report.remaining
        );
    }
    if cli.stats {
        let stats = cache.stats().await.unwrap_or_else(|e| exit_with(e));
        println!("Cached addresses: {}", stats.count);
        println!("Storage used:     {:.2} KB", stats.size_kb());
    }

    let resolver = Arc::new(config.resolver(Arc::new(config.transport())));

    let shutdown = CancellationToken::new();
    let on_ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if cancel_on(on_ctrl_c, tokio::signal::ctrl_c()).await {
            eprintln!();
            eprintln!("  Cancelling...");
        }
    });

    // ── HTTP API ────────────────────────────────────────────────

    if cli.serve {
        let state = Arc::new(AppState::new(config, cache, resolver).with_shutdown(shutdown.clone()));
        if let Err(e) = server::start(state, &cli.host, cli.port, shutdown).await {
            exit_with(format!("Server on {}:{} failed: {}", cli.host, cli.port, e));
        }
        return;
    }

    let session = config
        .session(cache, resolver)
        .with_cancellation(shutdown)
        .with_notices(Arc::new(print_notice));

    // ── Single address ──────────────────────────────────────────

    if let Some(address) = &cli.address {
        let mut item = RestaurantItem::new(address.trim());
        item.name = cli.name.clone().filter(|n| !n.trim().is_empty());
        let resolved = session.resolve_item(item).await;
        match &resolved.coords {
            Some(c) if c.approximate => eprintln!("  \u{1F4CD} {} (city level, approximate)", c),
            Some(c) => eprintln!("  \u{1F4CD} {}", c),
            None => eprintln!("  No location found for '{}'.", address),
        }
        print_json(&resolved);
        return;
    }

    // ── Batch ───────────────────────────────────────────────────

    let Some(input) = &cli.input else {
        if cli.stats || cli.clear_cache || cli.clean_cache {
            return;
        }
        eprintln!("Error: Nothing to do.");
        eprintln!();
        eprintln!("Usage:");
        eprintln!("  lokalkarte --input restaurants.json");
        eprintln!("  lokalkarte --address \"1040 Wien, Rechte Wienzeile 1\" --name \"Naschmarkt Deli\"");
        eprintln!("  lokalkarte --stats | --clean-cache | --clear-cache");
        eprintln!("  lokalkarte --serve");
        std::process::exit(1);
    };
    let items = read_items(input);

    let plan = session.plan(&items).await;
    if cli.plan {
        print_json(&plan);
        return;
    }
    if plan.exceeds_usage_threshold && !cli.yes {
        exit_with(format!(
            "{} addresses need a lookup (about {} min at one request per {:.1} s). \
             Re-run with --yes to proceed.",
            plan.uncached,
            plan.estimated.as_secs().div_ceil(60),
            session.rate_limit().as_secs_f64()
        ));
    }

    match run_batch(&session, items).await {
        Ok(results) => print_json(&results),
        Err(GeocodeError::Cancelled) => {
            eprintln!("  Geocoding cancelled. Resolved addresses stay cached.");
            std::process::exit(130);
        }
    }
}

async fn run_batch(session: &BatchSession, items: Vec<RestaurantItem>) -> Result<Vec<ResolvedItem>, GeocodeError> {
    let results = session
        .resolve_all_with_progress(items, |p| {
            eprint!(
                "\r  Geocoding {}/{} ({} located)   ",
                p.processed,
                p.total,
                p.located()
            );
            let _ = std::io::stderr().flush();
        })
        .await;
    eprintln!();
    results
}
