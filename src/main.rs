use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use beanmap::cache::TracingListener;
use beanmap::driver::memory::{DriverStats, MemoryColumn, MemoryDatabase};
use beanmap::{CacheStats, Entity, Home, OrmConfig, Session, SqlType, Value};
use clap::Parser;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Runs a synthetic workload against the in-memory driver and reports how
/// the statement cache behaved.
#[derive(Parser)]
#[command(name = "beanmap")]
#[command(about = "Statement cache workload report for beanmap")]
struct Cli {
    /// JSON configuration file; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Rows inserted before querying
    #[arg(long, default_value_t = 100)]
    rows: usize,

    /// Lookups executed after the inserts
    #[arg(long, default_value_t = 1000)]
    queries: usize,

    /// Distinct SQL texts the lookups cycle through
    #[arg(long, default_value_t = 8)]
    distinct_sql: usize,

    #[arg(long)]
    max_entries: Option<usize>,

    #[arg(long)]
    max_age_ms: Option<u64>,

    /// Prepare a fresh statement for every call
    #[arg(long)]
    no_cache: bool,

    /// Log every cache event
    #[arg(long)]
    trace_events: bool,
}

#[derive(Debug, Default, Entity)]
#[entity(name = "Dept")]
struct Dept {
    #[column(primary_key, defaultable)]
    id: Option<i64>,
    name: String,
}

#[derive(Serialize)]
struct Report {
    rows: usize,
    queries: usize,
    found: usize,
    cache: Option<CacheStats>,
    driver: DriverStats,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = load_config(&cli)?;
    let report = run(&cli, config)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn load_config(cli: &Cli) -> Result<OrmConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let json = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
            OrmConfig::from_json(&json)?
        }
        None => OrmConfig::default(),
    };

    if let Some(max_entries) = cli.max_entries {
        config = config.max_cache_entries(max_entries);
    }
    if let Some(max_age_ms) = cli.max_age_ms {
        config.max_cache_age_ms = max_age_ms;
    }
    if cli.no_cache {
        config = config.cache_enabled(false);
    }
    config.validate()?;
    Ok(config)
}

fn run(cli: &Cli, config: OrmConfig) -> Result<Report> {
    if cli.distinct_sql == 0 {
        return Err(anyhow!("--distinct-sql must be > 0"));
    }

    let db = MemoryDatabase::new();
    db.create_table(
        "dept",
        vec![
            MemoryColumn::new("id", SqlType::BigInt).auto_increment(),
            MemoryColumn::new("name", SqlType::Varchar).not_null(),
        ],
    )?;

    let mut session = Session::new("main", config)?.with_connection(db.connect());
    if cli.trace_events {
        if let Some(cache) = session.cache_mut() {
            cache.add_listener(Arc::new(TracingListener));
        }
    }
    let session = session.into_shared();
    let home = Home::<Dept>::new(Arc::clone(&session), "dept")?;

    for i in 0..cli.rows {
        let mut dept = Dept {
            id: None,
            name: format!("dept-{}", i),
        };
        home.insert(&mut dept)?;
    }
    info!(rows = cli.rows, "Inserted rows");

    // Trailing whitespace makes each variant a distinct cache key
    let base = home.build_basic_select("where id=?");
    let mut found = 0;
    for i in 0..cli.queries {
        let sql = format!("{}{}", base, " ".repeat(i % cli.distinct_sql));
        let id = Value::Long((i % cli.rows.max(1)) as i64 + 1);
        found += home.query(&sql, &[id])?.len();
    }
    info!(queries = cli.queries, found, "Ran lookups");

    let cache = {
        let guard = session.lock().map_err(|err| anyhow!(err.to_string()))?;
        guard.cache().map(|cache| cache.stats())
    };

    Ok(Report {
        rows: cli.rows,
        queries: cli.queries,
        found,
        cache,
        driver: db.stats(),
    })
}
