use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::Parser;
use daysync::config;
use daysync::model::ScopeKey;
use daysync::remote::sqlite::init_pool;
use daysync::remote::{RemoteStore, SqliteRemote};
use daysync::store::{is_dense, totals_of};

#[derive(Parser, Debug)]
#[command(about = "Print a day's rows in display order and check ordering density")]
struct Args {
    /// Path to YAML config (reads only `app.data_dir`)
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Day to inspect (YYYY-MM-DD)
    #[arg(long)]
    date: String,

    /// Print rows as JSON lines instead of a table
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let scope = ScopeKey::parse_day(&args.date)
        .ok_or_else(|| anyhow!("invalid --date {:?}, expected YYYY-MM-DD", args.date))?;

    let database_url = match std::env::var("DATABASE_URL") {
        Ok(url) => url,
        Err(_) => config::load(Some(&args.config))?.database_url(),
    };
    let pool = init_pool(&database_url).await?;
    let remote = SqliteRemote::new(pool, 1);
    let rows = remote.load(&scope).await?;

    println!("Scope: {}", scope);
    for row in &rows {
        if args.json {
            println!("{}", serde_json::to_string(row)?);
            continue;
        }
        println!(
            "{:>4}  {:<7} {:>8} {:<6} value={:<9} rate={:<9} {}  [{}]",
            row.ordering.map_or_else(|| "-".to_string(), |o| o.to_string()),
            row.status.as_str(),
            row.quantity,
            row.unit,
            row.value_snapshot,
            row.per_unit_snapshot.map_or_else(|| "-".to_string(), |r| r.to_string()),
            row.name,
            row.id
        );
    }

    let totals = totals_of(&rows);
    println!(
        "Rows: {}  planned={:.2} eaten={:.2} total={:.2}",
        rows.len(),
        totals.planned,
        totals.eaten,
        totals.total()
    );
    let mut orderings: Vec<i64> = rows.iter().filter_map(|r| r.ordering).collect();
    orderings.sort_unstable();
    orderings.dedup();
    if is_dense(&rows) {
        println!("Ordering: dense");
    } else if orderings.len() == rows.len() {
        // Deletes leave holes; the next reorder rewrites 0..N-1.
        println!("Ordering: unique with gaps");
    } else {
        println!("Ordering: BROKEN (missing or duplicate values)");
        std::process::exit(1);
    }
    Ok(())
}
