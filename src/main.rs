use anyhow::{anyhow, bail, Result};
use chrono::Local;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use daysync::config;
use daysync::engine::{CommitMode, EntryValue, NewEntry, SyncEngine};
use daysync::model::{Entry, EntryId, EntryStatus, ScopeKey};
use daysync::remote::sqlite::{init_pool, run_migrations};
use daysync::remote::SqliteRemote;
use daysync::session::{Intent, Notice, Session, SessionHandle};
use daysync::store::totals_of;

const HELP: &str = "\
commands:
  list                              show the day
  add <qty> <unit> <value> <name>   value is the total, or per unit with a /u suffix (1.65/u)
  qty <row> <quantity>              edit quantity (debounced)
  qty! <row> <quantity>             edit quantity and save now
  status <row> planned|eaten
  toggle <row>
  del <row>
  move <from> <to>                  1-based positions
  pending                           in-flight operations
  reload
  quit";

#[derive(Debug, Parser)]
#[command(author, version, about = "Edit one day's entries with optimistic sync")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Day to open (YYYY-MM-DD); defaults to today
    #[arg(long)]
    date: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let scope = match &args.date {
        Some(raw) => ScopeKey::parse_day(raw).ok_or_else(|| anyhow!("invalid --date {raw:?}, expected YYYY-MM-DD"))?,
        None => ScopeKey::day(Local::now().date_naive()),
    };

    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.database_url());
    let pool = init_pool(&database_url).await?;
    run_migrations(&pool).await?;
    let remote = Arc::new(SqliteRemote::new(pool, cfg.feed.channel_capacity));

    let engine = SyncEngine::new(scope.clone(), cfg.engine_settings());
    let (handle, mut notices, task) = Session::spawn(engine, remote, cfg.session_settings());
    info!(%scope, "session open");
    println!("{scope} (type `help` for commands)");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match run_command(&handle, line.trim()).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(err) => println!("error: {err}"),
                }
            }
            Some(notice) = notices.recv() => print_notice(&notice),
        }
    }

    drop(handle);
    task.await??;
    Ok(())
}

/// Returns false when the user asked to quit.
async fn run_command(handle: &SessionHandle, line: &str) -> Result<bool> {
    let mut parts = line.split_whitespace();
    let Some(cmd) = parts.next() else {
        return Ok(true);
    };
    let rest: Vec<&str> = parts.collect();
    let entries = handle.entries();

    match (cmd, rest.as_slice()) {
        ("help", _) => println!("{HELP}"),
        ("quit" | "exit", _) => return Ok(false),
        ("list" | "ls", _) => print_entries(handle, &entries),
        ("pending", _) => {
            let pending = handle.pending();
            if pending.is_empty() {
                println!("no pending operations");
            }
            for op in pending {
                let state = if op.confirmed_at.is_some() { "confirmed" } else { "saving" };
                let ids: Vec<&str> = op.entity_ids.iter().map(EntryId::as_str).collect();
                println!(
                    "{} {:<28} {:<9} started {} [{}]",
                    op.id.short(),
                    op.kind.as_str(),
                    state,
                    op.started_at.format("%H:%M:%S%.3f"),
                    ids.join(", ")
                );
            }
        }
        ("reload", _) => handle.send(Intent::Reload).await?,
        ("add", [qty, unit, value, name @ ..]) if !name.is_empty() => {
            let value = parse_value(value)?;
            handle
                .send(Intent::Add(NewEntry::new(name.join(" "), *qty, *unit, value)))
                .await?;
        }
        ("qty" | "qty!", [row, quantity @ ..]) if !quantity.is_empty() => {
            let mode = if cmd == "qty!" { CommitMode::Immediate } else { CommitMode::Debounced };
            handle
                .send(Intent::EditQuantity {
                    id: resolve(&entries, row)?,
                    quantity: quantity.join(" "),
                    mode,
                })
                .await?;
        }
        ("status", [row, status]) => {
            let status = EntryStatus::parse_status(status)
                .ok_or_else(|| anyhow!("status must be planned or eaten"))?;
            handle
                .send(Intent::SetStatus { id: resolve(&entries, row)?, status })
                .await?;
        }
        ("toggle", [row]) => {
            let id = resolve(&entries, row)?;
            let status = entries
                .iter()
                .find(|e| e.id == id)
                .map(|e| e.status.toggled())
                .ok_or_else(|| anyhow!("no such row"))?;
            handle.send(Intent::SetStatus { id, status }).await?;
        }
        ("del" | "rm", [row]) => {
            handle.send(Intent::Delete { id: resolve(&entries, row)? }).await?;
        }
        ("move" | "mv", [from, to]) => {
            handle
                .send(Intent::DragEnd {
                    from: position(from)?,
                    to: position(to)?,
                })
                .await?;
        }
        _ => bail!("unrecognised command {line:?}; try `help`"),
    }
    Ok(true)
}

fn parse_value(raw: &str) -> Result<EntryValue> {
    let (number, per_unit) = match raw.strip_suffix("/u") {
        Some(n) => (n, true),
        None => (raw, false),
    };
    let n: f64 = number
        .parse()
        .map_err(|_| anyhow!("value {raw:?} is not a number"))?;
    Ok(if per_unit { EntryValue::PerUnit(n) } else { EntryValue::Total(n) })
}

fn position(raw: &str) -> Result<usize> {
    match raw.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n - 1),
        _ => bail!("position {raw:?} must be a number from 1"),
    }
}

/// A row is named by its 1-based position or by an id prefix.
fn resolve(entries: &[Entry], token: &str) -> Result<EntryId> {
    if let Ok(n) = token.parse::<usize>() {
        return entries
            .get(n.wrapping_sub(1))
            .map(|e| e.id.clone())
            .ok_or_else(|| anyhow!("no row {n}"));
    }
    let mut matches = entries.iter().filter(|e| e.id.as_str().starts_with(token));
    match (matches.next(), matches.next()) {
        (Some(e), None) => Ok(e.id.clone()),
        (Some(_), Some(_)) => bail!("id prefix {token:?} is ambiguous"),
        (None, _) => bail!("no row matches {token:?}"),
    }
}

fn print_entries(handle: &SessionHandle, entries: &[Entry]) {
    if entries.is_empty() {
        println!("(no entries)");
    }
    for (idx, e) in entries.iter().enumerate() {
        let saving = if handle.is_saving(&e.id) { " saving…" } else { "" };
        println!(
            "{:>2}. [{}] {:>8} {:<6} {:>9.2}  {}  ({}){}",
            idx + 1,
            if e.status == EntryStatus::Eaten { "x" } else { " " },
            e.quantity,
            e.unit,
            e.value_snapshot,
            e.name,
            e.id.as_str().chars().take(8).collect::<String>(),
            saving
        );
    }
    let totals = totals_of(entries);
    println!(
        "planned {:.2}  eaten {:.2}  total {:.2}",
        totals.planned,
        totals.eaten,
        totals.total()
    );
}

fn print_notice(notice: &Notice) {
    match notice {
        Notice::CommandFailed(failure) => println!(
            "! {} {} failed: {}{}",
            failure.kind.as_str(),
            failure.op_id.short(),
            failure.message,
            if failure.rolled_back { " (reverted)" } else { "" }
        ),
        Notice::Rejected { intent, error } => println!("! {intent}: {error}"),
        Notice::ReloadFailed { message } => println!("! reload failed: {message}"),
    }
}
