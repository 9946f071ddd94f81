use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

use feedmill::clock::SystemClock;
use feedmill::config::Config;
use feedmill::engine::{Engine, FeedStatus, RefreshReport};
use feedmill::feed::{opml, Fetcher};
use feedmill::storage::{Database, DatabaseError};
use feedmill::store::{AggregationStore, ListId, Scope};
use feedmill::util::HostPolicy;
use feedmill::wire::{fetch_feed_json, FeedRequest};

/// Get the config directory path (~/.config/feedmill/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("feedmill"))
}

fn ensure_config_dir(config_dir: &Path) -> Result<()> {
    if !config_dir.exists() {
        std::fs::create_dir_all(config_dir).context("Failed to create config directory")?;
    }

    // SEC-007: Set directory permissions on Unix (user-only access)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) =
            std::fs::set_permissions(config_dir, std::fs::Permissions::from_mode(0o700))
        {
            tracing::warn!(
                path = %config_dir.display(),
                error = %e,
                "Failed to set config directory permissions to 0700"
            );
        }
    }
    Ok(())
}

#[derive(Parser, Debug)]
#[command(
    name = "feedmill",
    version,
    about = "Fetch, normalize and deduplicate RSS/Atom feeds"
)]
struct Args {
    /// Config file (default: ~/.config/feedmill/config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch a single feed and print it as JSON
    Fetch { url: String },
    /// Refresh subscribed feeds and store the results
    Refresh {
        /// Only refresh this list
        #[arg(long, value_name = "NAME")]
        list: Option<String>,
    },
    /// Print stored articles, newest first
    Articles {
        #[arg(long, value_name = "NAME")]
        list: Option<String>,
        /// Only unread articles
        #[arg(long)]
        unread: bool,
    },
    /// Subscribe to the feeds of an OPML file
    Import {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Write subscriptions to an OPML file
    Export {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => config_dir.join("config.toml"),
    };
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config '{}'", config_path.display()))?;

    // Fetch works on a bare URL and never touches the database
    let command = match args.command {
        Command::Fetch { url } => {
            let fetcher = Fetcher::new(config.fetch_config()).context("Invalid fetch settings")?;
            let response = fetch_feed_json(&fetcher, &FeedRequest { url }).await;
            println!("{}", serde_json::to_string_pretty(&response.to_json())?);
            if !response.is_success() {
                std::process::exit(1);
            }
            return Ok(());
        }
        other => other,
    };

    let db_path = match &config.database_path {
        Some(path) => path.clone(),
        None => {
            ensure_config_dir(&config_dir)?;
            config_dir.join("feedmill.db")
        }
    };
    let db = open_database(&db_path).await?;
    let store = Arc::new(restore_store(&db, &config).await?);

    match command {
        Command::Fetch { .. } => {}
        Command::Refresh { list } => {
            let fetcher =
                Arc::new(Fetcher::new(config.fetch_config()).context("Invalid fetch settings")?);
            let engine = Engine::new(Arc::clone(&store), fetcher);
            let report = run_refresh(&engine, list.as_deref()).await?;
            print_report(&store, &report);
            save(&db, &store).await?;
        }
        Command::Articles { list, unread } => {
            let scope = match list.as_deref() {
                Some(name) => Scope::List(resolve_list(&store, name)?),
                None => Scope::All,
            };
            for article in store.articles(scope)? {
                if unread && article.is_read {
                    continue;
                }
                let feed = store
                    .feed(article.feed_id)
                    .map(|f| f.display_title().to_string())
                    .unwrap_or_default();
                println!(
                    "{} {}  {}  ({})",
                    if article.is_read { " " } else { "*" },
                    article.published_at.at.format("%Y-%m-%d %H:%M"),
                    article.title,
                    feed
                );
                if !article.link.is_empty() {
                    println!("    {}", article.link);
                }
            }
        }
        Command::Import { file } => {
            // SEC-008: Canonicalize to resolve symlinks before reading
            let canonical = file
                .canonicalize()
                .with_context(|| format!("Failed to resolve import file: {}", file.display()))?;
            if !std::fs::metadata(&canonical)?.is_file() {
                anyhow::bail!("Import path must be a regular file");
            }
            let path_str = canonical
                .to_str()
                .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in OPML path"))?;
            let feeds = opml::parse_file(
                path_str,
                HostPolicy::from_allow_private(config.allow_private_hosts),
            )
            .await
            .context("Failed to parse OPML file")?;
            let summary = store.import_opml(&feeds);
            println!(
                "Imported {} feeds ({} already subscribed)",
                summary.added, summary.existing
            );
            save(&db, &store).await?;
        }
        Command::Export { file } => {
            opml::export_to_file(&store.lists(), &store.feeds(), &file)?;
            println!("Exported {} feeds to {}", store.feeds().len(), file.display());
        }
    }

    Ok(())
}

async fn open_database(path: &Path) -> Result<Database> {
    let path_str = path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    match Database::open(path_str).await {
        Ok(db) => Ok(db),
        Err(DatabaseError::InstanceLocked) => {
            eprintln!(
                "Error: Another feedmill process appears to be using {}. Please close it and try again.",
                path.display()
            );
            std::process::exit(1);
        }
        Err(e) => Err(anyhow::anyhow!("Failed to open database: {}", e)),
    }
}

/// Loads persisted state, then registers the lists and feeds named in the
/// config. Registration is idempotent, so this runs on every start.
async fn restore_store(db: &Database, config: &Config) -> Result<AggregationStore> {
    let snapshot = db
        .load_snapshot()
        .await
        .context("Failed to load stored feeds")?;
    let store = AggregationStore::from_snapshot(snapshot, Arc::new(SystemClock));

    for list in &config.lists {
        if let Err(e) = store.create_list(&list.name) {
            tracing::warn!(list = %list.name, error = %e, "Skipping configured list");
        }
    }
    for feed in &config.feeds {
        let list_id = match &feed.list {
            Some(name) => match store.list_by_name(name) {
                Some(id) => Some(id),
                None => Some(store.create_list(name)?),
            },
            None => None,
        };
        if let Err(e) = store.add_feed(&feed.url, feed.title.as_deref(), list_id) {
            tracing::warn!(url = %feed.url, error = %e, "Skipping configured feed");
        }
    }
    Ok(store)
}

fn resolve_list(store: &AggregationStore, name: &str) -> Result<ListId> {
    store
        .list_by_name(name)
        .ok_or_else(|| anyhow::anyhow!("No list named '{}'", name))
}

async fn run_refresh(engine: &Engine, list: Option<&str>) -> Result<RefreshReport> {
    let (progress_tx, mut progress_rx) = mpsc::channel::<(usize, usize)>(32);
    let printer = tokio::spawn(async move {
        while let Some((done, total)) = progress_rx.recv().await {
            eprint!("\rRefreshing {done}/{total}");
        }
        eprintln!();
    });

    let report = match list {
        Some(name) => {
            let list_id = resolve_list(engine.store(), name)?;
            engine.refresh_list(list_id, Some(progress_tx)).await?
        }
        None => engine.refresh_all(Some(progress_tx)).await,
    };
    // The sender is gone once the refresh returns, which ends the printer.
    let _ = printer.await;
    Ok(report)
}

fn print_report(store: &AggregationStore, report: &RefreshReport) {
    for feed_report in &report.feeds {
        let title = store
            .feed(feed_report.feed_id)
            .map(|f| f.display_title().to_string())
            .unwrap_or_else(|| feed_report.feed_id.to_string());
        match &feed_report.status {
            FeedStatus::Updated {
                new_articles,
                total,
            } => println!("ok    {title}: {new_articles} new, {total} total"),
            FeedStatus::Failed(error) => println!("fail  {title}: {}", error.message),
        }
    }
    println!(
        "{} new articles, {} feeds failed",
        report.new_articles(),
        report.failures().count()
    );
}

async fn save(db: &Database, store: &AggregationStore) -> Result<()> {
    db.save_snapshot(&store.snapshot())
        .await
        .context("Failed to save feeds")
}
