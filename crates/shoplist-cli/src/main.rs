//! `shoplist` - manage a shopping list from the command line.
//!
//! Configuration comes from `--config <file>` (TOML, or JSON by extension)
//! or from the `COUCHBASE_*` / `SHOPLIST_*` environment variables. Results are
//! printed as JSON on stdout; logs go to stderr.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use shoplist_store::{
    seed_sample_items, BoughtFilter, ConfigError, Item, ItemStore, PaginationQuery, SortOrder,
    StoreConfig, StoreError,
};

#[derive(Parser)]
#[command(name = "shoplist", about = "Shopping-list item store", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a TOML or JSON config file (defaults to environment variables)
    #[arg(long, global = true, env = "SHOPLIST_CONFIG")]
    config: Option<PathBuf>,

    /// Override the connection string (e.g. sqlite://list.db, couchbase://host)
    #[arg(long, global = true)]
    connection: Option<String>,

    /// Show info-level logs (RUST_LOG takes precedence)
    #[arg(long, short = 'v', global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision the database and load the sample list
    Init,

    /// Check the health of the services behind the bucket
    Ping,

    /// List one page of items
    List {
        /// View: all, to-buy or bought
        #[arg(long, default_value = "all", value_parser = parse_view)]
        view: BoughtFilter,

        /// Index of the first item
        #[arg(long, default_value_t = 0)]
        start: u64,

        /// Index past the last item (0 = no limit)
        #[arg(long, default_value_t = 0)]
        end: u64,

        /// Field to sort by
        #[arg(long)]
        sort: Option<String>,

        /// asc or desc
        #[arg(long, default_value = "asc")]
        order: SortOrder,

        /// Free-text search over the indexed text fields
        #[arg(long)]
        search: Option<String>,

        /// Put bought items after unbought ones (default: on for the all view)
        #[arg(long)]
        bought_last: Option<bool>,
    },

    /// Show one item
    Get {
        key: String,

        /// View: all, to-buy or bought
        #[arg(long, default_value = "all", value_parser = parse_view)]
        view: BoughtFilter,
    },

    /// Add a new item
    Add {
        title: String,

        #[command(flatten)]
        fields: ItemFields,
    },

    /// Change fields of an existing item
    Edit {
        key: String,

        /// New title
        #[arg(long)]
        title: Option<String>,

        #[command(flatten)]
        fields: ItemFields,
    },

    /// Mark an item as bought
    Buy { key: String },

    /// Put a bought item back on the list
    Restore { key: String },

    /// Flip an item's bought flag
    Toggle { key: String },

    /// Delete an item
    Delete { key: String },
}

#[derive(Args)]
struct ItemFields {
    #[arg(long)]
    amount: Option<f64>,

    #[arg(long)]
    unit: Option<String>,

    #[arg(long)]
    shop: Option<String>,

    #[arg(long)]
    description: Option<String>,

    /// When the item is needed (RFC 3339)
    #[arg(long)]
    when: Option<DateTime<Utc>>,
}

impl ItemFields {
    fn apply(self, item: &mut Item) {
        if let Some(amount) = self.amount {
            item.amount = amount;
        }
        if let Some(unit) = self.unit {
            item.unit = unit;
        }
        if let Some(shop) = self.shop {
            item.shop = shop;
        }
        if let Some(description) = self.description {
            item.description = Some(description);
        }
        if let Some(when) = self.when {
            item.when = Some(when);
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("encoding output: {0}")]
    Output(#[from] serde_json::Error),
}

fn parse_view(label: &str) -> Result<BoughtFilter, String> {
    BoughtFilter::from_label(label)
        .ok_or_else(|| format!("unknown view {:?} (expected all, to-buy or bought)", label))
}

fn init_logging(verbose: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            "info".into()
        } else {
            "warn".into()
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>, connection: Option<String>) -> Result<StoreConfig, CliError> {
    let mut config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path).map_err(|source| CliError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            if path.extension().is_some_and(|ext| ext == "json") {
                StoreConfig::from_json(&text)?
            } else {
                StoreConfig::from_toml(&text)?
            }
        }
        None => StoreConfig::from_env()?,
    };
    if let Some(connection) = connection {
        config.connection.connection_string = connection;
    }
    config.validate()?;
    Ok(config)
}

fn print(value: &impl serde::Serialize) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config = load_config(cli.config.as_deref(), cli.connection)?;
    tracing::info!("Using {:?}", config.connection);

    // Health checks look at the cluster as it is and never provision.
    let store = if matches!(cli.command, Commands::Ping) {
        ItemStore::connect_existing(&config.without_collection()).await?
    } else {
        ItemStore::connect(&config).await?
    };
    match cli.command {
        Commands::Ping => println!("{}", store.ping().await?),
        Commands::Init => {
            let seeded = seed_sample_items(&store).await?;
            print(&json!({ "seeded": seeded.len() }))?;
        }
        Commands::List {
            view,
            start,
            end,
            sort,
            order,
            search,
            bought_last,
        } => {
            let bought_last = bought_last.unwrap_or(view == BoughtFilter::Unfiltered);
            let mut query = PaginationQuery::new().window(start, end).bought_last(bought_last);
            if let Some(sort) = sort {
                query = query.sort_by(sort, order);
            }
            if let Some(search) = search {
                query = query.search(search);
            }
            let (items, total) = store.view(view).get_items(&query).await?;
            print(&json!({ "items": items, "total": total }))?;
        }
        Commands::Get { key, view } => {
            let item = store.view(view).get_item(&key).await?;
            print(&item)?;
        }
        Commands::Add { title, fields } => {
            let mut item = Item::new(title, 1.0, "pc");
            fields.apply(&mut item);
            print(&store.upsert_item("", item).await?)?;
        }
        Commands::Edit { key, title, fields } => {
            let mut item = match store.get_item(&key).await? {
                Some(existing) => existing.item,
                None => return Err(StoreError::NotFound { op: "edit", key }.into()),
            };
            if let Some(title) = title {
                item.title = title;
            }
            fields.apply(&mut item);
            print(&store.upsert_item(&key, item).await?)?;
        }
        Commands::Buy { key } => {
            store.buy_item(&key, Some(true)).await?;
            print(&store.get_item(&key).await?)?;
        }
        Commands::Restore { key } => {
            store.buy_item(&key, Some(false)).await?;
            print(&store.get_item(&key).await?)?;
        }
        Commands::Toggle { key } => {
            store.buy_item(&key, None).await?;
            print(&store.get_item(&key).await?)?;
        }
        Commands::Delete { key } => {
            store.delete_item(&key).await?;
            print(&json!({ "deleted": key }))?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
