use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;

use pgobs::config::StoreConfig;
use pgobs::db::{
    self, BatchManager, ConnectionManager, ObsRecord, PoolDispatcher, SingleSessionWriter,
};
use pgobs::filter::{BigId, DataStreamFilter, FoiFilter, ObsFilter, SystemFilter};
use pgobs::query::tables::{DataStreamTable, FeatureTable, ObsTable, StoreTable};
use pgobs::query::{check_syntax, Entity, EntriesQuery, EntriesQueryBuilder, StatsScope};
use pgobs::StoreError;

/// Filter query compiler and batched writer for PostGIS observation stores
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Config file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the SQL a filter compiles to
    Compile {
        #[command(flatten)]
        query: QueryArgs,
        /// Remove instead of select
        #[arg(long)]
        remove: bool,
        /// Print the count query instead
        #[arg(long)]
        count: bool,
        /// Parse the generated SQL before printing it
        #[arg(long)]
        check: bool,
    },
    /// Count matching entries
    Count {
        #[command(flatten)]
        query: QueryArgs,
    },
    /// Delete matching entries
    Remove {
        #[command(flatten)]
        query: QueryArgs,
    },
    /// Insert observations from a JSON lines file
    Load {
        file: PathBuf,
        /// Go through the batch manager instead of the single-session writer
        #[arg(long)]
        batched: bool,
    },
    /// Observation statistics of one data stream or feature of interest
    Stats {
        #[arg(long, required_unless_present = "foi", conflicts_with = "foi")]
        datastream: Option<i64>,
        #[arg(long)]
        foi: Option<i64>,
        /// Observation filter as JSON
        #[arg(long)]
        filter: Option<String>,
        /// Histogram bin size in seconds
        #[arg(long)]
        bin_size: Option<u64>,
        /// Print the SQL instead of running it
        #[arg(long)]
        sql: bool,
    },
    /// Create missing store tables
    Init,
    /// Show row counts and feature extents of the store tables
    Info,
    /// Delete every entry of one store table
    Clear {
        #[arg(long, value_enum)]
        entity: EntityArg,
    },
    /// Drop one store table
    Drop {
        #[arg(long, value_enum)]
        entity: EntityArg,
    },
}

#[derive(Args)]
struct QueryArgs {
    #[arg(long, value_enum)]
    entity: EntityArg,
    /// Filter as JSON; unconstrained when omitted
    #[arg(long)]
    filter: Option<String>,
    #[arg(long)]
    limit: Option<u64>,
    /// Projected column, repeatable
    #[arg(long = "field")]
    fields: Vec<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum EntityArg {
    Obs,
    Datastream,
    Foi,
    System,
}

impl From<EntityArg> for Entity {
    fn from(arg: EntityArg) -> Self {
        match arg {
            EntityArg::Obs => Entity::Observation,
            EntityArg::Datastream => Entity::DataStream,
            EntityArg::Foi => Entity::Foi,
            EntityArg::System => Entity::System,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => StoreConfig::load_from(path)?,
        None => StoreConfig::load()?,
    };

    match cli.command {
        Command::Compile {
            query,
            remove,
            count,
            check,
        } => {
            let compiled = build_query(&config, &query, remove)?;
            let sql = if count {
                compiled.to_count_query()
            } else {
                compiled.to_query()
            };
            if check {
                check_syntax(&sql)?;
            }
            println!("{}", sql);
        }
        Command::Count { query } => {
            let compiled = build_query(&config, &query, false)?;
            let manager = open_pool(&mut config).await?;
            let client = manager.get().await?;
            let n = db::count_entries(&client, &compiled).await.map_err(report)?;
            println!("{}", n);
            manager.close();
        }
        Command::Remove { query } => {
            let compiled = build_query(&config, &query, true)?;
            let manager = open_pool(&mut config).await?;
            let client = manager.get().await?;
            let n = db::remove_entries(&client, &compiled).await.map_err(report)?;
            println!("{} entries removed", n);
            manager.close();
        }
        Command::Load { file, batched } => {
            let records = read_records(&file)?;
            let table = ObsTable::new(bound_table(&config, Entity::Observation)?);
            if batched {
                load_batched(&mut config, &table, &records).await?;
            } else {
                resolve_password(&mut config);
                let writer = SingleSessionWriter::connect(&config.connection).await?;
                let worker = writer.obs_worker(&table).await?;
                for record in &records {
                    worker.insert_obs(record).await.map_err(report)?;
                }
                println!("{} observations written", records.len());
            }
        }
        Command::Stats {
            datastream,
            foi,
            filter,
            bin_size,
            sql,
        } => {
            let scope = match (datastream, foi) {
                (Some(id), _) => StatsScope::DataStream(BigId::new(id)),
                (None, Some(id)) => StatsScope::Foi(BigId::new(id)),
                (None, None) => anyhow::bail!("either --datastream or --foi is required"),
            };
            let mut builder = EntriesQueryBuilder::stats(scope).with_bindings(config.tables.clone());
            if let Some(json) = &filter {
                builder = builder.with_obs_filter(parse_filter::<ObsFilter>(json)?);
            }
            let compiled = builder.build()?;
            if sql {
                println!("{}", compiled.to_summary_query()?);
                if let Some(bin) = bin_size {
                    println!("{}", compiled.to_histogram_query(bin)?);
                }
                return Ok(());
            }
            let manager = open_pool(&mut config).await?;
            let client = manager.get().await?;
            let stats = db::obs_stats(&client, &compiled, bin_size).await.map_err(report)?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            manager.close();
        }
        Command::Init => {
            let manager = open_pool(&mut config).await?;
            let client = manager.get().await?;
            for table in store_tables(&config) {
                let last = db::init_store(&client, table.as_ref()).await.map_err(report)?;
                println!("{} ({}): last id {}", table.name(), table.entity(), last);
            }
            manager.close();
        }
        Command::Info => {
            let manager = open_pool(&mut config).await?;
            let client = manager.get().await?;
            for table in store_tables(&config) {
                if !db::table_exists(&client, table.name()).await.map_err(report)? {
                    println!("{} ({}): missing", table.name(), table.entity());
                    continue;
                }
                let rows = db::table_size(&client, table.as_ref()).await.map_err(report)?;
                println!("{} ({}): {} entries", table.name(), table.entity(), rows);
            }
            for table in feature_tables(&config) {
                if db::table_exists(&client, table.name()).await.map_err(report)? {
                    let extent = db::feature_extent(&client, &table).await.map_err(report)?;
                    println!("{} extent: {}", table.name(), extent.as_deref().unwrap_or("empty"));
                }
            }
            manager.close();
        }
        Command::Clear { entity } => {
            let table = store_table(&config, entity.into())?;
            let manager = open_pool(&mut config).await?;
            let client = manager.get().await?;
            db::clear_store(&client, table.as_ref()).await.map_err(report)?;
            println!("{} cleared", table.name());
            manager.close();
        }
        Command::Drop { entity } => {
            let table = store_table(&config, entity.into())?;
            let manager = open_pool(&mut config).await?;
            let client = manager.get().await?;
            db::drop_store(&client, table.as_ref()).await.map_err(report)?;
            println!("{} dropped", table.name());
            manager.close();
        }
    }

    Ok(())
}

fn build_query(config: &StoreConfig, args: &QueryArgs, remove: bool) -> Result<EntriesQuery> {
    let entity = Entity::from(args.entity);
    let mut builder = if remove {
        EntriesQueryBuilder::remove(entity)
    } else {
        EntriesQueryBuilder::select(entity)
    }
    .with_bindings(config.tables.clone())
    .with_fields(args.fields.iter().cloned());

    if let Some(limit) = args.limit {
        builder = builder.with_limit(limit);
    }
    if let Some(json) = &args.filter {
        builder = match entity {
            Entity::Observation => {
                builder.with_obs_filter(parse_filter::<ObsFilter>(json)?)
            }
            Entity::DataStream => {
                builder.with_datastream_filter(parse_filter::<DataStreamFilter>(json)?)
            }
            Entity::Foi => builder.with_foi_filter(parse_filter::<FoiFilter>(json)?),
            Entity::System => builder.with_system_filter(parse_filter::<SystemFilter>(json)?),
        };
    }
    Ok(builder.build()?)
}

fn parse_filter<F: serde::de::DeserializeOwned>(json: &str) -> Result<F> {
    serde_json::from_str(json).context("Invalid filter JSON")
}

fn bound_table(config: &StoreConfig, entity: Entity) -> Result<String> {
    config
        .tables
        .get(entity)
        .map(String::from)
        .ok_or_else(|| StoreError::no_linked_store(entity.store_name()).into())
}

fn table_for(entity: Entity, name: &str) -> Box<dyn StoreTable> {
    match entity {
        Entity::Observation => Box::new(ObsTable::new(name)),
        Entity::DataStream => Box::new(DataStreamTable::new(name)),
        Entity::Foi => Box::new(FeatureTable::foi(name)),
        Entity::System => Box::new(FeatureTable::system(name)),
    }
}

fn store_table(config: &StoreConfig, entity: Entity) -> Result<Box<dyn StoreTable>> {
    Ok(table_for(entity, &bound_table(config, entity)?))
}

/// Every bound table, in creation order.
fn store_tables(config: &StoreConfig) -> Vec<Box<dyn StoreTable>> {
    [Entity::Observation, Entity::DataStream, Entity::Foi, Entity::System]
        .into_iter()
        .filter_map(|entity| config.tables.get(entity).map(|name| table_for(entity, name)))
        .collect()
}

fn feature_tables(config: &StoreConfig) -> Vec<FeatureTable> {
    let mut tables = Vec::new();
    if let Some(name) = config.tables.get(Entity::Foi) {
        tables.push(FeatureTable::foi(name));
    }
    if let Some(name) = config.tables.get(Entity::System) {
        tables.push(FeatureTable::system(name));
    }
    tables
}

fn read_records(path: &PathBuf) -> Result<Vec<ObsRecord>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut records = Vec::new();
    for (i, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid observation", path.display(), i + 1))?;
        records.push(record);
    }
    Ok(records)
}

async fn load_batched(config: &mut StoreConfig, table: &ObsTable, records: &[ObsRecord]) -> Result<()> {
    let manager = Arc::new(open_pool(config).await?);
    let batches = BatchManager::new(PoolDispatcher::new(Arc::clone(&manager)), config.batch);

    let mut total = db::BatchResult::default();
    for record in records {
        batches.enqueue(record.insert_statement(table));
        if let Some(result) = batches.try_commit().await.map_err(report)? {
            total.merge(result);
        }
    }
    total.merge(batches.flush().await.map_err(report)?);
    manager.close();

    println!(
        "{} observations: {} written, {} unknown, {} failed",
        total.len(),
        total.success,
        total.success_unknown,
        total.failed
    );
    Ok(())
}

async fn open_pool(config: &mut StoreConfig) -> Result<ConnectionManager> {
    resolve_password(config);
    let manager = ConnectionManager::open(config.connection.clone())
        .await
        .map_err(report)
        .with_context(|| format!("Failed to connect to {}", config.connection.display_string()))?;
    Ok(manager)
}

/// Password from PGPASSWORD, then an interactive prompt.
fn resolve_password(config: &mut StoreConfig) {
    let conn = &mut config.connection;
    if !conn.password.is_empty() {
        return;
    }
    if let Ok(pw) = std::env::var("PGPASSWORD") {
        conn.password = pw;
        return;
    }
    let prompt = format!("Password for {}: ", conn.display_string());
    match rpassword::read_password_from_tty(Some(&prompt)) {
        Ok(pw) => conn.password = pw,
        Err(e) => tracing::warn!(error = %e, "could not read password, connecting without one"),
    }
}

/// Keep the server's full diagnostics for execution errors.
fn report(err: StoreError) -> anyhow::Error {
    match err {
        StoreError::Execution(e) => anyhow::anyhow!(e.display_full()),
        other => other.into(),
    }
}
