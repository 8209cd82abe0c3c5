use clap::{Parser, Subcommand, ValueEnum};
use docmap::backend::SqliteBackend;
use docmap::{manage, transform};
use docmap::{Config, OrderBy, Predicate, QueryOptions, Record, Schema, Session};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

/// docmap CLI: inspect and provision a docmap document store
#[derive(Parser)]
#[command(name = "docmap", version, about)]
struct Cli {
    /// Path to the SQLite store file
    #[arg(long, default_value = "docmap.db")]
    db: PathBuf,

    /// Path to the schema YAML file
    #[arg(long, default_value = "schema.yaml")]
    schema: PathBuf,

    /// Path to a YAML configuration file (default: DOCMAP_* environment variables)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured database name
    #[arg(long)]
    database: Option<String>,

    /// Output format
    #[arg(long, default_value = "yaml")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Create the configured database if it does not exist
    CheckDb,

    /// Create missing collections and indexes declared by the schema
    Sync,

    /// Get a single record by ID
    Get {
        /// Record type name
        record_type: String,
        /// Record ID
        id: String,
    },

    /// List records of a type
    List {
        /// Record type name
        record_type: String,
        /// Field equality filters (e.g. --filter username=alice)
        #[arg(long = "filter", value_parser = parse_key_value)]
        filters: Vec<(String, String)>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        offset: Option<usize>,
        /// Field to order by; prefix with '-' for descending
        #[arg(long, allow_hyphen_values = true)]
        order_by: Option<String>,
    },

    /// Delete a record (and its cascades)
    Delete {
        /// Record type name
        record_type: String,
        /// Record ID
        id: String,
    },

    /// Print every change to a record type until interrupted
    Watch {
        /// Record type name
        record_type: String,
        /// Field equality filters (e.g. --filter status=published)
        #[arg(long = "filter", value_parser = parse_key_value)]
        filters: Vec<(String, String)>,
    },
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let pos = s.find('=').ok_or_else(|| {
        format!("Invalid key=value pair: no '=' found in '{s}'")
    })?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("ERROR:{e}");
        process::exit(1);
    }
}

fn load_config(cli: &Cli) -> docmap::Result<Config> {
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::from_env()?,
    };
    Ok(match &cli.database {
        Some(name) => config.with_database(name.clone()),
        None => config,
    })
}

fn load_schema(path: &Path) -> docmap::Result<Arc<Schema>> {
    Ok(Arc::new(Schema::load(path)?))
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&cli)?;
    docmap::config::set_global(config.clone())?;
    let backend = SqliteBackend::open(&cli.db)?;
    log::debug!("Using database '{}' in {}", config.database, cli.db.display());

    match &cli.command {
        Command::CheckDb => {
            let created = manage::check_db(&backend, &config)?;
            print_output(
                &serde_json::json!({ "database": config.database, "created": created }),
                &cli.format,
            )?;
        }

        Command::Sync => {
            let schema = load_schema(&cli.schema)?;
            let created = manage::sync_schema(&backend, &config, &schema)?;
            print_output(&serde_json::json!({ "created": created }), &cli.format)?;
        }

        Command::Get { record_type, id } => {
            let session = Session::open(load_schema(&cli.schema)?, Arc::new(backend), config)?;
            let value = match session.get(record_type, id)? {
                Some(record) => record_to_value(&record)?,
                None => serde_json::Value::Null,
            };
            print_output(&value, &cli.format)?;
        }

        Command::List {
            record_type,
            filters,
            limit,
            offset,
            order_by,
        } => {
            let session = Session::open(load_schema(&cli.schema)?, Arc::new(backend), config)?;
            let mut options = QueryOptions::new();
            options.limit = *limit;
            options.offset = *offset;
            options.order_by = order_by.as_deref().map(|field| match field.strip_prefix('-') {
                Some(field) => OrderBy::desc(field),
                None => OrderBy::asc(field),
            });

            let records = session.filter(record_type, filters_to_predicate(filters), &options)?;
            let values = records
                .iter()
                .map(record_to_value)
                .collect::<docmap::Result<Vec<_>>>()?;
            print_output(&serde_json::Value::Array(values), &cli.format)?;
        }

        Command::Delete { record_type, id } => {
            let mut session = Session::open(load_schema(&cli.schema)?, Arc::new(backend), config)?;
            let deleted = session.delete_id(record_type, id)?;
            print_output(&serde_json::json!({ "ok": true, "deleted": deleted, "id": id }), &cli.format)?;
        }

        Command::Watch { record_type, filters } => {
            let session = Session::open(load_schema(&cli.schema)?, Arc::new(backend), config)?;
            let predicate = if filters.is_empty() {
                None
            } else {
                Some(filters_to_predicate(filters))
            };
            let subscription = session.subscribe(record_type, predicate)?;
            log::info!("Watching {record_type} changes in {}", cli.db.display());
            for change in subscription {
                let change = change?;
                let previous = change.previous.as_ref().map(record_to_value).transpose()?;
                let current = change.current.as_ref().map(record_to_value).transpose()?;
                print_output(
                    &serde_json::json!({ "previous": previous, "current": current }),
                    &cli.format,
                )?;
            }
        }
    }

    Ok(())
}

fn filters_to_predicate(filters: &[(String, String)]) -> Predicate {
    let mut map = serde_json::Map::new();
    for (key, val) in filters {
        // Try to parse as JSON value (for numbers, booleans, arrays, objects)
        let json_val = serde_json::from_str(val).unwrap_or(serde_json::Value::String(val.clone()));
        map.insert(key.clone(), json_val);
    }
    Predicate::Match(map)
}

fn record_to_value(record: &Record) -> docmap::Result<serde_json::Value> {
    Ok(serde_json::Value::Object(transform::to_document(record)?))
}

fn print_output(
    value: &serde_json::Value,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
        OutputFormat::Yaml => {
            print!("{}", serde_yaml::to_string(value)?);
        }
    }
    Ok(())
}
