//! etl-sync CLI - load delimited or GeoJSON records into relational storage
//!
//! Reconciles every source record against stored data, creating and updating
//! only what changed.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use tracing_subscriber::EnvFilter;

use etl_sync::schema::inspector;
use etl_sync::{reader, LoadConfig, LoadSummary, Loader, MemoryStore, Schema, SchemaError, SourceItem, Storage};

#[derive(Parser)]
#[command(name = "etl-sync")]
#[command(version, about = "Load records into relational storage with idempotent upserts", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a source file
    Load {
        /// Load configuration (YAML)
        #[arg(short, long, default_value = "etl.yaml")]
        config: PathBuf,

        /// Source file (delimited text or GeoJSON, per the configuration)
        file: PathBuf,

        /// Entity type to load into - overrides config file
        #[arg(short, long)]
        entity: Option<String>,

        /// Persistence criterion field (repeatable) - overrides config file
        #[arg(short, long)]
        persistence: Vec<String>,

        /// Never create top-level records
        #[arg(long)]
        no_create: bool,

        /// Never update top-level records
        #[arg(long)]
        no_update: bool,

        /// Reconcile into an in-memory store instead of the database
        #[arg(long)]
        dry_run: bool,
    },

    /// Validate a schema file and print the load order
    Validate {
        #[arg(short, long, default_value = "schema.yaml")]
        schema: PathBuf,
    },

    /// Show how an entity type is identified
    Inspect {
        #[arg(short, long, default_value = "schema.yaml")]
        schema: PathBuf,

        #[arg(short, long)]
        entity: String,
    },
}

fn main() {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Load {
            config,
            file,
            entity,
            persistence,
            no_create,
            no_update,
            dry_run,
        } => load(LoadArgs {
            config,
            file,
            entity,
            persistence,
            no_create,
            no_update,
            dry_run,
        }),
        Commands::Validate { schema } => validate_schema(schema),
        Commands::Inspect { schema, entity } => inspect_entity(schema, entity),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

struct LoadArgs {
    config: PathBuf,
    file: PathBuf,
    entity: Option<String>,
    persistence: Vec<String>,
    no_create: bool,
    no_update: bool,
    dry_run: bool,
}

/// Load a source file as configured, with command-line overrides
fn load(args: LoadArgs) -> Result<(), String> {
    let mut config = LoadConfig::load_from_file(&args.config).map_err(|e| format!("Failed to load config: {}", e))?;
    config.apply_env().map_err(|e| e.to_string())?;

    if let Some(entity) = args.entity {
        config.entity = entity;
    }
    if !args.persistence.is_empty() {
        config.engine.persistence = Some(args.persistence);
    }
    if args.no_create {
        config.engine.create = false;
    }
    if args.no_update {
        config.engine.update = false;
    }

    let schema = Schema::load_from_file(&config.schema).map_err(|e| format!("Failed to load schema: {}", e))?;
    let source = reader::open(&args.file, &config.reader).map_err(|e| e.to_string())?;

    println!("Loading {} into {}...", args.file.display(), config.entity);

    let summary = if args.dry_run {
        let mut store = MemoryStore::new();
        run(&schema, &mut store, &config, source, &args.file)?
    } else {
        load_into_database(&schema, &config, source, &args.file)?
    };

    println!("  ✓ {} records processed", summary.processed);
    println!("  ✓ {} created", summary.created);
    println!("  ✓ {} updated", summary.updated);
    println!("  ✓ {} unchanged", summary.exists);
    if summary.rejected > 0 {
        println!("  ✗ {} rejected (see log file)", summary.rejected);
    }
    Ok(())
}

fn run<S: Storage + ?Sized>(
    schema: &Schema,
    store: &mut S,
    config: &LoadConfig,
    source: impl Iterator<Item = SourceItem>,
    file: &Path,
) -> Result<LoadSummary, String> {
    Loader::from_config(schema, store, config)
        .map_err(|e| e.to_string())?
        .load(source, Some(file))
        .map_err(|e| e.to_string())
}

#[cfg(feature = "postgres")]
fn load_into_database(
    schema: &Schema,
    config: &LoadConfig,
    source: impl Iterator<Item = SourceItem>,
    file: &Path,
) -> Result<LoadSummary, String> {
    let database = etl_sync::diesel_runtime::Database::from_config(&config.database).map_err(|e| e.to_string())?;
    let mut store = database.store().map_err(|e| e.to_string())?;
    run(schema, &mut store, config, source, file)
}

#[cfg(not(feature = "postgres"))]
fn load_into_database(
    _schema: &Schema,
    _config: &LoadConfig,
    _source: impl Iterator<Item = SourceItem>,
    _file: &Path,
) -> Result<LoadSummary, String> {
    Err("built without the postgres feature; use --dry-run".to_string())
}

/// Validate a schema file and print the order entity types load in
fn validate_schema(path: PathBuf) -> Result<(), String> {
    println!("Validating {}...", path.display());

    let schema = Schema::load_from_file(&path).map_err(|e| format!("Failed to load schema: {}", e))?;
    println!("  ✓ {} entity types validated", schema.len());

    match schema.load_order() {
        Ok(order) => {
            println!("  ✓ Load order:");
            for (i, name) in order.iter().enumerate() {
                println!("      {}. {}", i + 1, name);
            }
        }
        // The reconciler resolves cycles itself; report them without failing.
        Err(SchemaError::ReferenceCycle(names)) => {
            println!("  ! Reference cycle between: {}", names.join(", "));
        }
        Err(e) => return Err(e.to_string()),
    }
    Ok(())
}

/// Print the fields and identity fields of one entity type
fn inspect_entity(path: PathBuf, entity: String) -> Result<(), String> {
    let schema = Schema::load_from_file(&path).map_err(|e| format!("Failed to load schema: {}", e))?;
    let descriptor = schema.descriptor(&entity).map_err(|e| e.to_string())?;

    println!("{} (table {})", descriptor.name, descriptor.table_name());
    println!("Fields:");
    for field in inspector::fields(descriptor) {
        let mut flags = Vec::new();
        if field.unique {
            flags.push("unique".to_string());
        }
        if field.nullable {
            flags.push("nullable".to_string());
        }
        if let Some(max_length) = field.max_length {
            flags.push(format!("max_length={}", max_length));
        }
        if let Some(target) = field.kind.target() {
            flags.push(format!("-> {}", target));
        }
        println!("  {:<24} {:<10} {}", field.name, field.kind.name(), flags.join(", "));
    }

    println!("Unique fields: {}", inspector::unique_fields(descriptor).join(", "));
    match inspector::unambiguous_identity_fields(descriptor) {
        Ok(fields) => println!("Identity fields: {}", fields.join(", ")),
        Err(e) => println!("Identity fields: none ({})", e),
    }
    if let Some(hash) = &descriptor.hash_field {
        println!("Content hash field: {}", hash);
    }
    Ok(())
}
