use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use idmp_core::cleanup::{drop_types, purge};
use idmp_core::config::{
    data_dir_from_env_value, default_page_size_from_env_value, max_tree_depth_from_env_value,
};
use idmp_core::definitions::{folder_for, search_clause};
use idmp_core::migration::{
    install_pipeline, seed_pipeline, standard_pipeline, validate_pipeline, RunReport,
    StepContext, StepReport,
};
use idmp_core::{
    CoreConfig, FhirMapper, NewResource, Query, ResourceStore, SchemaChange, SchemaDocument,
};
use idmp_types::{Location, ResourceKey};
use idmp_uuid::ResourceId;

#[derive(Parser)]
#[command(name = "idmp")]
#[command(about = "IDMP resource registry CLI")]
struct Cli {
    /// Data directory (overrides IDMP_DATA_DIR); in-memory when neither is set
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install base and support types, rebuild artifacts and validate
    Install,
    /// Run the full pipeline, legacy data migration included
    Migrate,
    /// Upsert resource types from a YAML file
    InstallSchema {
        #[arg(long)]
        file: PathBuf,
    },
    /// Validate schemas and every stored instance
    Validate,
    /// Create the demo legacy products and substance
    SeedDemo,
    /// List registered resource types
    ListTypes,
    /// Print one resource type as YAML
    ShowType { name: String },
    /// Create a resource from a FHIR JSON document
    Create {
        resource_type: String,
        #[arg(long)]
        key: String,
        /// Parent folder (default: the type's folder, e.g. /IDMP/Substances)
        #[arg(long)]
        parent: Option<String>,
        #[arg(long)]
        file: PathBuf,
        /// Store as a draft
        #[arg(long)]
        draft: bool,
    },
    /// Print a resource as FHIR JSON
    Get { id: String },
    /// Search a resource type
    Search {
        resource_type: String,
        /// Search parameter as name=value; repeatable
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
        #[arg(long)]
        count: Option<usize>,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Delete a resource
    Delete { id: String },
    /// Delete every instance of the given types
    Cleanup {
        #[arg(long, value_delimiter = ',', required = true)]
        types: Vec<String>,
        /// Also remove the resource types
        #[arg(long)]
        drop_schema: bool,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let data_dir = cli
        .data_dir
        .or_else(|| data_dir_from_env_value(std::env::var("IDMP_DATA_DIR").ok()));
    let cfg = Arc::new(CoreConfig::new(
        data_dir,
        max_tree_depth_from_env_value(std::env::var("IDMP_MAX_TREE_DEPTH").ok())?,
        default_page_size_from_env_value(std::env::var("IDMP_DEFAULT_COUNT").ok())?,
    )?);
    let store = ResourceStore::from_config(cfg.clone())?;
    let ctx = StepContext::new(&store);

    match cli.command {
        Commands::Install => finish(install_pipeline().run(&ctx))?,
        Commands::Migrate => finish(standard_pipeline().run(&ctx))?,
        Commands::Validate => finish(validate_pipeline().run(&ctx))?,
        Commands::SeedDemo => finish(seed_pipeline().run(&ctx))?,
        Commands::InstallSchema { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            for document in SchemaDocument::parse(&raw)? {
                let upsert = document.apply(store.registry())?;
                let change = match upsert.change {
                    SchemaChange::Created => "created",
                    SchemaChange::Updated => "updated",
                    SchemaChange::Unchanged => "unchanged",
                };
                println!("{}: {}", upsert.resource_type.name, change);
            }
            store.registry().resolve()?;
        }
        Commands::ListTypes => {
            let types = store.registry().list_all()?;
            if types.is_empty() {
                println!("No resource types registered.");
            }
            for resource_type in types {
                println!(
                    "{} ({}), {} fields, {} instances",
                    resource_type.name,
                    resource_type.group,
                    resource_type.fields.len(),
                    store.count(&resource_type.name)?
                );
            }
        }
        Commands::ShowType { name } => {
            let resource_type = store.registry().get(&name)?;
            print!("{}", serde_yaml::to_string(&resource_type)?);
        }
        Commands::Create {
            resource_type,
            key,
            parent,
            file,
            draft,
        } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let document: serde_json::Value = serde_json::from_str(&raw)?;
            if document.get("resourceType").and_then(|t| t.as_str()) != Some(&resource_type) {
                bail!("{} does not hold a {resource_type} document", file.display());
            }
            let fields = mapper(&store, &cfg).from_document(&document)?;
            let parent = match parent {
                Some(path) => Location::new(path)?,
                None => folder_for(&resource_type)?,
            };
            let mut new = NewResource::new(resource_type, parent, ResourceKey::new(key)?)
                .with_fields(fields);
            if draft {
                new = new.draft();
            }
            let created = store.create(new)?;
            println!("Created {} at {}", created.id, created.path());
        }
        Commands::Get { id } => {
            let instance = store.get_by_id(&ResourceId::parse(&id)?)?;
            let document = mapper(&store, &cfg).to_document(&instance)?;
            println!("{}", serde_json::to_string_pretty(&document)?);
        }
        Commands::Search {
            resource_type,
            params,
            count,
            offset,
        } => {
            let mut query = Query::new();
            for (name, value) in &params {
                query = query.and(search_clause(&resource_type, name, value));
            }
            let count = count
                .unwrap_or(cfg.default_page_size())
                .min(cfg.max_page_size());
            let page = store.query(&resource_type, &query.page(count, offset))?;
            println!("{} match(es)", page.total);
            for instance in page.items {
                println!("{}  {}", instance.id, instance.path());
            }
        }
        Commands::Delete { id } => {
            let deleted = store.delete(&ResourceId::parse(&id)?)?;
            println!("Deleted {}", deleted.path());
        }
        Commands::Cleanup { types, drop_schema } => {
            let types: Vec<&str> = types.iter().map(String::as_str).collect();
            let report = if drop_schema {
                drop_types(&store, &types)?
            } else {
                purge(&store, &types)?
            };
            print_step(&report);
            if !report.is_success() {
                bail!("cleanup incomplete");
            }
        }
    }

    Ok(())
}

fn mapper<'a>(store: &'a ResourceStore, cfg: &CoreConfig) -> FhirMapper<'a> {
    FhirMapper::new(store.registry()).with_max_tree_depth(cfg.max_tree_depth())
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_owned(), value.to_owned()))
        }
        _ => Err(format!("expected name=value, got '{raw}'")),
    }
}

/// Print the run and fail the process when it aborted.
fn finish(report: RunReport) -> anyhow::Result<()> {
    for step in &report.steps {
        println!("{} [{:?}]", step.name, step.state);
        if let Some(step_report) = &step.report {
            print_step(step_report);
        }
    }
    match &report.failure {
        Some(failure) => bail!("{failure}"),
        None => {
            println!(
                "Done: {} created, {} schema change(s)",
                report.created(),
                report.schema_changes()
            );
            Ok(())
        }
    }
}

fn print_step(report: &StepReport) {
    println!(
        "  created {}, updated {}, unchanged {}, deleted {}",
        report.created, report.updated, report.unchanged, report.deleted
    );
    for outcome in report.failures() {
        println!("  {outcome}");
    }
}
