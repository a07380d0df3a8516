//! Command-line front end for the rebac authorization engine.
//!
//! Every command loads a schema file (and, where evaluation needs data, a
//! tuple file) into an in-memory engine, runs one operation and prints the
//! result as JSON.
//!
//! # Example Usage
//!
//! ```bash
//! rebac schema --schema docs.schema
//! rebac graph --schema docs.schema
//! rebac check --schema docs.schema --tuples docs.tuples user:alice view document:1
//! rebac lookup --schema docs.schema document view user:alice
//! rebac expand --schema docs.schema --tuples docs.tuples document:1 view --subjects
//! ```
//!
//! Tuple files hold one tuple per line (`document:1#viewer@group:eng#member`);
//! blank lines and `//` comments are skipped.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use rebac_engine::{
    AuthorizationEngine, CheckRequest, EngineConfig, ExpandRequest, InMemoryTupleRepository, LookupRequest,
    RebacError, Tuple, WriteRequest,
};
use serde_json::{json, Value};
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "rebac", version)]
#[command(about = "Evaluate relationship-based access control schemas")]
pub struct Cli {
    /// Engine configuration file (YAML or TOML)
    #[arg(short, long, global = true, env = "REBAC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON even on a terminal
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Schema and tuple files an evaluation runs against
#[derive(Args, Debug)]
pub struct Inputs {
    /// Schema file
    #[arg(short, long)]
    pub schema: PathBuf,

    /// Tuple file, one tuple per line
    #[arg(short, long)]
    pub tuples: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Compile a schema and print its definitions
    Schema {
        #[arg(short, long)]
        schema: PathBuf,
    },
    /// Print the schema dependency graph
    Graph {
        #[arg(short, long)]
        schema: PathBuf,
    },
    /// Check whether a subject holds an action on an entity
    Check {
        #[command(flatten)]
        inputs: Inputs,
        /// `user:alice` or `group:eng#member`
        subject: String,
        action: String,
        /// `document:1`
        entity: String,
        /// Override the configured recursion budget
        #[arg(long)]
        depth: Option<u32>,
    },
    /// Compile "which entities can this subject act on" into SQL
    Lookup {
        #[arg(short, long)]
        schema: PathBuf,
        entity_type: String,
        action: String,
        subject: String,
    },
    /// Expand a relation or permission into its subject tree
    Expand {
        #[command(flatten)]
        inputs: Inputs,
        entity: String,
        name: String,
        #[arg(long)]
        depth: Option<u32>,
        /// Print only the flattened, sorted list of direct subjects
        #[arg(long)]
        subjects: bool,
    },
}

/// Initialize logging on stderr so stdout carries only command output.
///
/// `RUST_LOG` overrides the default `rebac=info` filter.
pub fn init_tracing(verbose: bool, json_logs: bool) -> anyhow::Result<()> {
    let default_filter = if verbose { "rebac=debug" } else { "rebac=info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json_logs || !io::stderr().is_terminal() {
        registry
            .with(fmt::layer().with_target(false).with_ansi(false).with_writer(io::stderr).json())
            .try_init()?;
    } else {
        registry
            .with(fmt::layer().with_target(true).with_writer(io::stderr))
            .try_init()?;
    }
    Ok(())
}

/// Run one command and return the JSON it prints.
pub async fn run(cli: Cli) -> anyhow::Result<Value> {
    let config = EngineConfig::load(cli.config.as_deref())?;
    debug!(?config, "Loaded engine configuration");

    match cli.command {
        Command::Schema { schema } => {
            let (engine, version) = load_engine(config, &schema, None).await?;
            Ok(serde_json::to_value(&*engine.read_schema(&version)?)?)
        }
        Command::Graph { schema } => {
            let (engine, version) = load_engine(config, &schema, None).await?;
            Ok(serde_json::to_value(engine.read_schema_graph(&version)?)?)
        }
        Command::Check {
            inputs,
            subject,
            action,
            entity,
            depth,
        } => {
            let (engine, version) = load_engine(config, &inputs.schema, inputs.tuples.as_deref()).await?;
            let mut request = CheckRequest::new(subject.parse()?, &action, entity.parse()?).at_version(&version);
            if let Some(depth) = depth {
                request = request.with_depth(depth);
            }
            Ok(serde_json::to_value(engine.check(&request).await?)?)
        }
        Command::Lookup {
            schema,
            entity_type,
            action,
            subject,
        } => {
            let (engine, version) = load_engine(config, &schema, None).await?;
            let request = LookupRequest::new(&entity_type, &action, subject.parse()?).at_version(&version);
            Ok(serde_json::to_value(engine.lookup(&request).await?)?)
        }
        Command::Expand {
            inputs,
            entity,
            name,
            depth,
            subjects,
        } => {
            let (engine, version) = load_engine(config, &inputs.schema, inputs.tuples.as_deref()).await?;
            let request = ExpandRequest {
                entity: entity.parse()?,
                name,
                schema_version: version,
                depth,
            };
            if subjects {
                Ok(serde_json::to_value(engine.list_subjects(&request).await?)?)
            } else {
                Ok(serde_json::to_value(engine.expand(&request).await?)?)
            }
        }
    }
}

/// JSON body printed when a command fails
pub fn error_body(error: &anyhow::Error) -> Value {
    let code = error
        .downcast_ref::<RebacError>()
        .map_or("CLI_ERROR", RebacError::error_code);
    json!({ "error": code, "message": format!("{error:#}") })
}

async fn load_engine(
    config: EngineConfig,
    schema_path: &Path,
    tuples_path: Option<&Path>,
) -> anyhow::Result<(AuthorizationEngine, String)> {
    let engine = AuthorizationEngine::from_config(Arc::new(InMemoryTupleRepository::new()), config)?;

    let text = tokio::fs::read_to_string(schema_path)
        .await
        .with_context(|| format!("reading schema {}", schema_path.display()))?;
    let version = engine.write_schema(&text)?;
    info!(version = %version, path = %schema_path.display(), "Loaded schema");

    if let Some(path) = tuples_path {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading tuples {}", path.display()))?;
        let writes = parse_tuples(&text)?;
        let count = writes.len();
        engine
            .batch_write(
                WriteRequest {
                    writes,
                    deletes: Vec::new(),
                },
                &version,
            )
            .await?;
        info!(count, path = %path.display(), "Loaded tuples");
    }

    Ok((engine, version))
}

/// Parse a tuple file. Errors name the offending line.
pub fn parse_tuples(text: &str) -> anyhow::Result<Vec<Tuple>> {
    text.lines()
        .enumerate()
        .map(|(n, line)| (n + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with("//"))
        .map(|(n, line)| line.parse::<Tuple>().with_context(|| format!("line {n}")))
        .collect()
}
