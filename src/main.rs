use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use loom_core::config::AppConfig;
use loom_engine::expr;
use loom_engine::GraphSpec;

#[derive(Parser)]
#[command(name = "loom", version, about = "Graph execution runtime for agent workflows")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "loom.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a graph file (JSON or TOML) and check every reference
    Validate {
        graph: PathBuf,
    },
    /// Evaluate a condition expression
    Eval {
        expression: String,
        /// JSON object providing the variables
        #[arg(long, default_value = "{}")]
        context: String,
        /// Read the context object from a file instead
        #[arg(long, conflicts_with = "context")]
        context_file: Option<PathBuf>,
    },
    /// Show the effective configuration
    Config,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("loom=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { graph } => validate(&graph),
        Commands::Eval {
            expression,
            context,
            context_file,
        } => {
            let raw = match context_file {
                Some(path) => std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                None => context,
            };
            eval(&expression, &raw)
        }
        Commands::Config => {
            let config = load_config(&cli.config)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        info!(path = %path.display(), "Loading config");
        Ok(AppConfig::load(path)?)
    } else {
        warn!(path = %path.display(), "Config file not found, using defaults");
        Ok(AppConfig::default())
    }
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let graph = GraphSpec::load(path).with_context(|| format!("invalid graph {}", path.display()))?;

    println!(
        "graph '{}': {} nodes, {} edges, entry '{}'",
        graph.id,
        graph.nodes.len(),
        graph.edges.len(),
        graph.entry_node
    );
    if !graph.terminal_nodes.is_empty() {
        let terminal: Vec<&str> = graph.terminal_nodes.iter().map(String::as_str).collect();
        println!("terminal: {}", terminal.join(", "));
    }
    for warning in graph.expression_warnings() {
        println!("warning: {}", warning);
    }
    Ok(())
}

fn eval(expression: &str, context: &str) -> anyhow::Result<()> {
    let vars: HashMap<String, serde_json::Value> =
        serde_json::from_str(context).context("context must be a JSON object")?;
    let value = expr::evaluate(expression, &vars)?;
    println!("{}", value.repr());
    Ok(())
}
