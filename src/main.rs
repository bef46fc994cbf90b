//! Dagfile CLI - validate and inspect workflow definitions

use clap::{Parser, Subcommand};
use colored::Colorize;

use dagfile::{BuildOpts, LoadError};

#[derive(Parser)]
#[command(name = "dagfile")]
#[command(about = "Compile and validate declarative YAML workflow DAGs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a workflow file and report errors and warnings
    Validate {
        /// Path to the workflow YAML file
        file: String,

        /// Base configuration overlaid under every document
        #[arg(short, long)]
        base: Option<String>,

        /// Parameter overrides, e.g. "TARGET=prod first"
        #[arg(short, long)]
        params: Option<String>,

        /// Keep raw ${...} and backtick forms instead of expanding
        #[arg(long)]
        no_eval: bool,
    },

    /// Build a workflow file and print the compiled DAG as JSON
    Dump {
        /// Path to the workflow YAML file
        file: String,

        /// Base configuration overlaid under every document
        #[arg(short, long)]
        base: Option<String>,

        /// Parameter overrides, e.g. "TARGET=prod first"
        #[arg(short, long)]
        params: Option<String>,

        /// Keep raw ${...} and backtick forms instead of expanding
        #[arg(long)]
        no_eval: bool,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Validate {
            file,
            base,
            params,
            no_eval,
        } => validate(&file, build_opts(base, params, no_eval)),
        Commands::Dump {
            file,
            base,
            params,
            no_eval,
        } => dump(&file, build_opts(base, params, no_eval)),
    };

    if let Err(e) = result {
        report(&e);
        std::process::exit(1);
    }
}

fn build_opts(base: Option<String>, params: Option<String>, no_eval: bool) -> BuildOpts {
    let mut opts = BuildOpts::new();
    if let Some(base) = base {
        opts = opts.base_config(base);
    }
    if let Some(params) = params {
        opts = opts.params(params);
    }
    if no_eval {
        opts = opts.without_eval();
    }
    opts
}

fn validate(file: &str, opts: BuildOpts) -> Result<(), LoadError> {
    let dag = dagfile::load(file, opts)?;
    for warning in &dag.build_warnings {
        println!("{} {}", "warning:".yellow().bold(), warning);
    }
    println!(
        "{} {} ({} steps, {} local DAGs)",
        "valid:".green().bold(),
        dag.name,
        dag.steps.len(),
        dag.local_dags.len()
    );
    Ok(())
}

fn dump(file: &str, opts: BuildOpts) -> Result<(), LoadError> {
    let dag = dagfile::load(file, opts)?;
    match serde_json::to_string_pretty(&dag) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            std::process::exit(1);
        }
    }
    Ok(())
}

fn report(error: &LoadError) {
    match error.build_errors() {
        Some(list) => {
            for entry in list.iter() {
                eprintln!("{} {}", "error:".red().bold(), entry);
            }
        }
        None => eprintln!("{} {}", "error:".red().bold(), error),
    }
}
