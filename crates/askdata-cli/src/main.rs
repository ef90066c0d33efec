//! askdata - ask natural-language questions about a spreadsheet
//!
//! Loads a data file into an in-memory DuckDB table, has OpenAI translate
//! each question into a SELECT statement, checks it with the safety gate,
//! and prints the result.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use askdata_duck::{LoadOptions, SchemaDescription, Table};
use askdata_gate::SafetyGate;
use clap::{Parser, Subcommand};
use tracing::info;

mod config;
mod llm;
mod logging;
mod render;
mod session;

use config::Config;
use llm::ChatTranslator;
use session::Session;

#[derive(Parser)]
#[command(name = "askdata", version)]
#[command(about = "Ask natural-language questions about a spreadsheet")]
struct Cli {
    /// YAML config file (default: ./askdata.yaml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start an interactive question session
    Run {
        /// Path to a .csv, .tsv, .txt, .parquet or .xlsx file
        data_file: PathBuf,

        /// OpenAI model (overrides config)
        #[arg(long)]
        model: Option<String>,
    },
    /// Print the inferred schema and exit
    Schema {
        data_file: PathBuf,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let mut config = Config::load_or_default(cli.config.as_deref())
        .context("failed to load configuration")?;

    logging::init(&config.logging);

    match cli.command {
        Command::Run { data_file, model } => {
            if let Some(model) = model {
                config.llm.model = model;
            }
            run(&config, &data_file).await
        }
        Command::Schema { data_file, json } => print_schema(&config, &data_file, json),
    }
}

fn load(config: &Config, data_file: &Path) -> Result<(Table, SchemaDescription)> {
    let options = LoadOptions {
        memory_limit_mb: config.engine.memory_limit_mb,
        threads: config.engine.threads,
    };
    let table = Table::load(data_file, &options)?;
    let schema = SchemaDescription::infer(&table, config.schema.sample_size)?;
    Ok((table, schema))
}

async fn run(config: &Config, data_file: &Path) -> Result<()> {
    let api_key = Config::openai_api_key().context("set OPENAI_API_KEY (e.g. in .env)")?;

    let (table, schema) = load(config, data_file)?;

    let translator = ChatTranslator::openai(api_key, &config.llm, config.schema.prompt_samples);
    info!(model = translator.model(), "using OpenAI model");

    let gate = SafetyGate::new().with_blocked_keywords(&config.gate.extra_blocked_keywords);
    let session = Session::new(
        &table,
        &schema,
        translator,
        gate,
        config.display.max_rows,
        config.schema.prompt_samples,
    );

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let asked = session.run(stdin.lock(), &mut stdout).await?;

    info!(questions = asked, "session finished");
    Ok(())
}

fn print_schema(config: &Config, data_file: &Path, json: bool) -> Result<()> {
    let (_table, schema) = load(config, data_file)?;

    let mut stdout = io::stdout();
    if json {
        serde_json::to_writer_pretty(&mut stdout, &schema)?;
        writeln!(stdout)?;
    } else {
        writeln!(stdout, "{}", schema.to_prompt(config.schema.prompt_samples))?;
    }
    Ok(())
}
