use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use camus_core::field::FieldTable;
use camus_target::emit::{write_mcast_groups, CommandWriter, JsonWriter, PipelineWriter};

#[derive(Parser, Debug)]
#[command(
    name = "camus",
    about = "Compiles packet-classification queries into P4 table entries",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    /// Rule file to compile
    rules: PathBuf,

    /// Output path for the runtime command file
    #[arg(short = 'o', long, default_value = "commands.txt")]
    commands: PathBuf,

    /// Also write the JSON entry document here
    #[arg(long)]
    json: Option<PathBuf>,

    /// Also write the multicast group file here
    #[arg(long)]
    mcast: Option<PathBuf>,

    /// Field spec file overriding the built-in header catalog
    #[arg(long)]
    fields: Option<PathBuf>,

    /// Log level when RUST_LOG is not set
    #[arg(long, default_value = "warn")]
    log_level: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let text = fs::read_to_string(&cli.rules)
        .with_context(|| format!("cannot read {}", cli.rules.display()))?;
    let rules = camus_io::load_rules(&text)
        .with_context(|| format!("cannot compile {}", cli.rules.display()))?;

    let catalog = match &cli.fields {
        Some(path) => {
            let spec = fs::read_to_string(path)
                .with_context(|| format!("cannot read {}", path.display()))?;
            camus_io::load_field_spec(&spec)
                .with_context(|| format!("cannot parse {}", path.display()))?
        }
        None => FieldTable::default(),
    };

    let pipeline = camus_pipeline::compile(&rules, &catalog)?;
    let target = camus_target::lower(&pipeline, rules.default_action.as_ref())?;

    // Buffer everything before touching the filesystem so an error never
    // leaves partial output behind.
    let mut commands = Vec::new();
    CommandWriter::default().write_pipeline(&mut commands, &target)?;
    let mut json = Vec::new();
    if cli.json.is_some() {
        JsonWriter::default().write_pipeline(&mut json, &target)?;
    }
    let mut mcast = Vec::new();
    if cli.mcast.is_some() {
        write_mcast_groups(&mut mcast, &target)?;
    }

    fs::write(&cli.commands, &commands)
        .with_context(|| format!("cannot write {}", cli.commands.display()))?;
    if let Some(path) = &cli.json {
        fs::write(path, &json).with_context(|| format!("cannot write {}", path.display()))?;
    }
    if let Some(path) = &cli.mcast {
        fs::write(path, &mcast).with_context(|| format!("cannot write {}", path.display()))?;
    }

    info!(
        rules = rules.rules.len(),
        tables = target.tables.len(),
        entries = target.entry_count(),
        groups = target.groups.len(),
        "wrote {}",
        cli.commands.display()
    );
    Ok(())
}
