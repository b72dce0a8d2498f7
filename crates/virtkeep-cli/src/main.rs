//! virtkeep command-line interface for backup runs and inventory inspection.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::error;
use rpassword::prompt_password;
use schemars::schema_for;
use serde_json::to_string_pretty;
use std::path::{Path, PathBuf};
use virtkeep_archive::SystemArchiveStore;
use virtkeep_core::{
    config::{VirtkeepConfig, DEFAULT_CONFIG_PATH},
    inventory::{DeviceClass, Inventory},
    logging, BackupOrchestrator,
};
use virtkeep_libvirt::SystemHypervisor;
use virtkeep_provider::hypervisor::DomainState;
use virtkeep_rbd::SystemPool;

/// Top-level command-line options shared by every subcommand.
#[derive(Parser, Debug)]
#[command(
    name = "virtkeep",
    version,
    about = "Live VM disk backups into a deduplicating archive store."
)]
struct Cli {
    /// Path to the virtkeep configuration file.
    #[arg(short, long, env = "VIRTKEEP_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Subcommands covering a backup deployment's lifecycle.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a backup pass over all guarded domains (or a single one).
    Run {
        /// Restrict the run to one named domain.
        domain: Option<String>,

        /// Prompt interactively for the archive passphrase.
        #[arg(long)]
        prompt_passphrase: bool,
    },

    /// Show guarded domains and how each block device is classified.
    List {
        /// Restrict the listing to one named domain.
        domain: Option<String>,
    },

    /// Adjust persisted virtkeep configuration defaults.
    Settings {
        /// Set the archive repository location.
        #[arg(long)]
        repository: Option<String>,

        /// Override the managed image root list (comma separated).
        #[arg(long = "image-root", value_delimiter = ',', num_args = 0..)]
        image_roots: Vec<String>,

        /// Restrict RBD devices to this pool (pass an empty value to clear).
        #[arg(long)]
        pool: Option<String>,
    },

    /// Validate a configuration file or emit the config schema.
    Validate {
        /// Path to the configuration file to validate.
        #[arg(short = 'f', long, default_value = DEFAULT_CONFIG_PATH)]
        file: PathBuf,

        /// Output the JSON schema instead of validating a file.
        #[arg(long)]
        schema: bool,
    },
}

fn main() {
    logging::init("info");
    let cli = Cli::parse();
    if let Err(err) = dispatch(cli) {
        error!("{err:#}");
        std::process::exit(1);
    }
}

fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Run {
            domain,
            prompt_passphrase,
        } => run_backup(&cli.config, domain.as_deref(), prompt_passphrase),
        Commands::List { domain } => list_inventory(&cli.config, domain.as_deref()),
        Commands::Settings {
            repository,
            image_roots,
            pool,
        } => update_settings(&cli.config, repository, image_roots, pool),
        Commands::Validate { file, schema } => validate(&file, schema),
    }
}

fn load_cli_config(path: &Path) -> Result<VirtkeepConfig> {
    let config = VirtkeepConfig::load_or_bootstrap(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;

    if config.path != path {
        println!(
            "Using bootstrap configuration at {} (override --config or VIRTKEEP_CONFIG to replace).",
            config.path.display()
        );
    }

    Ok(config)
}

fn run_backup(path: &Path, domain: Option<&str>, prompt_passphrase: bool) -> Result<()> {
    let config = load_cli_config(path)?;

    let hypervisor =
        SystemHypervisor::from_config(&config).context("initialise hypervisor provider")?;
    let pool = SystemPool::from_config(&config).context("initialise pool provider")?;
    let mut store =
        SystemArchiveStore::from_config(&config).context("initialise archive store")?;
    if prompt_passphrase {
        let secret = prompt_password("Archive passphrase: ").context("read archive passphrase")?;
        store = store.with_passphrase(secret);
    }

    let orchestrator = BackupOrchestrator::new(&config, &hypervisor, &pool, &store);
    let summary = orchestrator.run(domain)?;

    println!(
        "Backed up {} devices across {} domains ({} skipped, {} archive entries).",
        summary.devices,
        summary.domains,
        summary.skipped,
        summary.entries.len()
    );
    Ok(())
}

fn list_inventory(path: &Path, domain: Option<&str>) -> Result<()> {
    let config = load_cli_config(path)?;
    let hypervisor =
        SystemHypervisor::from_config(&config).context("initialise hypervisor provider")?;
    let inventory = Inventory::new(&config, &hypervisor);

    let domains = inventory.list_domains(domain)?;
    if domains.is_empty() {
        println!("No matching domains.");
        return Ok(());
    }

    for record in &domains {
        let state = match record.state {
            DomainState::Running => "running",
            DomainState::Stopped => "stopped",
        };
        println!("{} ({state})", record.name);
        for (device, class) in inventory.devices(&record.name)? {
            let verdict = match class {
                DeviceClass::Backup => "backup".to_string(),
                DeviceClass::Skip(reason) => format!("skip: {reason}"),
            };
            println!(
                "  {:<8} {:<48} {verdict}",
                device.target,
                device.locator.describe()
            );
        }
    }
    Ok(())
}

fn update_settings(
    path: &Path,
    repository: Option<String>,
    image_roots: Vec<String>,
    pool: Option<String>,
) -> Result<()> {
    let mut config = load_cli_config(path)?;
    let mut changed = false;

    if let Some(repository) = repository {
        config.archive.repository = repository;
        changed = true;
    }
    if !image_roots.is_empty() {
        config.source.image_roots = image_roots;
        changed = true;
    }
    if let Some(pool) = pool {
        config.source.pool = if pool.is_empty() { None } else { Some(pool) };
        changed = true;
    }

    if !changed {
        bail!("no settings provided; nothing to change");
    }

    for issue in config.validate() {
        println!("warning: {issue}");
    }
    config.save().context("persist configuration")?;
    println!("Updated {}.", config.path.display());
    Ok(())
}

fn validate(file: &Path, schema: bool) -> Result<()> {
    if schema {
        let schema = schema_for!(VirtkeepConfig);
        println!("{}", to_string_pretty(&schema)?);
        return Ok(());
    }

    let config = VirtkeepConfig::load(file)
        .with_context(|| format!("failed to load configuration from {}", file.display()))?;
    let issues = config.validate();
    if issues.is_empty() {
        println!("Configuration at {} looks good.", file.display());
        return Ok(());
    }

    for issue in &issues {
        println!("- {issue}");
    }
    bail!("{} issue(s) found in {}", issues.len(), file.display());
}
