use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use sambacfg::model::PermissionMethod;
use sambacfg::permissions::SharePermissions;
use sambacfg::{read_config_files, resolve};

/// Container configuration tool for Samba server instances
#[derive(Parser)]
#[command(author, version, about = "Resolve and apply Samba container configuration", long_about = None)]
struct Cli {
    /// Path to a config file; may be given more than once
    /// (can also be set via SAMBACFG_CONFIG, colon separated)
    #[arg(long = "config")]
    config: Vec<PathBuf>,

    /// Name of the instance to resolve
    /// (can also be set via SAMBA_CONTAINER_ID)
    #[arg(long)]
    identity: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the configuration, resolve the instance, and print the
    /// effective configuration as JSON
    PrintConfig,

    /// Load and resolve the configuration, reporting only success or failure
    Check,

    /// Apply each share's permission policy to its share root
    UpdatePerms,
}

fn config_paths(cli: &Cli) -> Result<Vec<PathBuf>> {
    if !cli.config.is_empty() {
        return Ok(cli.config.clone());
    }
    if let Ok(paths) = std::env::var("SAMBACFG_CONFIG") {
        return Ok(paths.split(':').map(PathBuf::from).collect());
    }
    bail!("no config files given; use --config or SAMBACFG_CONFIG");
}

fn identity(cli: &Cli) -> Option<String> {
    cli.identity
        .clone()
        .or_else(|| std::env::var("SAMBA_CONTAINER_ID").ok())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        "sambacfg=debug,info"
    } else {
        "sambacfg=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    let paths = config_paths(&cli)?;
    let doc = read_config_files(&paths).context("failed to load configuration")?;
    let identity = identity(&cli);
    let effective =
        resolve(&doc, identity.as_deref()).context("failed to resolve configuration")?;
    info!("resolved instance {:?}", effective.instance);

    match cli.command {
        Commands::PrintConfig => {
            println!("{}", serde_json::to_string_pretty(&effective)?);
        }
        Commands::Check => {
            info!("configuration ok");
        }
        Commands::UpdatePerms => {
            update_perms(&effective)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn update_perms(effective: &sambacfg::EffectiveConfig) -> Result<()> {
    use sambacfg::xattr_store::FsBackend;

    let backend = FsBackend::new();
    let mut failures = 0usize;
    for share in &effective.shares {
        if share.permissions.method == PermissionMethod::None {
            continue;
        }
        let Some(path) = share.path() else {
            info!("share {:?} has no path option, skipping", share.name);
            continue;
        };
        let perms = SharePermissions::new(&backend, path, &share.permissions);
        // one share's backend failure must not block the others
        match perms.apply() {
            Ok(outcome) => info!("share {:?}: {:?}", share.name, outcome),
            Err(err) => {
                error!("share {:?}: {}", share.name, err);
                failures += 1;
            }
        }
    }
    if failures > 0 {
        bail!("failed to update permissions for {failures} share(s)");
    }
    Ok(())
}

#[cfg(not(unix))]
fn update_perms(_effective: &sambacfg::EffectiveConfig) -> Result<()> {
    bail!("share permission management requires a unix host");
}
