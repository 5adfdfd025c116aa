//! continuum binary entry point

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use continuum_updater::cli::{CheckArgs, Cli, Commands, InstallArgs};
use continuum_updater::{Installer, InstallerContext, InstallerSet, UpdateConfig, UpdateOrchestrator};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = if cli.config.exists() {
        UpdateConfig::load_from_file(&cli.config)
            .with_context(|| format!("failed to load {}", cli.config.display()))?
    } else {
        warn!("Config file {:?} not found, using defaults", cli.config);
        UpdateConfig::default()
    };

    let ctx = InstallerContext::from_config(&config)?;
    let installers = InstallerSet::standard(config.paths.root.clone());

    match cli.command {
        Commands::Check(args) => check(config, ctx, installers, args).await,
        Commands::Install(args) => install(ctx, installers, args).await,
    }
}

async fn check(
    config: UpdateConfig,
    ctx: InstallerContext,
    installers: InstallerSet,
    args: CheckArgs,
) -> Result<()> {
    let orchestrator = UpdateOrchestrator::new(config, ctx, installers);
    match orchestrator.run_check_cycle(args.force).await? {
        Some(report) => {
            info!(
                installed = report.installed(),
                up_to_date = report.up_to_date(),
                failed = report.failed(),
                "Check cycle finished"
            );
            if report.failed() > 0 {
                bail!("{} unit(s) failed to update", report.failed());
            }
        }
        None => info!("No update check due; pass --force to check anyway"),
    }
    Ok(())
}

async fn install(ctx: InstallerContext, installers: InstallerSet, args: InstallArgs) -> Result<()> {
    let installable = installers
        .get(args.kind)
        .with_context(|| format!("no installer for {}", args.kind))?;
    let mut installer = Installer::new(ctx, installable, &args.supplier, args.package)?;

    if let (Some(path), Some(version)) = (args.local, args.version) {
        installer.use_local_install_file(path, &version)?;
        installer.declare_local_metadata(args.merkle_root, args.signature);
    }
    if args.bypass_security {
        installer.bypass_security_and_just_install(true);
    }

    let report = installer.run_pipeline().await?;
    info!(
        package = %report.identity,
        version = %report.version,
        "Installed"
    );
    Ok(())
}
