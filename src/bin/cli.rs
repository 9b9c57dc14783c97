//! Hotpatch CLI - Main entry point for CLI binary
//!
//! Build side: `snapshot`, `diff`, `inspect`. Runtime side: `update`, `status`.

use anyhow::{bail, Context, Result};
use clap::Parser;
use hotpatch_lib::engine::{
    cli::{
        formatter::{format_size, CliFormatter},
        Cli, Commands, OutputFormat,
    },
    config::{Config, CONFIG_FILE_NAME},
    coordinator::{Coordinator, Outcome, UpdateContext},
    diff::{self, BuildLayout},
    manifest::{read_version_marker, ManifestAccessor, VersionedManifest},
    updater::SandboxLayout,
};
use std::path::Path;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run_cli(cli) {
        CliFormatter::error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn run_cli(cli: Cli) -> Result<()> {
    let project_dir = cli.get_project_dir();
    let json_output = cli.format == OutputFormat::Json;

    match cli.command {
        Commands::Init { package, force } => cmd_init(&project_dir, &package, force, json_output),
        Commands::Snapshot { bundles } => cmd_snapshot(&project_dir, &bundles, json_output),
        Commands::Diff { version } => cmd_diff(&project_dir, version, json_output),
        Commands::Inspect { manifest } => cmd_inspect(&manifest, json_output),
        Commands::Update => cmd_update(&project_dir, json_output),
        Commands::Status => cmd_status(&project_dir, json_output),
    }
}

fn build_layout(project_dir: &Path, config: &Config) -> BuildLayout {
    BuildLayout::new(
        Config::resolve(project_dir, &config.build.output_root),
        Config::resolve(project_dir, &config.build.diff_root),
        config.package.name.clone(),
    )
}

fn cmd_init(project_dir: &Path, package: &str, force: bool, json: bool) -> Result<()> {
    let config_path = project_dir.join(CONFIG_FILE_NAME);
    if config_path.exists() && !force {
        bail!("Config already exists: {} (use --force to overwrite)", config_path.display());
    }

    std::fs::create_dir_all(project_dir)?;
    let config = Config::default_for_project(package);
    config.save(project_dir)?;

    if json {
        println!("{}", serde_json::json!({ "config": config_path, "package": package }));
    } else {
        CliFormatter::success(&format!("Wrote {}", config_path.display()));
        CliFormatter::kv("Package", package);
    }
    Ok(())
}

fn cmd_snapshot(project_dir: &Path, bundles: &Path, json: bool) -> Result<()> {
    let config = Config::load(project_dir)?;
    let layout = build_layout(project_dir, &config);
    let bundles_dir = Config::resolve(project_dir, bundles);
    if !bundles_dir.is_dir() {
        bail!("Bundle directory not found: {}", bundles_dir.display());
    }

    let marker = Config::resolve(project_dir, &config.build.version_file);
    let version = diff::next_build_version(&marker)?;
    let manifest = diff::snapshot_bundles(&layout, &bundles_dir, &version)
        .with_context(|| format!("snapshot of version {} failed", version))?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "version": version,
                "bundles": manifest.len(),
                "bytes": manifest.total_size(),
                "manifest": layout.manifest_path(&version),
            })
        );
    } else {
        CliFormatter::success(&format!("Recorded version {}", version));
        CliFormatter::kv("Bundles", &manifest.len().to_string());
        CliFormatter::kv("Size", &format_size(manifest.total_size()));
        CliFormatter::kv("Manifest", &layout.manifest_path(&version).display().to_string());
    }
    Ok(())
}

fn cmd_diff(project_dir: &Path, version: Option<String>, json: bool) -> Result<()> {
    let config = Config::load(project_dir)?;
    let layout = build_layout(project_dir, &config);

    let version = match version {
        Some(v) => v,
        None => {
            let marker = Config::resolve(project_dir, &config.build.version_file);
            read_version_marker(&marker)?
                .with_context(|| format!("No version recorded in {}", marker.display()))?
        }
    };

    let artifact = diff::build_patch(&layout, &version)?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "version": artifact.version,
                "dir": artifact.dir,
                "archive": artifact.archive_path,
                "files": artifact.files,
            })
        );
        return Ok(());
    }

    CliFormatter::header(&format!("Patch {}", artifact.version));
    CliFormatter::kv("Output", &artifact.dir.display().to_string());
    match &artifact.archive_path {
        Some(archive) => {
            CliFormatter::kv("Archive", &archive.display().to_string());
            for file in &artifact.files {
                CliFormatter::patch_file(file);
            }
        }
        None => CliFormatter::info("No bundles changed, no archive produced"),
    }
    Ok(())
}

fn cmd_inspect(path: &Path, json: bool) -> Result<()> {
    let manifest = VersionedManifest::load(path)
        .with_context(|| format!("Failed to read manifest {}", path.display()))?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "package": manifest.package(),
                "version": manifest.version(),
                "bundles": manifest.bundles(),
            })
        );
        return Ok(());
    }

    CliFormatter::header(&format!("{} v{}", manifest.package(), manifest.version()));
    for bundle in manifest.bundles() {
        CliFormatter::bundle(bundle);
    }
    CliFormatter::kv("Total", &format_size(manifest.total_size()));
    Ok(())
}

#[tokio::main]
async fn cmd_update(project_dir: &Path, json: bool) -> Result<()> {
    let config = Config::load(project_dir)?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let ctx = UpdateContext::from_config(&config, project_dir)?.with_events(tx);
    let (mut coordinator, _commands) = Coordinator::new(ctx);

    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if !json {
                CliFormatter::event(&event);
            } else if let Ok(line) = serde_json::to_string(&event) {
                println!("{}", line);
            }
        }
    });

    let outcome = coordinator.run().await;
    drop(coordinator);
    let _ = printer.await;

    match outcome {
        Outcome::Completed { .. } => Ok(()),
        Outcome::Failed { code, message } => bail!("update failed ({}): {}", code, message),
    }
}

fn cmd_status(project_dir: &Path, json: bool) -> Result<()> {
    let config = Config::load(project_dir)?;
    let builtin_root = Config::resolve(project_dir, &config.storage.builtin_root);
    let layout = match &config.storage.base_dir {
        Some(base) => SandboxLayout::with_base_dir(Config::resolve(project_dir, base), builtin_root),
        None => SandboxLayout::new(builtin_root)?,
    };

    let version = read_version_marker(&layout.version_marker_path())?;
    let device_id = match &config.endpoint.device_id {
        Some(id) => Some(id.clone()),
        None => layout.stored_device_id()?,
    };

    if json {
        println!(
            "{}",
            serde_json::json!({
                "package": config.package.name,
                "local_version": version,
                "sandbox": layout.sandbox_dir(),
                "device_id": device_id,
                "endpoint": config.endpoint.url,
            })
        );
    } else {
        CliFormatter::header("Hotpatch Status");
        CliFormatter::kv("Package", &config.package.name);
        CliFormatter::kv("Local version", version.as_deref().unwrap_or("(not bootstrapped)"));
        CliFormatter::kv("Sandbox", &layout.sandbox_dir().display().to_string());
        CliFormatter::kv("Device id", device_id.as_deref().unwrap_or("(not generated)"));
        if config.endpoint.url.is_empty() {
            CliFormatter::warning("No update endpoint configured");
        } else {
            CliFormatter::kv("Endpoint", &config.endpoint.url);
        }
    }
    Ok(())
}
