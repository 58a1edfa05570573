mod config;
mod convert;
mod error;
mod import;
mod pipeline;
mod protocol;
mod remote;
mod utils;

use crate::config::Config;
use crate::import::request::ImportOptions;
use crate::pipeline::{run_pipeline, PipelineEvent, PipelineOutcome, PipelineRequest};
use crate::remote::discovery::Discovery;
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::Level;
use tracing_subscriber::{filter::EnvFilter, fmt::format::FmtSpan, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "ue-remote-import", version, about = "Convert 3D assets and import them into a running Unreal Editor")]
struct Cli {
    /// Print pipeline events as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert a GLB with Blender and import the result
    Import {
        file: PathBuf,
        /// Destination content folder
        #[arg(long, default_value = "/Game/Imports")]
        dest: String,
        /// Fraction of polygons to keep (0.0-1.0)
        #[arg(long, default_value_t = 1.0)]
        decimate: f32,
        #[arg(long)]
        no_materials: bool,
        /// Use complex collision as simple on every imported mesh
        #[arg(long)]
        complex_collision: bool,
        #[arg(long)]
        no_merge_meshes: bool,
        #[arg(long)]
        no_merge_children: bool,
        /// Keep the converted FBX in this folder
        #[arg(long)]
        fbx_dir: Option<PathBuf>,
        /// The input is already an FBX
        #[arg(long)]
        skip_convert: bool,
    },
    /// List editors answering on the discovery group
    Nodes {
        #[arg(long, default_value_t = 3000)]
        wait_ms: u64,
    },
}

fn setup_logging(log_level_str: &str) {
    let level = match log_level_str.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("ue_remote_import={}", level)));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_span_events(FmtSpan::CLOSE)
        .json()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

fn print_event(event: &PipelineEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::error!(error = %e, "Failed to serialize event"),
        }
        return;
    }
    match event {
        PipelineEvent::Status { message } => println!("{}", message),
        PipelineEvent::Progress { percent } => println!("[{:>3}%]", percent),
        PipelineEvent::Finished { outcome } => match outcome {
            PipelineOutcome::Success { message, .. } => println!("OK: {}", message),
            PipelineOutcome::Warning { message, import } => {
                println!("OK with warnings: {}", message);
                for warning in &import.warnings {
                    println!("  - {}", warning.message);
                }
            }
            PipelineOutcome::Error { kind, message } => println!("FAILED ({:?}): {}", kind, message),
        },
    }
}

async fn list_nodes(config: &Config, wait: Duration) -> Result<()> {
    let discovery = Discovery::start(config.discovery.clone(), uuid::Uuid::new_v4().to_string()).await;
    tokio::time::sleep(wait).await;
    let endpoints = discovery.list_endpoints();
    discovery.stop().await;

    if endpoints.is_empty() {
        println!("No editors found on {}:{}", config.discovery.multicast_group, config.discovery.multicast_port);
        return Ok(());
    }
    for endpoint in endpoints {
        println!(
            "{}  {}  {}  engine={}  root={}",
            endpoint.node_id,
            endpoint.display_name,
            endpoint.address,
            endpoint.info.engine_version,
            endpoint.info.project_root
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = Config::load()?;
    setup_logging(&config.log_level);

    tracing::info!(version = %env!("CARGO_PKG_VERSION"), "Starting ue-remote-import");
    tracing::debug!("Loaded configuration: {:?}", config);

    match cli.command {
        Command::Nodes { wait_ms } => {
            list_nodes(&config, Duration::from_millis(wait_ms)).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Import {
            file,
            dest,
            decimate,
            no_materials,
            complex_collision,
            no_merge_meshes,
            no_merge_children,
            fbx_dir,
            skip_convert,
        } => {
            let request = PipelineRequest {
                input: file,
                destination_folder: dest,
                decimate_ratio: decimate,
                merge_children: !no_merge_children,
                options: ImportOptions {
                    import_materials: !no_materials,
                    import_textures: !no_materials,
                    combine_meshes: !no_merge_meshes,
                    complex_as_simple: complex_collision,
                    ..ImportOptions::default()
                },
                fbx_dir,
                skip_convert,
            };

            let (tx, mut rx) = mpsc::channel(64);
            let json = cli.json;
            let printer = tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    print_event(&event, json);
                }
            });
            let outcome = run_pipeline(&config, request, tx).await;
            if let Err(e) = printer.await {
                tracing::warn!(error = %e, "Event printer ended abnormally");
            }

            tracing::info!(failed = outcome.is_error(), "Pipeline finished");
            Ok(if outcome.is_error() { ExitCode::FAILURE } else { ExitCode::SUCCESS })
        }
    }
}
