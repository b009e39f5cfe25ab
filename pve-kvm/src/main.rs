use anyhow::Result;
use clap::Parser;
use pve_kvm::{
    config::ModuleParams,
    module::{self, ModuleFailure, ModuleOutcome},
};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "pve-kvm", version)]
#[command(about = "Create and migrate QEMU/KVM guests on a Proxmox VE cluster", long_about = None)]
struct Cli {
    /// Parameters file (JSON, or TOML when it ends in .toml). Reads JSON
    /// from stdin when omitted or `-`.
    params: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match run(&cli).await {
        Ok(outcome) => {
            info!(changed = outcome.changed, "{}", outcome.msg);
            print_json(&outcome);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{:#}", e);
            print_json(&ModuleFailure::from_error(&e));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli) -> Result<ModuleOutcome> {
    let mut params = ModuleParams::load(cli.params.as_deref())?;
    params
        .connection
        .apply_env_fallback(|var| std::env::var(var).ok());
    module::execute(params).await
}

fn print_json<T: serde::Serialize>(document: &T) {
    match serde_json::to_string(document) {
        Ok(json) => println!("{}", json),
        Err(e) => error!("Failed to serialize result: {}", e),
    }
}
