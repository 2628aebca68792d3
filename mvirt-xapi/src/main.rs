//! mvirt-xapi: drive a XenServer/XCP-ng pool from the command line.
//!
//! Loads a pool configuration, runs one operation through the pooled
//! session and logs the session out again on exit.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mvirt_xapi::{HttpTransportFactory, TaskOutcome, XapiConfig, XapiResource};

/// mvirt XAPI bridge
#[derive(Parser, Debug)]
#[command(name = "mvirt-xapi", version, about)]
struct Args {
    /// Pool configuration file (JSON)
    #[arg(short, long, default_value = "/etc/mvirt/xapi.json")]
    config: PathBuf,

    /// Override the member address to connect to
    #[arg(long)]
    address: Option<String>,

    /// Override the host UUID checked for liveness
    #[arg(long)]
    host_uuid: Option<String>,

    /// Append a candidate password (repeatable, newest last)
    #[arg(long = "password")]
    passwords: Vec<String>,

    /// Task poll interval in milliseconds
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Task timeout in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect and print the pool master
    Probe,
    /// Start a VM
    VmStart { vm_uuid: String },
    /// Shut a VM down
    VmShutdown {
        vm_uuid: String,
        /// Hard power-off instead of a clean shutdown
        #[arg(long)]
        force: bool,
    },
    /// Live-migrate a VM to another host of the pool
    VmMigrate { vm_uuid: String, host_uuid: String },
    /// Print a VM's power state
    VmPowerState { vm_uuid: String },
    /// Wait for an existing task and destroy it
    TaskWait { task_ref: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mvirt_xapi=info,reqwest=warn,hyper=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = XapiConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(address) = args.address {
        config.address = address;
    }
    if let Some(host_uuid) = args.host_uuid {
        config.host_uuid = host_uuid;
    }
    config.passwords.extend(args.passwords);
    if let Some(ms) = args.poll_interval_ms {
        config.poll_interval_ms = ms;
    }
    if let Some(secs) = args.timeout_secs {
        config.task_timeout_secs = secs;
        config.migrate_timeout_secs = secs;
    }

    let factory = Arc::new(HttpTransportFactory::new(config.accept_invalid_certs)?);
    let resource = XapiResource::new(config, factory)?;
    info!(
        pool_id = %resource.config().pool_id,
        address = %resource.config().address,
        "Starting mvirt-xapi"
    );

    let result = tokio::select! {
        result = run(&resource, args.command) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted");
            Err(anyhow::anyhow!("interrupted"))
        }
    };

    resource.shutdown().await;
    result
}

async fn run(resource: &XapiResource, command: Command) -> Result<()> {
    match command {
        Command::Probe => {
            let record = resource.pool_master().await?;
            println!("pool {} master {}", record.uuid, record.master_address);
        }
        Command::VmStart { vm_uuid } => {
            report(&vm_uuid, resource.start_vm(&vm_uuid).await?);
        }
        Command::VmShutdown { vm_uuid, force } => {
            let outcome = if force {
                resource.hard_shutdown_vm(&vm_uuid).await?
            } else {
                resource.clean_shutdown_vm(&vm_uuid).await?
            };
            report(&vm_uuid, outcome);
        }
        Command::VmMigrate { vm_uuid, host_uuid } => {
            report(&vm_uuid, resource.migrate_vm(&vm_uuid, &host_uuid).await?);
        }
        Command::VmPowerState { vm_uuid } => {
            println!("{}", resource.vm_power_state(&vm_uuid).await?);
        }
        Command::TaskWait { task_ref } => {
            let conn = resource.connection().await?;
            let runner = resource.runner();
            let outcome = runner
                .wait_for_task(
                    &conn,
                    &task_ref,
                    runner.poll_interval(),
                    runner.timeout(),
                )
                .await?;
            report(&task_ref, outcome);
        }
    }
    Ok(())
}

fn report(subject: &str, outcome: TaskOutcome) {
    match outcome {
        TaskOutcome::Completed { result: Some(result) } => println!("{subject}: done ({result})"),
        TaskOutcome::Completed { result: None } => println!("{subject}: done"),
        TaskOutcome::EndStateReached => println!("{subject}: done (task reaped)"),
    }
}
