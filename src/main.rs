//! spdkctrl - start SPDK and talk to its JSON-RPC socket.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use spdkctrl::app::{AppOptions, LogOutput, SpdkApp};
use spdkctrl::ipc::Client;
use spdkctrl::logging::{init_logging, DEFAULT_FILTER};
use spdkctrl::rpc::bdev::GetBdevsArgs;
use spdkctrl::rpc::lvol::GetLvstoresArgs;
use spdkctrl::rpc::nbd::GetDisksArgs;
use spdkctrl::rpc::vhost::{BackendSpecific, GetControllersArgs};

/// Supervisor and JSON-RPC client for SPDK.
#[derive(Parser)]
#[command(name = "spdkctrl", version, about, long_about = None)]
struct Cli {
    /// SPDK control socket.
    #[arg(short, long, env = "SPDK_APP_SOCKET", default_value = "/var/tmp/spdk.sock")]
    socket: PathBuf,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Per-call timeout in seconds; 0 waits forever.
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start SPDK and keep it running until Ctrl-C.
    Run {
        /// SPDK executable.
        #[arg(long, env = "SPDK_APP_BINARY")]
        spdk_app: PathBuf,

        /// Directory for vhost controller sockets.
        #[arg(long, env = "SPDK_VHOST_SOCKET_PATH")]
        vhost_sock_path: Option<PathBuf>,

        /// Run SPDK directly instead of through `sudo --non-interactive`.
        #[arg(long)]
        no_sudo: bool,

        /// Seconds to wait after SIGTERM before killing SPDK.
        #[arg(long, default_value_t = 10)]
        stop_timeout: u64,

        /// Extra arguments passed to SPDK.
        #[arg(last = true)]
        args: Vec<OsString>,
    },

    /// Invoke any method with optional JSON params.
    Call {
        method: String,

        /// Params as a JSON value, e.g. '{"name":"Malloc0"}'.
        params: Option<String>,
    },

    /// List block devices.
    Bdevs {
        /// Only this bdev.
        name: Option<String>,
    },

    /// List logical volume stores.
    Lvstores {
        /// Only the store with this name.
        #[arg(long)]
        lvs_name: Option<String>,
    },

    /// List exported nbd devices.
    NbdDisks,

    /// List vhost controllers.
    VhostControllers {
        /// Only this controller.
        name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => DEFAULT_FILTER,
        1 => "spdkctrl=debug,spdk=info",
        _ => "spdkctrl=trace,spdk=debug",
    };
    init_logging(filter);

    let timeout = (cli.timeout > 0).then(|| Duration::from_secs(cli.timeout));

    match cli.command {
        Commands::Run {
            spdk_app,
            vhost_sock_path,
            no_sudo,
            stop_timeout,
            args,
        } => {
            let mut options = AppOptions::from_env()
                .with_spdk_app(spdk_app)
                .with_app_socket(&cli.socket)
                .with_log_output(LogOutput::Tracing)
                .with_stop_timeout(Duration::from_secs(stop_timeout))
                .with_extra_args(args);
            if let Some(dir) = vhost_sock_path {
                options = options.with_vhost_sock_path(dir);
            }
            if no_sudo {
                options = options.with_privilege_helper(None);
            }
            cmd_run(options).await?
        }
        command => {
            let client = connect(&cli.socket, timeout).await?;
            let result = cmd_query(&client, command).await;
            client.close().await?;
            result?
        }
    }

    Ok(())
}

async fn cmd_run(options: AppOptions) -> Result<()> {
    let app = SpdkApp::run(options).await.context("Failed to start SPDK")?;
    info!(
        pid = app.pid(),
        socket = %app.socket_path().display(),
        "SPDK running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    let forced = app.terminate().await.context("Failed to stop SPDK")?;
    if forced {
        eprintln!("SPDK did not stop in time and was killed");
    }
    Ok(())
}

async fn connect(socket: &Path, timeout: Option<Duration>) -> Result<Client> {
    let client = Client::connect_with_retry(socket, 3)
        .await
        .with_context(|| format!("Failed to connect to {}", socket.display()))?;
    Ok(client.with_timeout(timeout))
}

async fn cmd_query(client: &Client, command: Commands) -> Result<()> {
    match command {
        Commands::Call { method, params } => {
            let params: Option<serde_json::Value> = params
                .map(|text| serde_json::from_str(&text))
                .transpose()
                .context("params must be valid JSON")?;
            let result: serde_json::Value = client.invoke(&method, params.as_ref()).await?;
            print_json(&result)
        }
        Commands::Bdevs { name } => {
            print_json(&client.bdev_get_bdevs(&GetBdevsArgs { name }).await?)
        }
        Commands::Lvstores { lvs_name } => {
            let args = GetLvstoresArgs {
                uuid: None,
                lvs_name,
            };
            print_json(&client.bdev_lvol_get_lvstores(&args).await?)
        }
        Commands::NbdDisks => print_json(&client.nbd_get_disks(&GetDisksArgs::default()).await?),
        Commands::VhostControllers { name } => {
            let controllers = client
                .vhost_get_controllers(&GetControllersArgs { name })
                .await?;
            for controller in controllers {
                println!(
                    "{} cpumask={} iops_threshold={}",
                    controller.ctrlr, controller.cpumask, controller.iops_threshold
                );
                for (kind, backend) in &controller.backend_specific {
                    println!("  {}", describe_backend(kind, backend));
                }
            }
            Ok(())
        }
        Commands::Run { .. } => anyhow::bail!("run does not query a running SPDK"),
    }
}

fn describe_backend(kind: &str, backend: &BackendSpecific) -> String {
    match backend {
        BackendSpecific::Block(blk) => {
            format!("block bdev={} readonly={}", blk.bdev, blk.readonly)
        }
        BackendSpecific::Scsi(targets) => {
            let luns: Vec<String> = targets
                .iter()
                .flat_map(|target| {
                    target
                        .luns
                        .iter()
                        .map(move |lun| format!("{}:{}={}", target.id, lun.id, lun.bdev_name))
                })
                .collect();
            format!("scsi targets={} luns=[{}]", targets.len(), luns.join(", "))
        }
        BackendSpecific::Nvme(namespaces) => {
            let nss: Vec<String> = namespaces
                .iter()
                .map(|ns| format!("{}={}", ns.nsid, ns.bdev))
                .collect();
            format!("nvme namespaces=[{}]", nss.join(", "))
        }
        BackendSpecific::Other(value) => format!("{kind} {value}"),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
