//! Ferry - remote shell relay and file drop

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use ferry::config::Settings;
use ferry::protocol::Credentials;

#[derive(Parser)]
#[command(name = "ferry")]
#[command(about = "Browser SSH relay with chunked file transfer, plus a LAN file server", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to config.json in the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the websocket relay between browser terminals and SSH hosts
    Relay {
        #[arg(long)]
        bind: Option<IpAddr>,
        #[arg(short, long)]
        port: Option<u16>,
        /// Directory with the browser client, served at /
        #[arg(long)]
        client_dir: Option<PathBuf>,
        #[arg(long)]
        log_file: Option<PathBuf>,
    },
    /// Serve an uploads directory over HTTP
    Local {
        #[arg(long)]
        bind: Option<IpAddr>,
        #[arg(short, long)]
        port: Option<u16>,
        /// Uploads directory
        #[arg(long)]
        root: Option<PathBuf>,
        #[arg(long)]
        log_file: Option<PathBuf>,
    },
    /// Upload a local file to an SSH host through a relay
    Push {
        #[command(flatten)]
        remote: RemoteArgs,
        /// Local file to upload
        local_path: PathBuf,
        /// Remote file name (defaults to the local file name)
        remote_path: Option<String>,
    },
    /// Download a file from an SSH host through a relay
    Pull {
        #[command(flatten)]
        remote: RemoteArgs,
        /// Remote file path
        remote_path: String,
        /// Local destination (defaults to the remote file name)
        local_path: Option<PathBuf>,
    },
}

#[derive(Args)]
struct RemoteArgs {
    /// Relay websocket URL
    #[arg(long, default_value = "ws://127.0.0.1:669/ws")]
    url: String,
    /// SSH host
    #[arg(long)]
    host: String,
    #[arg(long, default_value_t = 22)]
    ssh_port: u16,
    #[arg(short, long, default_value = "root")]
    user: String,
    #[arg(long, env = "FERRY_SSH_PASSWORD", hide_env_values = true)]
    password: String,
}

impl RemoteArgs {
    fn credentials(&self) -> Credentials {
        Credentials {
            host: self.host.clone(),
            port: self.ssh_port,
            username: self.user.clone(),
            password: self.password.clone(),
        }
    }
}

fn load_settings(path: Option<&PathBuf>) -> Result<Settings> {
    match path {
        Some(path) => Settings::load_from_path(path),
        None => Settings::load(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = load_settings(cli.config.as_ref())?;

    match cli.command {
        Commands::Relay { bind, port, client_dir, log_file } => {
            if let Some(bind) = bind {
                settings.relay.bind = bind;
            }
            if let Some(port) = port {
                settings.relay.port = port;
            }
            if client_dir.is_some() {
                settings.relay.client_dir = client_dir;
            }
            if log_file.is_some() {
                settings.log_file = log_file;
            }

            let _guard = ferry::logging::init_server_logging(settings.log_file_path()?, "Relay")?;
            ferry::relay::run_relay_server(settings.relay).await?;
        }
        Commands::Local { bind, port, root, log_file } => {
            if let Some(bind) = bind {
                settings.local.bind = bind;
            }
            if let Some(port) = port {
                settings.local.port = port;
            }
            if let Some(root) = root {
                settings.local.root = root;
            }
            if log_file.is_some() {
                settings.log_file = log_file;
            }

            let _guard = ferry::logging::init_server_logging(settings.log_file_path()?, "File Server")?;
            ferry::local::run_local_server(settings.local).await?;
        }
        Commands::Push { remote, local_path, remote_path } => {
            ferry::logging::init_console_logging();
            let remote_name = match remote_path {
                Some(name) => name,
                None => local_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .with_context(|| format!("{} has no file name", local_path.display()))?,
            };
            ferry::client::push_file(&remote.url, remote.credentials(), &local_path, &remote_name).await?;
        }
        Commands::Pull { remote, remote_path, local_path } => {
            ferry::logging::init_console_logging();
            let local_path = match local_path {
                Some(path) => path,
                None => {
                    let name = remote_path.trim_end_matches('/').rsplit('/').next().unwrap_or_default();
                    if name.is_empty() || name == "~" {
                        anyhow::bail!("Cannot derive a local file name from {}", remote_path);
                    }
                    PathBuf::from(name)
                }
            };
            ferry::client::pull_file(&remote.url, remote.credentials(), &remote_path, &local_path).await?;
        }
    }

    Ok(())
}
