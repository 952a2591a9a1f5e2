use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "rentline")]
#[command(about = "Rentline messaging gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config file.
    Init {
        /// Config file path (default: RENTLINE_CONFIG_PATH or ~/.rentline/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Run the gateway (webhook ingress and session endpoints).
    Serve {
        /// Config file path (default: RENTLINE_CONFIG_PATH or ~/.rentline/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// HTTP port (default from config or 8787)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Query a tenant's session status from a running gateway.
    Status {
        /// Config file path (default: RENTLINE_CONFIG_PATH or ~/.rentline/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Tenant id
        #[arg(long, short, value_name = "ID")]
        tenant: String,
    },

    /// Start (or re-check) pairing for a tenant on a running gateway.
    Connect {
        /// Config file path (default: RENTLINE_CONFIG_PATH or ~/.rentline/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Tenant id
        #[arg(long, short, value_name = "ID")]
        tenant: String,
    },

    /// Disconnect a tenant's session on a running gateway.
    Disconnect {
        /// Config file path (default: RENTLINE_CONFIG_PATH or ~/.rentline/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Tenant id
        #[arg(long, short, value_name = "ID")]
        tenant: String,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("rentline {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Serve { config, port }) => {
            if let Err(e) = run_serve(config, port).await {
                log::error!("gateway failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Status { config, tenant }) => {
            if let Err(e) = session_call(config, &tenant, SessionAction::Status).await {
                log::error!("status failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Connect { config, tenant }) => {
            if let Err(e) = session_call(config, &tenant, SessionAction::Connect).await {
                log::error!("connect failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Disconnect { config, tenant }) => {
            if let Err(e) = session_call(config, &tenant, SessionAction::Disconnect).await {
                log::error!("disconnect failed: {}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(lib::config::default_config_path);
    let _dir = lib::init::init_config_dir(&path)?;
    println!(
        "initialized configuration at {}",
        path.parent()
            .unwrap_or(std::path::Path::new("."))
            .display()
    );
    Ok(())
}

async fn run_serve(
    config_path: Option<std::path::PathBuf>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(lib::config::default_config_path);
    lib::init::require_initialized(&path)?;
    let (mut config, _path) = lib::config::load_config(Some(path))?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    log::info!(
        "starting gateway on {}:{}",
        config.gateway.bind,
        config.gateway.port
    );
    lib::gateway::run_gateway(config).await
}

enum SessionAction {
    Status,
    Connect,
    Disconnect,
}

/// Hit the session endpoint of a locally running gateway and print the JSON body.
async fn session_call(
    config_path: Option<std::path::PathBuf>,
    tenant: &str,
    action: SessionAction,
) -> anyhow::Result<()> {
    let (config, _) = lib::config::load_config(config_path)?;
    let url = format!(
        "http://{}:{}/session",
        config.gateway.bind.trim(),
        config.gateway.port
    );
    let client = reqwest::Client::new();
    let req = match action {
        SessionAction::Status => client.get(&url),
        SessionAction::Connect => client.post(&url),
        SessionAction::Disconnect => client.delete(&url),
    };
    let res = req.query(&[("tenantId", tenant)]).send().await?;
    let status = res.status();
    let body: serde_json::Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    if !status.is_success() {
        anyhow::bail!("gateway returned {}", status);
    }
    Ok(())
}
