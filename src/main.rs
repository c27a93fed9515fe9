//! Sealgate - UDP secure-session proxy

use std::path::PathBuf;

use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use sealgate::app::stats_api;
use sealgate::config::{parse_host_port, BackendConfig, Config, PskConfig};
use sealgate::error::{Error, Result};
use sealgate::{PlainEngine, Proxy};

fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        print_version();
        return Ok(());
    }

    if args.gen_config {
        println!("{}", Config::default_server().to_json_pretty()?);
        return Ok(());
    }

    // Load configuration
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default_server(),
    };
    apply_overrides(&mut config, &args)?;
    config.validate()?;

    // Initialize logging
    let log_level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .or_else(|| config.log.level.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Config(format!("Failed to set tracing subscriber: {}", e)))?;

    if args.config.is_none() {
        info!("No config file specified, using built-in defaults");
    }
    info!("Sealgate v{} starting...", env!("CARGO_PKG_VERSION"));

    let api_listen = args
        .api_listen
        .clone()
        .or_else(|| config.api.as_ref().map(|api| api.listen.clone()));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(serve(config, api_listen))?;

    info!("Goodbye!");
    Ok(())
}

async fn serve(config: Config, api_listen: Option<String>) -> Result<()> {
    let mut credentials = config.credentials()?.into_iter();
    let initial = credentials
        .next()
        .ok_or_else(|| Error::Config("At least one PSK credential is required".into()))?;

    let mut proxy: Proxy<PlainEngine> = Proxy::init(&config.proxy_options(), initial)?;
    for credential in credentials {
        proxy.add_credential(credential);
    }
    let identities: Vec<String> = proxy
        .credentials()
        .identities()
        .map(|identity| String::from_utf8_lossy(identity).into_owned())
        .collect();
    info!("PSK identities: {}", identities.join(", "));

    let shutdown = proxy.shutdown_handle();

    if let Some(listen) = api_listen {
        match listen.parse() {
            Ok(addr) => {
                tokio::spawn(stats_api::start_api_server(addr, shutdown.clone()));
            }
            Err(e) => warn!("Invalid API listen address {}: {}", listen, e),
        }
    }

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupt received, shutting down"),
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
        signal_shutdown.stop();
    });

    let result = proxy.run().await;
    proxy.deinit();
    result
}

/// Apply command-line overrides on top of the loaded configuration
fn apply_overrides(config: &mut Config, args: &Args) -> Result<()> {
    if let Some(listen) = &args.listen {
        let (host, port) = parse_host_port(listen)?;
        config.listen.host = host;
        config.listen.port = port;
    }

    if let Some(backend) = &args.backend {
        let (host, port) = parse_host_port(backend)?;
        config.backend = Some(BackendConfig { host, port });
    }

    if !args.psks.is_empty() {
        config.credentials = args
            .psks
            .iter()
            .map(|psk| {
                psk.split_once(':')
                    .map(|(identity, key)| PskConfig {
                        identity: identity.to_string(),
                        key: key.to_string(),
                    })
                    .ok_or_else(|| {
                        Error::Config(format!("Invalid --psk (want IDENTITY:KEY): {}", psk))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
    }

    Ok(())
}

/// Command line arguments
struct Args {
    config: Option<PathBuf>,
    listen: Option<String>,
    backend: Option<String>,
    psks: Vec<String>,
    gen_config: bool,
    version: bool,
    api_listen: Option<String>,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut config = None;
        let mut listen = None;
        let mut backend = None;
        let mut psks = Vec::new();
        let mut gen_config = false;
        let mut version = false;
        let mut api_listen = None;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "-c" | "--config" => {
                    if i + 1 < args.len() {
                        config = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "-l" | "--listen" => {
                    if i + 1 < args.len() {
                        listen = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "-b" | "--backend" => {
                    if i + 1 < args.len() {
                        backend = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "--psk" => {
                    if i + 1 < args.len() {
                        psks.push(args[i + 1].clone());
                        i += 1;
                    }
                }
                "--api" => {
                    if i + 1 < args.len() {
                        api_listen = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "--gen-config" => gen_config = true,
                "-v" | "--version" => version = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                arg if !arg.starts_with('-') && config.is_none() => {
                    // Positional argument: treat as config file
                    config = Some(PathBuf::from(arg));
                }
                other => eprintln!("Ignoring unknown argument: {}", other),
            }
            i += 1;
        }

        Self {
            config,
            listen,
            backend,
            psks,
            gen_config,
            version,
            api_listen,
        }
    }
}

fn print_help() {
    println!(r#"Sealgate - UDP secure-session proxy

USAGE:
    sealgate [OPTIONS]

OPTIONS:
    -c, --config <FILE>       Path to configuration file
    -l, --listen <HOST:PORT>  Listen address (default [::]:5684)
    -b, --backend <HOST:PORT> Forward plaintext to this UDP endpoint
    --psk <IDENTITY:KEY>      Pre-shared key (repeatable; replaces config credentials)
    --gen-config              Print an example configuration
    --api <ADDR>              Metrics API listen address (e.g., 127.0.0.1:9090)
    -v, --version             Print version information
    -h, --help                Print help information

EXAMPLES:
    sealgate -c config.json
    sealgate -l 0.0.0.0:5684 -b 127.0.0.1:5683 --psk Client_identity:secretPSK
    sealgate --gen-config > config.json

API ENDPOINTS:
    GET /metrics              Prometheus metrics
"#);
}

fn print_version() {
    println!("Sealgate v{}", env!("CARGO_PKG_VERSION"));
    println!("UDP secure-session proxy");
}
