use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;

use stream_divert::config::{ConfigError, DivertConfig, ProxyRecord, ProxySettings};
use stream_divert::divert::DivertProxy;

/// Transparent TCP redirect proxy
#[derive(Parser, Debug)]
#[command(name = "stream-divert")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(long, short, value_name = "FILE", conflicts_with_all = ["redirect_port", "proxy_port", "records"])]
    config: Option<PathBuf>,

    /// Port clients connect to
    #[arg(long, requires = "proxy_port")]
    redirect_port: Option<u16>,

    /// Port the local relay listens on
    #[arg(long, requires = "redirect_port")]
    proxy_port: Option<u16>,

    /// Redirect record (repeatable)
    #[arg(long = "record", value_name = "SRC=FWD:PORT")]
    records: Vec<ProxyRecord>,

    /// Capture handle priority
    #[arg(long)]
    priority: Option<i16>,

    /// Address the relay binds to (default: 0.0.0.0)
    #[arg(long, value_name = "ADDR")]
    listen_address: Option<Ipv4Addr>,

    /// Timeout for connecting to forward targets, in milliseconds
    #[arg(long, value_name = "MS")]
    connect_timeout_ms: Option<u64>,

    /// Validate the configuration, print the capture filters and exit
    #[arg(long, default_value = "false")]
    check: bool,
}

fn build_config(cli: &Cli) -> Result<DivertConfig, ConfigError> {
    if let Some(path) = &cli.config {
        return DivertConfig::load(path);
    }

    let (redirect_port, proxy_port) = match (cli.redirect_port, cli.proxy_port) {
        (Some(r), Some(p)) => (r, p),
        _ => return Err(ConfigError::NoProxies),
    };

    let mut settings = ProxySettings::new(redirect_port, proxy_port, cli.records.clone());
    if let Some(priority) = cli.priority {
        settings.priority = priority;
    }
    if let Some(addr) = cli.listen_address {
        settings.listen_address = addr;
    }
    settings.connect_timeout_ms = cli.connect_timeout_ms;

    let config = DivertConfig {
        proxies: vec![settings],
    };
    config.validate()?;
    Ok(config)
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            log::error!("Invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut proxies = Vec::with_capacity(config.proxies.len());
    for settings in config.proxies {
        match DivertProxy::new(settings) {
            Ok(proxy) => proxies.push(proxy),
            Err(e) => {
                log::error!("{}", e);
                return ExitCode::FAILURE;
            }
        }
    }

    if cli.check {
        for proxy in &proxies {
            println!("{}: {}", proxy, proxy.filter());
        }
        return ExitCode::SUCCESS;
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        log::info!("Received Ctrl+C, shutting down...");
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        log::error!("Failed to set Ctrl+C handler: {}", e);
        return ExitCode::FAILURE;
    }

    for proxy in &proxies {
        if let Err(e) = proxy.start() {
            log::error!("{}: failed to start: {}", proxy, e);
            // Dropping the proxies stops the ones already started.
            return ExitCode::FAILURE;
        }
    }
    log::info!("{} proxies running, press Ctrl+C to stop", proxies.len());

    while !shutdown.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(200));
    }

    for proxy in &proxies {
        proxy.stop();
    }
    ExitCode::SUCCESS
}
