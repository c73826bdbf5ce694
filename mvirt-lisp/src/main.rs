use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mvirt_lisp::Error;
use mvirt_lisp::backend::UdpEndpoint;
use mvirt_lisp::config::{Config, DEFAULT_CONFIG_PATH};
use mvirt_lisp::dispatch::PacketDispatcher;
use mvirt_lisp::eid::{Family, unspecified};
use mvirt_lisp::engine::{EngineSettings, ProtocolEngine};
use mvirt_lisp::event_loop::{EventLoop, LoopExit, PollReactor};
use mvirt_lisp::signal::SignalTimerBridge;
use mvirt_lisp::store::MappingStore;
use mvirt_lisp::tun::TunDevice;

#[derive(Parser)]
#[command(name = "mvirt-lisp")]
#[command(about = "LISP edge router / mobile node daemon")]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log filter, overrides RUST_LOG
    #[arg(long)]
    log: Option<String>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let filter = match &args.log {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mvirt_lisp=info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if args.check {
        return match Config::load(&args.config) {
            Ok(config) => {
                info!(
                    path = %args.config.display(),
                    local_eids = config.database.len(),
                    "Configuration valid"
                );
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!(path = %args.config.display(), error = %e, "Invalid configuration");
                ExitCode::FAILURE
            }
        };
    }

    match run(&args) {
        Ok(LoopExit::Terminated(signal)) => {
            info!(signal, "mvirt-lisp stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "mvirt-lisp failed");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> anyhow::Result<LoopExit> {
    if !nix::unistd::Uid::effective().is_root() {
        return Err(Error::NotRoot.into());
    }

    let config = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    info!(
        tun = %config.tun_name,
        source_rloc = %config.source_rloc,
        "Initializing mvirt-lisp"
    );

    let mut bridge = SignalTimerBridge::new().context("creating signal bridge")?;
    bridge
        .install_handlers()
        .context("installing signal handlers")?;

    let tun = TunDevice::create(&config.tun_name).context("creating TUN device")?;
    tun.bring_up().context("bringing up TUN device")?;

    let any = unspecified(Family::of(config.source_rloc));
    let control = UdpEndpoint::bind(SocketAddr::new(any, config.control_port))
        .context("binding control socket")?;
    let data = UdpEndpoint::bind(SocketAddr::new(any, config.data_port))
        .context("binding data socket")?;

    let store = MappingStore::new(config.database.iter().cloned());
    let engine = ProtocolEngine::new(EngineSettings::from(&config), store);
    let dispatcher = PacketDispatcher::new(config.data_port);

    bridge
        .start_ticker(config.timers.tick)
        .context("starting interval timer")?;

    let mut event_loop = EventLoop::new(
        PollReactor::new(),
        tun,
        data,
        control,
        bridge,
        engine,
        dispatcher,
    );
    Ok(event_loop.run()?)
}
