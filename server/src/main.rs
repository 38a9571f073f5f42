use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::time::{Duration, Instant};
use tokio::signal;
use tracing::{error, info, warn};

use xskpump::loopback::spawn_generator;
use xskpump::{Args, Config, Reporter};
use xskpump_common::af_xdp::{Engine, Reflector, Shutdown};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        "xskpump=trace,xskpump_common=debug"
    } else {
        "xskpump=info,xskpump_common=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("╔════════════════════════════════════════╗");
    info!("║   xskpump v{:<28}║", env!("CARGO_PKG_VERSION"));
    info!("╚════════════════════════════════════════╝");

    let mut config = Config::load_or_default(&args.config)?;
    args.apply(&mut config);
    config.xdp.validate().context("invalid configuration")?;

    let (engine, nics) = if args.loopback {
        Engine::loopback(config.xdp.clone()).context("failed to build loopback engine")?
    } else {
        #[cfg(target_os = "linux")]
        xskpump_common::af_xdp::raise_memlock_limit()
            .context("failed to raise RLIMIT_MEMLOCK (run as root or grant CAP_IPC_LOCK)")?;

        let engine = Engine::bind(config.xdp.clone()).with_context(|| {
            format!("failed to set up AF_XDP on {}", config.xdp.interface)
        })?;
        (engine, Vec::new())
    };

    info!(
        "🚀 {} sockets on {} queue {}.., {} workers, {:?} polling",
        engine.sockets().len(),
        if args.loopback { "loopback" } else { config.xdp.interface.as_str() },
        config.xdp.first_queue,
        config.xdp.workers,
        config.xdp.poll_mode,
    );
    info!(
        "📦 {} byte frames, TX batch {} / {}ms",
        config.xdp.frame_size, config.xdp.tx_batch_size, config.xdp.tx_flush_timeout_ms
    );

    let shutdown = Shutdown::new();
    let mut reporter = Reporter::new(engine.stats_handles(), Instant::now());

    let generator = if nics.is_empty() {
        None
    } else {
        Some(spawn_generator(nics, shutdown.clone()).context("failed to start loopback generator")?)
    };

    let engine_shutdown = shutdown.clone();
    let mut engine_task =
        tokio::task::spawn_blocking(move || engine.run(&engine_shutdown, |_| Reflector));

    let mut ticker = tokio::time::interval(Duration::from_secs(config.stats_interval.max(1)));
    ticker.tick().await;

    let signal = shutdown_signal();
    tokio::pin!(signal);

    let outcome = loop {
        tokio::select! {
            _ = ticker.tick(), if !config.quiet => {
                for line in reporter.sample(Instant::now()) {
                    info!("{}", line);
                }
            }
            _ = &mut signal => {
                warn!("Shutdown signal received, stopping workers...");
                shutdown.trigger();
                break engine_task.await;
            }
            joined = &mut engine_task => {
                shutdown.trigger();
                break joined;
            }
        }
    };

    if let Some(generator) = generator {
        generator
            .join()
            .map_err(|_| anyhow!("loopback generator panicked"))?;
    }

    for line in reporter.summary() {
        info!("{}", line);
    }

    match outcome.context("engine task failed")? {
        Ok(()) => {
            info!("Shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!("Engine stopped: {}", e);
            Err(e.into())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
