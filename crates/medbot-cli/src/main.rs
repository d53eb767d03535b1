//! `medbot` – operator console for assistive medical robots
//!
//! This binary opens one teleoperation session against a robot's joint
//! command channel and keeps the joint map synchronized. It:
//!
//! 1. Loads `~/.medbot/config.toml`, writing the defaults on first run.
//! 2. Opens a [`TeleopSession`] (reconnecting transport plus joint pipeline)
//!    and, when configured, a trigger-fetch coordinator for telemetry.
//! 3. Drops the operator into an **interactive REPL** with slash-commands
//!    (`/joints`, `/set`, `/reset`, `/status`, `/telemetry`, `/help`).
//! 4. Intercepts **Ctrl-C** and closes the session in order before exiting.

mod config;
mod repl;
mod telemetry;
mod view;

use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};

use medbot_sync::{
    EventBus, HttpFetcher, JointConsumer, TeleopSession, Topic, TopicReceiver, TransportChannel,
    TriggerFetchCoordinator,
};
use medbot_types::{ConnectionState, SyncPayload};
use serde_json::Value;

use crate::view::NativeJointView;

fn main() {
    let _otel_guard = telemetry::init_tracing("medbot");

    print_banner();

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();

    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – closing session …".yellow().bold());
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    // ── Configuration ─────────────────────────────────────────────────────
    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => {
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            match config::save(&config::Config::default()) {
                Ok(()) => println!(
                    "  {} Default config written to {}",
                    "✓".green().bold(),
                    config::config_path().display().to_string().bold()
                ),
                Err(e) => println!("{}: {}", "Error saving config".red(), e),
            }
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };

    // ── Runtime ───────────────────────────────────────────────────────────
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("medbot-sync")
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start the async runtime");
            std::process::exit(1);
        }
    };

    let bus = Arc::new(EventBus::default());
    let view = NativeJointView::default();

    let (mut session, mut telemetry) = {
        let _enter = runtime.enter();

        tokio::spawn(announce_connection(
            bus.subscribe_to(Topic::Connection),
            cfg.command_url.clone(),
        ));

        let consumers: Vec<Box<dyn JointConsumer>> = vec![Box::new(view.clone())];
        let session = TeleopSession::open(
            cfg.session_config(),
            cfg.joints.clone(),
            consumers,
            Arc::clone(&bus),
        );
        (session, start_telemetry(&cfg, &bus))
    };

    println!("  Robot endpoint : {}", cfg.command_url.yellow());
    println!(
        "  Joints         : {}",
        cfg.joints.len().to_string().yellow()
    );
    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    // ── Interactive REPL ──────────────────────────────────────────────────
    repl::run(
        shutdown,
        repl::Console {
            session: &mut session,
            view: &view,
            telemetry: telemetry.as_ref(),
        },
    );

    runtime.block_on(async {
        if let Some(coordinator) = telemetry.as_mut() {
            coordinator.stop().await;
        }
        session.close().await;
    });
    println!("{}", "  ✓ Session closed.".green());
}

/// Start the telemetry coordinator when both endpoints are configured.
fn start_telemetry(
    cfg: &config::Config,
    bus: &Arc<EventBus>,
) -> Option<TriggerFetchCoordinator<Value>> {
    if !cfg.telemetry_enabled() {
        return None;
    }
    match HttpFetcher::<Value>::new(cfg.snapshot_url.clone(), cfg.fetch_timeout()) {
        Ok(fetcher) => {
            info!(trigger = %cfg.trigger_url, snapshot = fetcher.url(), "telemetry enabled");
            Some(TriggerFetchCoordinator::start_with_bus(
                TransportChannel::new(cfg.trigger_url.clone(), cfg.reconnect_policy()),
                fetcher,
                Some(Arc::clone(bus)),
            ))
        }
        Err(e) => {
            warn!(error = %e, "telemetry disabled");
            None
        }
    }
}

/// Print a notice when the command channel opens or gives up. Routine
/// reconnects stay in the logs.
async fn announce_connection(mut events: TopicReceiver, endpoint: String) {
    while let Ok(event) = events.recv().await {
        let SyncPayload::Connection { state, .. } = event.payload else {
            continue;
        };
        match state {
            ConnectionState::Open => {
                println!("\n  {} Connected to {}", "●".green(), endpoint.bold());
            }
            ConnectionState::Closed(_) if state.is_exhausted() => {
                println!(
                    "\n  {} {} – type {} to retry",
                    "●".red(),
                    state.to_string().red(),
                    "/reconnect".bold().cyan()
                );
            }
            _ => {}
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"                    ____          __ "#.bold().cyan());
    println!("{}", r#"   ____ ___  ___  / __ \ ____   / /_"#.bold().cyan());
    println!("{}", r#"  / __ `__ \/ _ \/ / / // __ \ / __/"#.bold().cyan());
    println!("{}", r#" / / / / / /  __/ /_/ // /_/ // /_  "#.bold().cyan());
    println!("{}", r#"/_/ /_/ /_/\___/_____//_.___/ \__/  "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "medbot".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Robot teleoperation console");
    println!();
}
