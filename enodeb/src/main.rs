//! LTE FDD eNodeB Main Application
//!
//! Composition root: loads configuration, wires the timer, RLC and user
//! management layers together and runs their worker tasks.

mod config;

use anyhow::Result;
use bytes::Bytes;
use clap::Parser;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{fmt, EnvFilter};

use common::bytes_to_hex;
use interfaces::{message_queue, BearerRef, LayerMessage, MessageReceiver, MessageSender, RrcCommand};
use layers::rb::RadioBearer;
use layers::rlc::RlcEngine;
use layers::timer::TimerManager;
use layers::user_mgr::UserManager;
use layers::LayerError;

use config::EnbConfig;

/// LTE FDD eNodeB
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error), overrides the configuration file
    #[arg(short, long)]
    log_level: Option<String>,

    /// Seconds between user statistics reports
    #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u64).range(1..))]
    stats_interval_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => EnbConfig::from_yaml_file(path)?,
        None => EnbConfig::default(),
    };

    // Initialize logging
    let level = args.log_level.clone().unwrap_or_else(|| config.log.level.clone());
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));

    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting LTE FDD eNodeB");
    match &args.config {
        Some(path) => info!("Configuration file: {}", path),
        None => info!("No configuration file, using defaults"),
    }
    info!("RLC configuration:");
    info!("  t-PollRetransmit: {} ms", config.rlc.poll_retransmit_ms);
    info!("  UM SN size: {} bits", config.rlc.um_sn_size);
    info!("  Status on poll only: {}", config.rlc.status_on_poll_only);
    info!("User configuration:");
    info!("  Max DL bytes per subframe: {}", config.user.max_dl_bytes_per_subframe);
    info!("  Max UL bytes per subframe: {}", config.user.max_ul_bytes_per_subframe);
    info!("  Inactivity timer: {} ms", config.user.inactivity_timer_ms);
    info!("  C-RNTI reservation: {} ms", config.user.c_rnti_reservation_ms);

    let (timer_tx, timer_rx) = message_queue("timer");
    let (rlc_tx, rlc_rx) = message_queue("rlc");
    let (mac_tx, mac_rx) = message_queue("rlc_mac");
    let (pdcp_tx, pdcp_rx) = message_queue("rlc_pdcp");
    let (rrc_tx, rrc_rx) = message_queue("rrc");

    let timer_mgr = Arc::new(TimerManager::new());
    let users = UserManager::new(
        config.user.clone(),
        config.rlc.clone(),
        timer_mgr.clone(),
        rrc_tx,
    );
    let engine = RlcEngine::new(config.rlc.clone(), mac_tx, pdcp_tx)?;

    info!("eNodeB layers initialized");

    let tick_handle = tokio::spawn(run_tick_source(timer_tx, config.timers.tick_interval_ms));
    let mut handles: Vec<JoinHandle<()>> = vec![
        tokio::spawn(run_timer_task(timer_rx, timer_mgr.clone())),
        tokio::spawn(run_rlc_task(rlc_rx, engine, users.clone())),
        tokio::spawn(run_collector(mac_rx, users.clone(), |rb| rb.mac_sdu_queue().pop())),
        tokio::spawn(run_collector(pdcp_rx, users.clone(), |rb| rb.pdcp_pdu_queue().pop())),
        tokio::spawn(run_rrc_logger(rrc_rx)),
    ];

    // Start statistics reporting
    handles.push({
        let users = users.clone();
        let timer_mgr = timer_mgr.clone();
        let period = Duration::from_secs(args.stats_interval_secs);
        tokio::spawn(async move {
            let mut interval = interval(period);
            loop {
                interval.tick().await;
                info!("eNodeB Statistics:");
                info!(
                    "  Users: {}, reserved C-RNTIs: {}, active timers: {}",
                    users.user_count(),
                    users.c_rnti_count(),
                    timer_mgr.active_timers()
                );
                users.print_all_users();
            }
        })
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = tick_handle => {
            warn!("Tick source stopped unexpectedly");
        }
    }

    // Shutdown
    info!("Shutting down eNodeB");
    drop(rlc_tx);
    for handle in handles {
        handle.abort();
    }
    for user in users.users() {
        if let Err(e) = users.del_user(&user) {
            error!("Error removing user {}: {}", user, e);
        }
    }

    info!("eNodeB shutdown complete");
    Ok(())
}

/// Post a timer tick every `period_ms`
async fn run_tick_source(timer: MessageSender, period_ms: u64) {
    let mut interval = interval(Duration::from_millis(period_ms));
    loop {
        interval.tick().await;
        if let Err(e) = timer.send(LayerMessage::TimerTick) {
            error!("Tick source stopping: {}", e);
            return;
        }
    }
}

async fn run_timer_task(mut rx: MessageReceiver, timer_mgr: Arc<TimerManager>) {
    while let Some(msg) = rx.recv().await {
        timer_mgr.handle_msg(&msg);
    }
    debug!("{} queue closed", rx.name());
}

/// Feed MAC and PDCP originated signals to the RLC engine
async fn run_rlc_task(mut rx: MessageReceiver, engine: RlcEngine, users: Arc<UserManager>) {
    while let Some(msg) = rx.recv().await {
        engine.handle_msg(&msg, &users);
    }
    debug!("{} queue closed", rx.name());
}

/// Stand-in for a layer consuming RLC output: pop each signalled payload and log it
async fn run_collector<F>(mut rx: MessageReceiver, users: Arc<UserManager>, pop: F)
where
    F: Fn(&RadioBearer) -> Result<Bytes, LayerError>,
{
    while let Some(msg) = rx.recv().await {
        let bearer = match msg {
            LayerMessage::MacSduReady(bearer) | LayerMessage::PdcpPduReady(bearer) => bearer,
            other => {
                warn!("{} received unexpected message {:?}", rx.name(), other);
                continue;
            }
        };
        match take_payload(&users, bearer, &pop) {
            Ok(payload) => {
                debug!("{} {} took {} bytes", rx.name(), bearer, payload.len());
                trace!("{}", bytes_to_hex(&payload));
            }
            Err(e) => warn!("{} {}: {}", rx.name(), bearer, e),
        }
    }
    debug!("{} queue closed", rx.name());
}

fn take_payload<F>(users: &UserManager, bearer: BearerRef, pop: &F) -> Result<Bytes, LayerError>
where
    F: Fn(&RadioBearer) -> Result<Bytes, LayerError>,
{
    let user = users.find_user_by_c_rnti(bearer.rnti)?;
    let rb = user.bearer(bearer.rb)?;
    pop(&rb)
}

async fn run_rrc_logger(mut rx: MessageReceiver) {
    while let Some(msg) = rx.recv().await {
        match msg {
            LayerMessage::RrcCommand {
                bearer,
                command: RrcCommand::Release,
            } => info!("RRC release requested for {}", bearer),
            other => warn!("{} received unexpected message {:?}", rx.name(), other),
        }
    }
    debug!("{} queue closed", rx.name());
}
