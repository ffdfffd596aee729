// ===============================
// src/main.rs
// ===============================
/*
 run with a fixed seed, 30 minutes, then exit:
   cargo run -- --seed 7 --ticks 30 --interval-ms 200

 watch the loop from outside:
   curl -s localhost:9898/metrics | egrep '^(cash_balance|position_units|pnl_)'
   curl -s localhost:9898/metrics | grep '^decisions_total'
*/
mod domain;
mod config;
mod metrics;
mod recorder;
mod feed;
mod strategy;
mod advisory;
mod ledger;
mod bridge;
mod identity;
mod scheduler;

use std::sync::Arc;

use tokio::{
    select,
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::advisory::AdvisoryPolicy;
use crate::bridge::{HttpBridge, MemoryBridge, SignalPublisher};
use crate::config::PolicyMode;
use crate::domain::Event;
use crate::feed::MarketSynthesizer;
use crate::ledger::{format_pnl, format_price, ExecutionLedger};
use crate::scheduler::{Pipeline, TickScheduler};
use crate::strategy::{DecisionPolicy, ThresholdPolicy};

#[tokio::main]
async fn main() {
    // ---- Logging ----
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // ---- Config ----
    let args = match config::load() {
        Ok(a) => a,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(2);
        }
    };

    // ---- Metrics ----
    metrics::init();
    metrics::serve_metrics(args.metrics_port);
    metrics::CONFIG_SYMBOL.with_label_values(&[&args.symbol]).set(1);
    metrics::CONFIG_POLICY.with_label_values(&[args.policy.as_str()]).set(1);

    info!(
        symbol = %args.symbol,
        policy = args.policy.as_str(),
        tick_ms = args.tick_interval.as_millis() as u64,
        starting_cash = args.ledger.starting_cash,
        trade_size = args.ledger.trade_size,
        fee_rate = args.ledger.fee_rate,
        seed = ?args.seed,
        max_ticks = ?args.max_ticks,
        bridge = args.bridge.url.as_deref().unwrap_or("memory"),
        "startup config"
    );

    // ---- Recorder (optional) ----
    let (rec_tx, rec_rx) = mpsc::channel::<Event>(8192);
    let recorder = args.record_file.clone().map(|path| tokio::spawn(recorder::run(rec_rx, path)));
    let _ = rec_tx.try_send(Event::Note(format!("session start {} policy={}", args.symbol, args.policy.as_str())));

    // ---- Identity (background) ----
    let http = reqwest::Client::builder()
        .timeout(args.bridge.timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new());
    let identity = identity::spawn(args.identity.clone(), http);

    // ---- Decision source ----
    let policy: Box<dyn DecisionPolicy> = match args.policy {
        PolicyMode::Threshold => Box::new(ThresholdPolicy::default()),
        PolicyMode::Advisory => {
            // validate() already refuses advisory mode without ADVISORY_URL
            let Some(cfg) = args.advisory.clone() else {
                error!("advisory policy requires ADVISORY_URL");
                std::process::exit(2);
            };
            match AdvisoryPolicy::new(cfg) {
                Ok(p) => Box::new(p),
                Err(e) => {
                    error!(error = %e, "advisory client init failed");
                    std::process::exit(2);
                }
            }
        }
    };

    // ---- Signal bridge ----
    let publisher: Arc<dyn SignalPublisher> = match &args.bridge.url {
        Some(url) => match HttpBridge::new(url, &args.identity.app_id, args.bridge.secret.clone(), args.bridge.timeout) {
            Ok(b) => Arc::new(b),
            Err(e) => {
                error!(error = %e, "bridge client init failed");
                std::process::exit(2);
            }
        },
        None => Arc::new(MemoryBridge::new()),
    };

    // ---- Pipeline & scheduler ----
    let synth = match args.seed {
        Some(seed) => MarketSynthesizer::with_seed(seed, args.band),
        None => MarketSynthesizer::new(args.band),
    };
    let mut pipeline = Pipeline::new(
        args.symbol.clone(),
        args.initial_price,
        synth,
        policy,
        publisher,
        identity,
        ExecutionLedger::new(args.ledger),
    );
    if recorder.is_some() {
        pipeline = pipeline.with_recorder(rec_tx.clone());
    }

    let scheduler = TickScheduler::new(pipeline, args.tick_interval);
    scheduler.start();

    // ---- Heartbeat / run control ----
    let mut heartbeat = interval(args.heartbeat);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await;
    let mut progress = interval(Duration::from_millis(100));
    progress.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let pipeline = scheduler.pipeline();
    loop {
        select! {
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c received");
                break;
            }
            _ = heartbeat.tick() => {
                let p = pipeline.lock().await;
                let ledger = p.ledger();
                let mark = p.snapshot().map(|s| s.price).unwrap_or(args.initial_price);
                info!(
                    minute = p.snapshot().map(|s| s.minute_index).unwrap_or(0),
                    price = %format_price(mark),
                    cash = ledger.state().cash_balance(),
                    position = ledger.state().position_units(),
                    realized = %format_pnl(ledger.realized_pnl()),
                    unrealized = %format_pnl(ledger.unrealized_pnl(mark)),
                    last_error = ?p.last_error().map(|e| e.to_string()),
                    "heartbeat"
                );
            }
            _ = progress.tick(), if args.max_ticks.is_some() => {
                // try_lock: never wait behind an in-flight tick here
                let done = match (pipeline.try_lock(), args.max_ticks) {
                    (Ok(p), Some(max)) => p.snapshot().map_or(false, |s| s.minute_index >= max),
                    _ => false,
                };
                if done {
                    info!(max_ticks = ?args.max_ticks, "tick limit reached");
                    break;
                }
            }
        }
    }

    scheduler.stop();

    // waits for an in-flight tick to finish
    let mut p = pipeline.lock().await;
    let ledger = p.ledger();
    let mark = p.snapshot().map(|s| s.price).unwrap_or(args.initial_price);
    info!(
        policy = p.policy_name(),
        minutes = p.snapshot().map(|s| s.minute_index).unwrap_or(0),
        closed_trades = p.closed_trades(),
        entries = ledger.state().history().len(),
        cash = ledger.state().cash_balance(),
        position = ledger.state().position_units(),
        realized = %format_pnl(ledger.realized_pnl()),
        total = %format_pnl(ledger.total_pnl(mark)),
        "session summary"
    );
    drop(p.take_recorder());
    drop(p);

    let _ = rec_tx.send(Event::Note("session end".to_string())).await;
    drop(rec_tx);
    // last sender gone: the recorder drains, flushes and exits
    if let Some(task) = recorder {
        if let Err(e) = task.await {
            warn!(error = %e, "recorder task ended abnormally");
        }
    }
}
