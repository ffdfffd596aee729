// ===============================
// src/scheduler.rs
// ===============================
//
// One tick = synthesize -> decide -> publish -> execute, run to completion.
//
// `Pipeline` owns every piece of mutable loop state (synthesizer, ledger, last
// snapshot, last error). `TickScheduler` wraps it in a single async mutex and fires
// ticks on a fixed grid (start + k * period) while RUNNING. A boundary that passes
// while a tick is still running is skipped, never queued: the next tick waits for
// the first boundary after the slow one finished.
//
// stop() only flips the control channel: an in-flight tick finishes, no new one starts.
//

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::bridge::{SignalPublisher, SignalRecord};
use crate::domain::{Action, Decision, EntryAction, Event, LedgerEntry, MarketSnapshot};
use crate::feed::MarketSynthesizer;
use crate::ledger::{ExecutionLedger, LedgerError};
use crate::metrics::{
    CASH_BALANCE, DECISIONS, LAST_PRICE, LAST_RSI, LEDGER_ENTRIES, LEDGER_REJECTS, PNL_REALIZED,
    PNL_UNREALIZED, POSITION_UNITS, SCHEDULER_RUNNING, SIGNALS_PUBLISHED, TICKS,
};
use crate::strategy::DecisionPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Stopped,
    Running,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Passed,
    Executed(LedgerEntry),
    Rejected(LedgerError),
}

#[derive(Debug, Clone)]
pub struct TickReport {
    pub snapshot: MarketSnapshot,
    pub decision: Decision,
    pub published: bool,
    pub outcome: TickOutcome,
}

pub struct Pipeline {
    symbol: String,
    initial_price: f64,
    synth: MarketSynthesizer,
    policy: Box<dyn DecisionPolicy>,
    publisher: Arc<dyn SignalPublisher>,
    identity: watch::Receiver<Option<String>>,
    ledger: ExecutionLedger,
    snapshot: Option<MarketSnapshot>,
    last_error: Option<LedgerError>,
    recorder: Option<mpsc::Sender<Event>>,
}

impl Pipeline {
    pub fn new(
        symbol: String,
        initial_price: f64,
        synth: MarketSynthesizer,
        policy: Box<dyn DecisionPolicy>,
        publisher: Arc<dyn SignalPublisher>,
        identity: watch::Receiver<Option<String>>,
        ledger: ExecutionLedger,
    ) -> Self {
        Self {
            symbol,
            initial_price,
            synth,
            policy,
            publisher,
            identity,
            ledger,
            snapshot: None,
            last_error: None,
            recorder: None,
        }
    }

    pub fn with_recorder(mut self, tx: mpsc::Sender<Event>) -> Self {
        self.recorder = Some(tx);
        self
    }

    /// Hands back the recorder sender; once every clone is dropped the recorder
    /// flushes and exits.
    pub fn take_recorder(&mut self) -> Option<mpsc::Sender<Event>> {
        self.recorder.take()
    }

    pub fn ledger(&self) -> &ExecutionLedger { &self.ledger }
    pub fn snapshot(&self) -> Option<&MarketSnapshot> { self.snapshot.as_ref() }
    pub fn last_error(&self) -> Option<&LedgerError> { self.last_error.as_ref() }
    pub fn policy_name(&self) -> &'static str { self.policy.name() }

    fn record(&self, ev: Event) {
        if let Some(tx) = &self.recorder {
            let _ = tx.try_send(ev);
        }
    }

    pub async fn tick(&mut self) -> TickReport {
        // 1) market
        let prev = match self.snapshot.take() {
            Some(s) => s,
            None => self.synth.seed(self.initial_price),
        };
        let snapshot = self.synth.next(&prev);
        TICKS.inc();
        LAST_PRICE.set(snapshot.price);
        LAST_RSI.set(snapshot.rsi);
        self.record(Event::Snapshot(snapshot.clone()));

        // 2) decision
        let position = self.ledger.state().position_units();
        let decision = self.policy.decide(&snapshot, position).await;
        DECISIONS.with_label_values(&[decision.action.as_str()]).inc();
        self.record(Event::Decision { minute_index: snapshot.minute_index, decision: decision.clone() });

        // 3) signal
        let published = self.publish(&decision, snapshot.price).await;

        // 4) ledger
        let outcome = match self.ledger.apply(&decision, snapshot.price, snapshot.minute_index) {
            Ok(None) => {
                debug!(minute = snapshot.minute_index, rsi = snapshot.rsi, rationale = %decision.rationale, "PASS");
                TickOutcome::Passed
            }
            Ok(Some(entry)) => {
                info!(
                    minute = entry.minute_index,
                    action = entry.action.as_str(),
                    units = entry.units,
                    price = entry.price,
                    pnl = entry.pnl,
                    position = self.ledger.state().position_units(),
                    "executed"
                );
                LEDGER_ENTRIES.with_label_values(&[entry.action.as_str()]).inc();
                self.last_error = None;
                self.record(Event::Entry(entry.clone()));
                TickOutcome::Executed(entry)
            }
            Err(e) => {
                warn!(minute = snapshot.minute_index, action = %decision.action, error = %e, "decision rejected by ledger");
                LEDGER_REJECTS.with_label_values(&[e.label()]).inc();
                self.record(Event::Rejected {
                    minute_index: snapshot.minute_index,
                    action: decision.action,
                    reason: e.to_string(),
                });
                self.last_error = Some(e.clone());
                TickOutcome::Rejected(e)
            }
        };

        self.update_gauges(snapshot.price);
        self.snapshot = Some(snapshot.clone());
        TickReport { snapshot, decision, published, outcome }
    }

    /// Best effort: a missing identity or a bridge failure never stops the tick.
    async fn publish(&self, decision: &Decision, price: f64) -> bool {
        let trade_size = self.ledger.config().trade_size;
        let Some(signal) = SignalRecord::from_decision(decision, &self.symbol, price, trade_size) else {
            return false;
        };
        let identity = self.identity.borrow().clone();
        let Some(identity) = identity else {
            debug!(action = %decision.action, "identity not ready, signal not published");
            SIGNALS_PUBLISHED.with_label_values(&["skipped"]).inc();
            return false;
        };

        match self.publisher.publish(&signal, &identity).await {
            Ok(()) => {
                SIGNALS_PUBLISHED.with_label_values(&["ok"]).inc();
                true
            }
            Err(e) => {
                warn!(error = %e, action = %decision.action, "signal publish failed");
                SIGNALS_PUBLISHED.with_label_values(&["error"]).inc();
                false
            }
        }
    }

    fn update_gauges(&self, mark: f64) {
        let state = self.ledger.state();
        CASH_BALANCE.set(state.cash_balance());
        POSITION_UNITS.set(state.position_units());
        PNL_REALIZED.set(self.ledger.realized_pnl());
        PNL_UNREALIZED.set(self.ledger.unrealized_pnl(mark));
    }

    pub fn closed_trades(&self) -> usize {
        self.ledger.state().history().iter().filter(|e| e.action == EntryAction::CloseLong).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Control {
    running: bool,
    /// bumped on every start so a loop from an earlier run can tell it is stale
    generation: u64,
}

impl Control {
    fn is_current(&self, generation: u64) -> bool { self.running && self.generation == generation }
}

/// Cheap to clone; every clone drives the same pipeline.
#[derive(Clone)]
pub struct TickScheduler {
    pipeline: Arc<Mutex<Pipeline>>,
    period: Duration,
    control: Arc<watch::Sender<Control>>,
}

impl TickScheduler {
    pub fn new(pipeline: Pipeline, period: Duration) -> Self {
        let (control, _) = watch::channel(Control { running: false, generation: 0 });
        Self { pipeline: Arc::new(Mutex::new(pipeline)), period, control: Arc::new(control) }
    }

    pub fn pipeline(&self) -> Arc<Mutex<Pipeline>> { self.pipeline.clone() }

    pub fn state(&self) -> RunState {
        if self.control.borrow().running { RunState::Running } else { RunState::Stopped }
    }

    /// STOPPED -> RUNNING. Returns false if already running.
    pub fn start(&self) -> bool {
        let mut generation = 0;
        let started = self.control.send_if_modified(|c| {
            if c.running {
                return false;
            }
            c.running = true;
            c.generation += 1;
            generation = c.generation;
            true
        });
        if !started {
            return false;
        }

        SCHEDULER_RUNNING.set(1);
        info!(period_ms = self.period.as_millis() as u64, "scheduler started");
        let rx = self.control.subscribe();
        tokio::spawn(run_loop(self.pipeline.clone(), self.period, rx, generation));
        true
    }

    /// RUNNING -> STOPPED. Safe from any task; returns false if already stopped.
    pub fn stop(&self) -> bool {
        let stopped = self.control.send_if_modified(|c| {
            if !c.running {
                return false;
            }
            c.running = false;
            true
        });
        if stopped {
            SCHEDULER_RUNNING.set(0);
            info!("scheduler stopped");
        }
        stopped
    }
}

/// First boundary strictly after `now` on the grid `origin + k * period`.
fn next_boundary(origin: Instant, period: Duration, now: Instant) -> Instant {
    let period_ns = period.as_nanos().max(1);
    let elapsed_ns = now.saturating_duration_since(origin).as_nanos();
    let k = elapsed_ns / period_ns + 1;
    origin + Duration::from_nanos((period_ns * k).min(u64::MAX as u128) as u64)
}

async fn run_loop(
    pipeline: Arc<Mutex<Pipeline>>,
    period: Duration,
    mut control: watch::Receiver<Control>,
    generation: u64,
) {
    let origin = Instant::now();
    let mut deadline = origin + period;

    loop {
        tokio::select! {
            _ = sleep_until(deadline) => {
                let active = control.borrow().is_current(generation);
                if !active {
                    break;
                }
                let report = pipeline.lock().await.tick().await;
                if report.decision.action != Action::Pass {
                    debug!(minute = report.snapshot.minute_index, published = report.published, "tick done");
                }
                // boundaries that passed while the tick ran are dropped, not replayed
                let next = next_boundary(origin, period, Instant::now());
                let skipped = (next - deadline).as_nanos() / period.as_nanos().max(1) - 1;
                if skipped > 0 {
                    debug!(skipped = skipped as u64, "tick overran its interval");
                }
                deadline = next;
            }
            changed = control.changed() => {
                let active = changed.is_ok() && control.borrow().is_current(generation);
                if !active {
                    break;
                }
            }
        }
    }
    debug!(generation, "tick loop exited");
}
