// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Loop activity --------
pub static TICKS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("ticks_total", "simulated minutes processed").unwrap());

pub static DECISIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("decisions_total", "decisions by action"), &["action"]).unwrap()
});

pub static LEDGER_ENTRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("ledger_entries_total", "ledger entries by action"), &["action"]).unwrap()
});

pub static LEDGER_REJECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("ledger_rejects_total", "decisions the ledger refused"), &["reason"]).unwrap()
});

pub static ADVISORY_FALLBACKS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("advisory_fallbacks_total", "advisory calls degraded to PASS"),
        &["reason"],
    )
    .unwrap()
});

pub static SIGNALS_PUBLISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("signals_published_total", "bridge publish attempts (label: status)"),
        &["status"],
    )
    .unwrap()
});

// -------- Ledger & market state --------
pub static CASH_BALANCE: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("cash_balance", "ledger cash balance").unwrap());

pub static POSITION_UNITS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("position_units", "open long units").unwrap());

pub static PNL_REALIZED: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("pnl_realized", "realized PnL").unwrap());

pub static PNL_UNREALIZED: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("pnl_unrealized", "unrealized PnL at last price").unwrap());

pub static LAST_PRICE: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("last_price", "last synthesized price").unwrap());

pub static LAST_RSI: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("last_rsi", "last synthesized RSI").unwrap());

pub static SCHEDULER_RUNNING: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("scheduler_running", "1 while the tick scheduler runs").unwrap());

// ---- Config visibility ----
pub static CONFIG_SYMBOL: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("config_symbol", "configured symbol (label: symbol)"), &["symbol"]).unwrap()
});

pub static CONFIG_POLICY: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("config_policy", "active decision policy (label: policy)"), &["policy"]).unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(TICKS.clone())),
        REGISTRY.register(Box::new(DECISIONS.clone())),
        REGISTRY.register(Box::new(LEDGER_ENTRIES.clone())),
        REGISTRY.register(Box::new(LEDGER_REJECTS.clone())),
        REGISTRY.register(Box::new(ADVISORY_FALLBACKS.clone())),
        REGISTRY.register(Box::new(SIGNALS_PUBLISHED.clone())),
        REGISTRY.register(Box::new(CASH_BALANCE.clone())),
        REGISTRY.register(Box::new(POSITION_UNITS.clone())),
        REGISTRY.register(Box::new(PNL_REALIZED.clone())),
        REGISTRY.register(Box::new(PNL_UNREALIZED.clone())),
        REGISTRY.register(Box::new(LAST_PRICE.clone())),
        REGISTRY.register(Box::new(LAST_RSI.clone())),
        REGISTRY.register(Box::new(SCHEDULER_RUNNING.clone())),
        REGISTRY.register(Box::new(CONFIG_SYMBOL.clone())),
        REGISTRY.register(Box::new(CONFIG_POLICY.clone())),
    ] {
        if let Err(e) = m {
            tracing::debug!(?e, "metric registration skipped");
        }
    }
}

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics)
fn handle_client(mut stream: TcpStream) {
    // headers are read and ignored
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Metrics server on a dedicated OS thread, away from the tick loop
pub fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(%addr, error = %e, "metrics bind failed, metrics disabled");
                return;
            }
        };
        tracing::info!("metrics listening on http://{addr}/ (and /metrics)");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => tracing::warn!(error = %e, "metrics accept error"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_metrics_are_encoded() {
        init();
        // a second init must not panic on duplicate registration
        init();
        TICKS.inc();
        let text = String::from_utf8(encode_metrics()).unwrap();
        assert!(text.contains("ticks_total"));
        assert!(text.contains("# TYPE cash_balance gauge"));
    }
}
