use anyhow::Result;
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::thread;

/// Process-wide lifecycle counters. Prefixed `nockvault_` for namespacing.
pub struct Metrics {
    registry: Registry,
    pub proposals_created: IntCounter,
    pub signatures_collected: IntCounter,
    pub merges: IntCounter,
    pub broadcasts: IntCounter,
    pub broadcast_failures: IntCounter,
    pub unconfirmed: IntGauge,
}

impl Metrics {
    fn register() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let proposals_created = IntCounter::new("nockvault_proposals_created_total", "Proposals created")?;
        let signatures_collected =
            IntCounter::new("nockvault_signatures_collected_total", "Signed fragments accepted")?;
        let merges = IntCounter::new("nockvault_merges_total", "Fragment sets merged")?;
        let broadcasts = IntCounter::new("nockvault_broadcasts_total", "Transactions handed to the ledger")?;
        let broadcast_failures =
            IntCounter::new("nockvault_broadcast_failures_total", "Broadcasts rejected by the ledger")?;
        let unconfirmed = IntGauge::new("nockvault_unconfirmed", "Broadcasts whose acceptance poll timed out")?;
        for c in [&proposals_created, &signatures_collected, &merges, &broadcasts, &broadcast_failures] {
            registry.register(Box::new(c.clone()))?;
        }
        registry.register(Box::new(unconfirmed.clone()))?;
        Ok(Metrics {
            registry,
            proposals_created,
            signatures_collected,
            merges,
            broadcasts,
            broadcast_failures,
            unconfirmed,
        })
    }
}

static METRICS: Lazy<Option<Metrics>> = Lazy::new(|| match Metrics::register() {
    Ok(m) => Some(m),
    Err(e) => {
        tracing::error!("metrics registration failed: {e}");
        None
    }
});

/// Runs `f` against the global metrics, if they registered.
pub fn record(f: impl FnOnce(&Metrics)) {
    if let Some(m) = METRICS.as_ref() {
        f(m);
    }
}

/// Text exposition of every registered series.
pub fn gather() -> Vec<u8> {
    let mut buffer = vec![];
    if let Some(m) = METRICS.as_ref() {
        if TextEncoder::new().encode(&m.registry.gather(), &mut buffer).is_err() {
            eprintln!("🔥 Could not encode metrics");
        }
    }
    buffer
}

pub fn serve(cfg: crate::config::Metrics) -> Result<()> {
    let bind_addr = cfg.bind.clone();
    let content_type: tiny_http::Header = "Content-Type: text/plain; version=0.0.4; charset=utf-8"
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid content-type header"))?;
    thread::spawn(move || {
        let server = match tiny_http::Server::http(&bind_addr) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("🔥 Could not start metrics server on {}: {}", bind_addr, e);
                return;
            }
        };

        for request in server.incoming_requests() {
            let response = tiny_http::Response::from_data(gather()).with_header(content_type.clone());
            let _ = request.respond(response);
        }
    });
    Ok(())
}
