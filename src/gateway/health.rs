//! Background provider liveness sampling feeding the readiness signal.
//! Readiness never blocks traffic; the request traversal remains the
//! authority on what actually runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::providers::ProviderAdapter;
use crate::transport::Upstream;
use crate::types::now_epoch_seconds;

pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub healthy: bool,
    pub last_checked: i64,
    pub consecutive_failures: u32,
}

#[derive(Clone)]
pub struct HealthGate {
    inner: Arc<Inner>,
}

struct Inner {
    ready: AtomicBool,
    threshold: u32,
    providers: Mutex<HashMap<String, ProviderHealth>>,
}

impl HealthGate {
    pub fn new(threshold: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                ready: AtomicBool::new(true),
                threshold: threshold.max(1),
                providers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::Relaxed)
    }

    pub async fn snapshot(&self) -> HashMap<String, ProviderHealth> {
        self.inner.providers.lock().await.clone()
    }

    /// Records one probe outcome and recomputes readiness: false iff any
    /// probed provider reached the consecutive-failure threshold.
    pub async fn record(&self, provider: &str, ok: bool) {
        let mut providers = self.inner.providers.lock().await;
        let entry = providers
            .entry(provider.to_string())
            .or_insert(ProviderHealth {
                healthy: true,
                last_checked: 0,
                consecutive_failures: 0,
            });
        entry.last_checked = now_epoch_seconds();
        if ok {
            entry.consecutive_failures = 0;
            entry.healthy = true;
        } else {
            entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
            if entry.consecutive_failures >= self.inner.threshold {
                entry.healthy = false;
            }
        }

        let ready = providers
            .values()
            .all(|health| health.consecutive_failures < self.inner.threshold);
        self.inner.ready.store(ready, Ordering::Relaxed);
    }
}

/// Wakes every `interval`, probes each adapter through the transport, and
/// updates the gate until the shutdown signal flips.
pub fn spawn_probes(
    gate: HealthGate,
    adapters: IndexMap<String, Arc<dyn ProviderAdapter>>,
    upstream: Arc<dyn Upstream>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
            }

            for (name, adapter) in &adapters {
                let probe = adapter.probe_request();
                let ok = match upstream.dispatch(name, &probe).await {
                    Ok(response) => response.status < 500,
                    Err(err) => {
                        tracing::debug!(provider = name.as_str(), error = %err, "health probe failed");
                        false
                    }
                };
                gate.record(name, ok).await;
                if !ok {
                    tracing::warn!(provider = name.as_str(), "provider probe unhealthy");
                }
            }
        }
    })
}
