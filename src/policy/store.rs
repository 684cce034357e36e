//! Policy Store (C2): loads, ranks, and hot-reloads policy snapshots.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::PolicyLoadError;
use crate::policy::{PolicySnapshot, PolicySource};
use crate::pricing::PricingTable;

/// Loads, ranks, and hot-reloads budget/routing/pricing documents from a
/// [`PolicySource`].
///
/// On construction and on a periodic timer, it reloads; on reload failure,
/// it retains the last-known-good snapshot and logs. If no
/// snapshot exists and load fails, construction fails.
pub struct PolicyStore {
    source: Box<dyn PolicySource>,
    snapshot: Arc<RwLock<Arc<PolicySnapshot>>>,
}

impl PolicyStore {
    /// Load the first snapshot. Fails if the source itself fails on the
    /// very first load.
    pub fn new(source: Box<dyn PolicySource>) -> Result<Self, PolicyLoadError> {
        let snapshot = Self::load_snapshot(source.as_ref())?;
        Ok(Self {
            source,
            snapshot: Arc::new(RwLock::new(Arc::new(snapshot))),
        })
    }

    fn load_snapshot(source: &dyn PolicySource) -> Result<PolicySnapshot, PolicyLoadError> {
        let budgets = source.load_budgets()?;
        let routing_policies = source.load_routing_policies()?;
        let pricing_dict = source.load_pricing()?;
        let pricing = PricingTable::from_dict(pricing_dict)?;

        Ok(PolicySnapshot {
            budgets,
            routing_policies,
            pricing,
        })
    }

    /// The current snapshot. Readers take this once at the start of a hook
    /// call and operate against their own `Arc` for the rest of that call,
    /// so an in-flight concurrent reload never changes what they see.
    pub fn current(&self) -> Arc<PolicySnapshot> {
        self.snapshot.read().unwrap().clone()
    }

    /// Reload from the source. On failure, the previous snapshot is kept
    /// and the error is logged, never propagated.
    pub fn reload(&self) {
        match Self::load_snapshot(self.source.as_ref()) {
            Ok(fresh) => {
                let mut guard = self.snapshot.write().unwrap();
                *guard = Arc::new(fresh);
                info!("policy snapshot reloaded");
            }
            Err(e) => {
                error!(error = %e, "policy reload failed; retaining last-known-good snapshot");
            }
        }
    }

    /// Spawn the periodic reload loop (default interval: 300s).
    /// Callers hold the returned `JoinHandle` and the `CancellationToken`
    /// used to stop it, the same shape as the host project's health-check
    /// poller.
    pub fn start_reload_loop(
        self: Arc<Self>,
        interval: Duration,
        cancel_token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        warn!("policy reload loop stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.reload();
                    }
                }
            }
        })
    }
}
