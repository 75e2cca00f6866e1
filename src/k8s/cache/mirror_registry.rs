use super::errors::{lock_poisoned_error, type_mismatch_error};
use super::mirror::{Mirror, MirrorStats, MirrorView, MirroredObject, RestartPolicy, Transform, WatchSource};
use crate::error::Result;
use crate::k8s::tenant::TenantKey;
use crate::stream::coalescer::ChangeCoalescer;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

type MirrorKey = (TenantKey, &'static str);

struct Slot {
    mirror: Arc<dyn MirrorView>,
    last_used: Instant,
}

impl Slot {
    /// Only the registry holds the mirror
    fn unheld(&self) -> bool {
        Arc::strong_count(&self.mirror) == 1
    }
}

/// One mirror per (tenant, kind), shared by every endpoint that needs it.
///
/// Mirrors stay registered after their last user lets go, so consecutive
/// requests reuse the same watch. `evict_idle` stops mirrors nobody used
/// for the idle grace period. A mirror whose watch gave up is replaced on
/// the next `open`.
pub struct MirrorRegistry {
    coalescer: Arc<ChangeCoalescer>,
    policy: RestartPolicy,
    mirrors: Mutex<HashMap<MirrorKey, Slot>>,
}

impl MirrorRegistry {
    #[must_use]
    pub fn new(coalescer: Arc<ChangeCoalescer>) -> Self {
        Self::with_policy(coalescer, RestartPolicy::default())
    }

    #[must_use]
    pub fn with_policy(coalescer: Arc<ChangeCoalescer>, policy: RestartPolicy) -> Self {
        Self {
            coalescer,
            policy,
            mirrors: Mutex::new(HashMap::new()),
        }
    }

    /// Reuse the running mirror for (tenant, kind) or start one from `source`.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry lock is poisoned or the mirror
    /// for this slot holds a different object type
    pub fn open<K, S>(
        &self,
        tenant: &TenantKey,
        kind: &'static str,
        source: impl FnOnce() -> S,
        transform: Transform<K>,
    ) -> Result<Arc<Mirror<K>>>
    where
        K: MirroredObject,
        S: WatchSource<K>,
    {
        let mut mirrors = self
            .mirrors
            .lock()
            .map_err(|_| lock_poisoned_error("mirror registry"))?;

        let key = (tenant.clone(), kind);
        if let Some(slot) = mirrors.get_mut(&key) {
            if slot.mirror.is_stopped() {
                warn!("🪦 Replacing stopped mirror {}/{}", tenant, kind);
            } else {
                debug!("♻️ Reusing mirror {}/{}", tenant, kind);
                slot.last_used = Instant::now();
                return slot
                    .mirror
                    .clone()
                    .into_any()
                    .downcast::<Mirror<K>>()
                    .map_err(|_| type_mismatch_error("mirror registry", &format!("{tenant}/{kind}")));
            }
        }

        info!("🪞 Opening mirror {}/{}", tenant, kind);
        let mirror = Mirror::spawn(
            tenant.clone(),
            kind,
            source(),
            transform,
            self.coalescer.clone(),
            self.policy,
        );
        mirrors.insert(
            key,
            Slot {
                mirror: mirror.clone(),
                last_used: Instant::now(),
            },
        );
        Ok(mirror)
    }

    /// Stop mirrors that nobody holds and nobody opened for `idle`, plus
    /// unheld mirrors whose watch gave up. A mirror found in use counts as
    /// used now. Returns how many were removed.
    pub fn evict_idle(&self, idle: Duration) -> usize {
        let Ok(mut mirrors) = self.mirrors.lock() else {
            return 0;
        };
        let now = Instant::now();
        let before = mirrors.len();
        mirrors.retain(|(tenant, kind), slot| {
            if !slot.unheld() {
                slot.last_used = now;
                return true;
            }
            let keep = !slot.mirror.is_stopped() && now.duration_since(slot.last_used) < idle;
            if !keep {
                debug!("🧹 Evicting idle mirror {}/{}", tenant, kind);
            }
            keep
        });
        before - mirrors.len()
    }

    /// Number of registered mirrors
    pub fn len(&self) -> usize {
        self.mirrors.lock().map(|mirrors| mirrors.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> Vec<MirrorStats> {
        let mut stats: Vec<MirrorStats> = self
            .mirrors
            .lock()
            .map(|mirrors| mirrors.values().map(|slot| slot.mirror.stats()).collect())
            .unwrap_or_default();
        stats.sort_by(|a, b| (&a.tenant, a.kind).cmp(&(&b.tenant, b.kind)));
        stats
    }
}
