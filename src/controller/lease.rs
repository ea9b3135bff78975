//! Node-lease controller
//!
//! Arbitrates Node ownership between competing controller processes through
//! `coordination.k8s.io/Lease` objects in `kube-node-lease`. A process
//! manages a Node iff it holds that Node's lease. Leases are renewed every
//! `lease_duration / 4` with 4% jitter; a renewal that fails past expiry
//! flips the Node to read-only until the lease is re-acquired.
//!
//! In shareable mode the controller records co-holders in the
//! `kwok.x-k8s.io/holders` annotation; every listed holder treats the Node
//! as managed. This is cooperative awareness, not mutual exclusion.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta, OwnerReference};
use kube::api::{Api, PostParams};
use kube::Client;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{is_conflict, is_not_found, Error};
use crate::executor::TaskGroup;

/// Namespace node leases live in
pub const LEASE_NAMESPACE: &str = "kube-node-lease";
/// Annotation listing co-holders in shareable mode
pub const HOLDERS_ANNOTATION: &str = "kwok.x-k8s.io/holders";

/// Fraction of the lease duration between renewals
const RENEW_DIVISOR: u32 = 4;
/// Jitter applied on top of the renew interval
const RENEW_INTERVAL_JITTER: f64 = 0.04;
/// Conflict retries within one sync before giving up the cycle
const MAX_CONFLICT_RETRIES: u32 = 5;

/// Callback producing the owner references a Node's lease should carry
pub type OwnerRefsFn = Box<dyn Fn(&str) -> Vec<OwnerReference> + Send + Sync>;
/// Callback fired when a lease is first acquired for a Node
pub type OnNodeManagedFn = Box<dyn Fn(String) + Send + Sync>;

/// Configuration for the lease controller
pub struct NodeLeaseControllerConfig {
    /// API client
    pub client: Client,
    /// This process's holder identity (`<hostname>_<uuid>`)
    pub holder_identity: String,
    /// Lease duration in seconds
    pub lease_duration_seconds: u32,
    /// Record co-holders instead of excluding them
    pub shareable: bool,
    /// Executor group for lease tasks
    pub tasks: TaskGroup,
    /// RNG seed for renew jitter; tests pin it
    pub rng_seed: Option<u64>,
}

/// Lease-based ownership arbiter
pub struct NodeLeaseController {
    api: Api<Lease>,
    holder: String,
    duration_seconds: u32,
    renew_interval: Duration,
    shareable: bool,
    latest: DashMap<String, Lease>,
    tracked: DashMap<String, ()>,
    tasks: TaskGroup,
    rng: Mutex<StdRng>,
    cancel: CancellationToken,
    owner_refs_fn: OnceLock<OwnerRefsFn>,
    on_node_managed_fn: OnceLock<OnNodeManagedFn>,
}

impl NodeLeaseController {
    /// Create the controller; callbacks are wired afterwards via the
    /// `set_*` methods before any lease activity starts.
    pub fn new(config: NodeLeaseControllerConfig, cancel: CancellationToken) -> Arc<Self> {
        let renew_interval =
            Duration::from_secs(u64::from(config.lease_duration_seconds.max(1))) / RENEW_DIVISOR;
        Arc::new(Self {
            api: Api::namespaced(config.client, LEASE_NAMESPACE),
            holder: config.holder_identity,
            duration_seconds: config.lease_duration_seconds,
            renew_interval,
            shareable: config.shareable,
            latest: DashMap::new(),
            tracked: DashMap::new(),
            tasks: config.tasks,
            rng: Mutex::new(match config.rng_seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            }),
            cancel,
            owner_refs_fn: OnceLock::new(),
            on_node_managed_fn: OnceLock::new(),
        })
    }

    /// Wire the owner-reference callback (Node controller cache lookup)
    pub fn set_owner_refs_fn(&self, f: OwnerRefsFn) {
        let _ = self.owner_refs_fn.set(f);
    }

    /// Wire the on-acquire callback (Node manage + Pod replay)
    pub fn set_on_node_managed_fn(&self, f: OnNodeManagedFn) {
        let _ = self.on_node_managed_fn.set(f);
    }

    /// True if this process currently holds (or co-holds) the Node's lease
    pub fn held(&self, name: &str) -> bool {
        self.latest
            .get(name)
            .map(|lease| lease_held_by(&lease, &self.holder, self.shareable, Utc::now()))
            .unwrap_or(false)
    }

    /// Start trying to hold the lease for a Node.
    ///
    /// Idempotent: a Node already being tracked is left to its renewal
    /// schedule.
    pub fn try_hold(self: &Arc<Self>, name: &str) {
        if self.tracked.insert(name.to_string(), ()).is_some() {
            return;
        }
        debug!(node = name, "tracking lease");
        let this = Arc::clone(self);
        let name = name.to_string();
        self.tasks
            .submit(None, async move { this.sync(name).await });
    }

    /// One acquire/renew cycle for a Node's lease, rescheduling itself.
    fn sync(self: Arc<Self>, name: String) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            if self.cancel.is_cancelled() {
                return;
            }

            let was_held = self.held(&name);
            match self.ensure_lease(&name).await {
                Ok(true) => {
                    if !was_held {
                        info!(node = %name, "lease acquired");
                        if let Some(on_managed) = self.on_node_managed_fn.get() {
                            on_managed(name.clone());
                        }
                    }
                }
                Ok(false) => {
                    debug!(node = %name, "lease held elsewhere");
                }
                Err(err) => {
                    // Treat as not-held for this cycle; the node reads as
                    // read-only until a later sync succeeds.
                    warn!(node = %name, error = %err, "lease sync failed");
                    self.latest.remove(&name);
                }
            }

            if self.tracked.contains_key(&name) && !self.cancel.is_cancelled() {
                let delay = self.next_renew_interval();
                let this = Arc::clone(&self);
                self.tasks.submit(Some(delay), this.sync(name));
            }
        })
    }

    /// Create, take over, or renew the lease. `Ok(true)` means we hold it.
    async fn ensure_lease(&self, name: &str) -> Result<bool, Error> {
        let mut backoff = Duration::from_millis(200);
        for attempt in 0..MAX_CONFLICT_RETRIES {
            let existing = match self.api.get(name).await {
                Ok(lease) => Some(lease),
                Err(err) if is_not_found(&err) => None,
                Err(err) => return Err(err.into()),
            };

            let result = match existing {
                None => self.create_lease(name).await,
                Some(lease) => self.claim_lease(name, lease).await,
            };
            match result {
                Ok(held) => return Ok(held),
                Err(Error::Kube(err)) if is_conflict(&err) => {
                    debug!(node = name, attempt, "lease conflict, re-reading");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(2));
                }
                Err(err) => return Err(err),
            }
        }
        Ok(false)
    }

    async fn create_lease(&self, name: &str) -> Result<bool, Error> {
        let now = Utc::now();
        let mut lease = Lease {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(LEASE_NAMESPACE.to_string()),
                owner_references: self.owner_references(name),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.holder.clone()),
                lease_duration_seconds: Some(self.duration_seconds as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                ..Default::default()
            }),
        };
        if self.shareable {
            set_holders(&mut lease, &[self.holder.clone()]);
        }
        let created = self.api.create(&PostParams::default(), &lease).await?;
        self.latest.insert(name.to_string(), created);
        Ok(true)
    }

    async fn claim_lease(&self, name: &str, mut lease: Lease) -> Result<bool, Error> {
        let now = Utc::now();
        let ours = lease_holder(&lease) == Some(self.holder.as_str());
        let free = lease_expired(&lease, now) || lease_holder(&lease).is_none();

        if !ours && !free {
            if self.shareable {
                // Record ourselves as a co-holder; the primary holder keeps
                // renewing.
                let mut holders = holders_of(&lease);
                if !holders.iter().any(|h| h == &self.holder) {
                    holders.push(self.holder.clone());
                    set_holders(&mut lease, &holders);
                    let updated = self.api.replace(name, &PostParams::default(), &lease).await?;
                    self.latest.insert(name.to_string(), updated);
                } else {
                    self.latest.insert(name.to_string(), lease);
                }
                return Ok(true);
            }
            // Remember who holds it; retried on the next cycle.
            self.latest.insert(name.to_string(), lease);
            return Ok(false);
        }

        let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
        if !ours {
            spec.acquire_time = Some(MicroTime(now));
        }
        spec.holder_identity = Some(self.holder.clone());
        spec.lease_duration_seconds = Some(self.duration_seconds as i32);
        spec.renew_time = Some(MicroTime(now));
        if lease.metadata.owner_references.is_none() {
            lease.metadata.owner_references = self.owner_references(name);
        }
        if self.shareable {
            let mut holders = holders_of(&lease);
            if !holders.iter().any(|h| h == &self.holder) {
                holders.push(self.holder.clone());
            }
            set_holders(&mut lease, &holders);
        }

        let updated = self.api.replace(name, &PostParams::default(), &lease).await?;
        self.latest.insert(name.to_string(), updated);
        Ok(true)
    }

    /// Release every held lease, best-effort, for graceful shutdown
    pub async fn release_all(&self) {
        let held: Vec<String> = self
            .latest
            .iter()
            .filter(|e| lease_held_by(e.value(), &self.holder, self.shareable, Utc::now()))
            .map(|e| e.key().clone())
            .collect();
        for name in held {
            self.tracked.remove(&name);
            if let Err(err) = self.release(&name).await {
                warn!(node = %name, error = %err, "failed to release lease");
            } else {
                info!(node = %name, "lease released");
            }
        }
    }

    async fn release(&self, name: &str) -> Result<(), Error> {
        let Some((_, mut lease)) = self.latest.remove(name) else {
            return Ok(());
        };
        if let Some(spec) = lease.spec.as_mut() {
            spec.holder_identity = None;
        }
        if self.shareable {
            let holders: Vec<String> = holders_of(&lease)
                .into_iter()
                .filter(|h| h != &self.holder)
                .collect();
            set_holders(&mut lease, &holders);
        }
        self.api.replace(name, &PostParams::default(), &lease).await?;
        Ok(())
    }

    fn owner_references(&self, name: &str) -> Option<Vec<OwnerReference>> {
        let refs = self.owner_refs_fn.get().map(|f| f(name)).unwrap_or_default();
        (!refs.is_empty()).then_some(refs)
    }

    /// Renew interval with up to 4% positive jitter
    fn next_renew_interval(&self) -> Duration {
        let factor = 1.0 + self.rng.lock().gen_range(0.0..RENEW_INTERVAL_JITTER);
        self.renew_interval.mul_f64(factor)
    }
}

fn lease_holder(lease: &Lease) -> Option<&str> {
    lease
        .spec
        .as_ref()
        .and_then(|s| s.holder_identity.as_deref())
        .filter(|h| !h.is_empty())
}

/// True if the lease's renew time plus its duration is in the past.
///
/// A lease without a renew time or duration counts as expired.
pub fn lease_expired(lease: &Lease, now: DateTime<Utc>) -> bool {
    let Some(spec) = lease.spec.as_ref() else {
        return true;
    };
    match (&spec.renew_time, spec.lease_duration_seconds) {
        (Some(renew), Some(duration)) => {
            renew.0 + chrono::Duration::seconds(i64::from(duration)) < now
        }
        _ => true,
    }
}

/// True if `holder` owns the lease: primary holder, or any listed co-holder
/// in shareable mode. Expired leases are held by nobody.
pub fn lease_held_by(lease: &Lease, holder: &str, shareable: bool, now: DateTime<Utc>) -> bool {
    if lease_expired(lease, now) {
        return false;
    }
    if lease_holder(lease) == Some(holder) {
        return true;
    }
    shareable && holders_of(lease).iter().any(|h| h == holder)
}

/// Parse the comma-delimited co-holder list
pub fn holders_of(lease: &Lease) -> Vec<String> {
    lease
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(HOLDERS_ANNOTATION))
        .map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn set_holders(lease: &mut Lease, holders: &[String]) {
    let annotations = lease.metadata.annotations.get_or_insert_with(Default::default);
    if holders.is_empty() {
        annotations.remove(HOLDERS_ANNOTATION);
    } else {
        annotations.insert(HOLDERS_ANNOTATION.to_string(), holders.join(","));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(holder: Option<&str>, renewed_secs_ago: i64, duration: i32) -> Lease {
        Lease {
            metadata: ObjectMeta::default(),
            spec: Some(LeaseSpec {
                holder_identity: holder.map(str::to_string),
                lease_duration_seconds: Some(duration),
                renew_time: Some(MicroTime(
                    Utc::now() - chrono::Duration::seconds(renewed_secs_ago),
                )),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn fresh_lease_is_not_expired() {
        let now = Utc::now();
        assert!(!lease_expired(&lease(Some("a"), 0, 40), now));
        assert!(lease_expired(&lease(Some("a"), 60, 40), now));
    }

    #[test]
    fn leases_without_timing_count_as_expired() {
        let now = Utc::now();
        assert!(lease_expired(&Lease::default(), now));
        let mut l = lease(Some("a"), 0, 40);
        l.spec.as_mut().unwrap().renew_time = None;
        assert!(lease_expired(&l, now));
    }

    #[test]
    fn held_by_primary_holder_only_while_fresh() {
        let now = Utc::now();
        let l = lease(Some("me"), 0, 40);
        assert!(lease_held_by(&l, "me", false, now));
        assert!(!lease_held_by(&l, "other", false, now));

        let stale = lease(Some("me"), 60, 40);
        assert!(!lease_held_by(&stale, "me", false, now));
    }

    #[test]
    fn shareable_mode_recognizes_co_holders() {
        let now = Utc::now();
        let mut l = lease(Some("primary"), 0, 40);
        set_holders(&mut l, &["primary".into(), "standby".into()]);

        assert!(lease_held_by(&l, "standby", true, now));
        // Without shareable mode the annotation is ignored.
        assert!(!lease_held_by(&l, "standby", false, now));
        assert_eq!(holders_of(&l), vec!["primary", "standby"]);
    }

    #[test]
    fn holders_list_round_trips_through_the_annotation() {
        let mut l = Lease::default();
        set_holders(&mut l, &["a".into(), "b".into()]);
        assert_eq!(holders_of(&l), vec!["a", "b"]);

        set_holders(&mut l, &[]);
        assert!(holders_of(&l).is_empty());
        assert!(!l
            .metadata
            .annotations
            .unwrap_or_default()
            .contains_key(HOLDERS_ANNOTATION));
    }

    #[test]
    fn empty_holder_identity_reads_as_free() {
        let l = lease(Some(""), 0, 40);
        assert_eq!(lease_holder(&l), None);
    }

    #[test]
    fn renew_interval_jitter_stays_within_four_percent() {
        // The interval math itself, independent of the controller.
        let base = Duration::from_secs(10);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1000 {
            let factor = 1.0 + rng.gen_range(0.0..RENEW_INTERVAL_JITTER);
            let interval = base.mul_f64(factor);
            assert!(interval >= base);
            assert!(interval < base.mul_f64(1.0 + RENEW_INTERVAL_JITTER));
        }
    }
}
