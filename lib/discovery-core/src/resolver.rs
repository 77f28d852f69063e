//! Resolution of logical service names to healthy instances
//!
//! Lookups go through a per-name cache slot. Slots live in a sharded map so
//! lookups of unrelated services never contend, and refreshes of one name are
//! serialized by that slot's own mutex: when an entry expires under
//! concurrent load exactly one task queries the authority and the others
//! reuse its outcome.

use crate::authority::{with_timeout, Authority};
use crate::load_balancer::{LoadBalancer, SelectionStrategy};
use crate::NotFoundError;
use dashmap::DashMap;
use discovery_api::{InstanceId, InstanceRecord, ResolutionResult, ServiceName};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Minimum spacing between sweeps of dead cache slots
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// How long a successful lookup is served from cache
    #[serde(rename = "cache_ttl_ms", with = "discovery_api::duration_ms")]
    pub cache_ttl: Duration,
    /// How long an empty answer is remembered; zero disables negative caching
    #[serde(rename = "negative_ttl_ms", with = "discovery_api::duration_ms")]
    pub negative_ttl: Duration,
    /// Bound on a single authority query
    #[serde(rename = "query_timeout_ms", with = "discovery_api::duration_ms")]
    pub query_timeout: Duration,
    /// How long past expiry an entry may still be served, flagged stale, while the authority is down
    #[serde(rename = "max_stale_ms", with = "discovery_api::duration_ms")]
    pub max_stale: Duration,
    pub strategy: SelectionStrategy,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(5),
            negative_ttl: Duration::from_secs(1),
            query_timeout: Duration::from_secs(2),
            max_stale: Duration::from_secs(30),
            strategy: SelectionStrategy::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RefreshOutcome {
    Found,
    Empty,
    Failed,
}

struct CachedResult {
    result: ResolutionResult,
    expires_at: Instant,
}

impl CachedResult {
    fn servable_stale(&self, now: Instant, max_stale: Duration) -> bool {
        now < self.expires_at + max_stale
    }
}

#[derive(Default)]
struct SlotState {
    entry: Option<CachedResult>,
    negative_until: Option<Instant>,
    /// Bumped on every completed refresh attempt
    generation: u64,
    last_refresh: Option<RefreshOutcome>,
}

impl SlotState {
    /// Answer straight from the slot if it is still fresh
    fn fresh(&self, service: &ServiceName, now: Instant) -> Option<Result<ResolutionResult, NotFoundError>> {
        if let Some(cached) = &self.entry {
            if cached.expires_at > now {
                return Some(Ok(cached.result.clone()));
            }
        }
        match self.negative_until {
            Some(until) if until > now => Some(Err(NotFoundError::no_healthy_instances(service))),
            _ => None,
        }
    }

    /// Replay the outcome of the refresh another task just completed
    fn last_outcome(&self, service: &ServiceName) -> Result<ResolutionResult, NotFoundError> {
        match (self.last_refresh, &self.entry) {
            (Some(RefreshOutcome::Found), Some(cached)) => Ok(cached.result.clone()),
            (Some(RefreshOutcome::Failed), Some(cached)) => Ok(cached.result.clone().into_stale()),
            (Some(RefreshOutcome::Failed), None) => Err(NotFoundError::authority_unavailable(service)),
            _ => Err(NotFoundError::no_healthy_instances(service)),
        }
    }

    /// Nothing left that could answer a lookup
    fn is_dead(&self, now: Instant, max_stale: Duration) -> bool {
        let entry_gone = self
            .entry
            .as_ref()
            .map_or(true, |cached| !cached.servable_stale(now, max_stale));
        let negative_gone = self.negative_until.map_or(true, |until| until <= now);
        entry_gone && negative_gone
    }
}

#[derive(Default)]
struct CacheSlot {
    state: RwLock<SlotState>,
    refresh: Mutex<()>,
}

/// Resolver maps service names to healthy instances via the authority
pub struct Resolver {
    authority: Arc<dyn Authority>,
    config: ResolverConfig,
    balancer: LoadBalancer,
    cache: DashMap<ServiceName, Arc<CacheSlot>>,
    next_sweep: Mutex<Instant>,
}

impl Resolver {
    pub fn new(authority: Arc<dyn Authority>, config: ResolverConfig) -> Self {
        let balancer = LoadBalancer::new(config.strategy);
        Self {
            authority,
            config,
            balancer,
            cache: DashMap::new(),
            next_sweep: Mutex::new(Instant::now()),
        }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    /// Number of service names currently holding a cache slot
    pub fn cached_services(&self) -> usize {
        self.cache.len()
    }

    /// Resolve a service name to its currently healthy instances.
    ///
    /// An empty answer from the authority is a transient [`NotFoundError`],
    /// never an empty success. When the authority cannot be reached an
    /// expired entry is returned with `stale` set, for at most `max_stale`
    /// past its expiry; each stale answer follows its own failed query.
    pub async fn resolve(&self, service: &ServiceName) -> Result<ResolutionResult, NotFoundError> {
        let slot = self.slot(service);

        let observed = {
            let state = slot.state.read().await;
            if let Some(answer) = state.fresh(service, Instant::now()) {
                return answer;
            }
            state.generation
        };

        let _refreshing = slot.refresh.lock().await;
        {
            let state = slot.state.read().await;
            if state.generation != observed {
                debug!(service = %service, "Reusing concurrent refresh");
                return state.last_outcome(service);
            }
        }

        self.refresh(service, &slot).await
    }

    /// Resolve and pick one instance with the configured strategy
    pub async fn resolve_one(&self, service: &ServiceName) -> Result<InstanceRecord, NotFoundError> {
        let result = self.resolve(service).await?;
        self.select(&result, &[])
            .ok_or_else(|| NotFoundError::no_healthy_instances(service))
    }

    /// Pick an instance from a resolution result, skipping `exclude`
    pub fn select(&self, result: &ResolutionResult, exclude: &[InstanceId]) -> Option<InstanceRecord> {
        self.balancer.select(&result.instances, exclude).cloned()
    }

    /// Forget whatever is cached for a service
    pub fn invalidate(&self, service: &ServiceName) {
        self.cache.remove(service);
    }

    fn slot(&self, service: &ServiceName) -> Arc<CacheSlot> {
        if let Some(slot) = self.cache.get(service) {
            return slot.clone();
        }
        let slot = self.cache.entry(service.clone()).or_default().clone();
        self.maybe_sweep();
        slot
    }

    /// Drop slots nobody is using that can no longer answer from cache.
    /// Runs on slot creation, at most once per [`SWEEP_INTERVAL`].
    fn maybe_sweep(&self) {
        let Ok(mut next_sweep) = self.next_sweep.try_lock() else {
            return;
        };
        let now = Instant::now();
        if now < *next_sweep {
            return;
        }
        *next_sweep = now + SWEEP_INTERVAL;

        let before = self.cache.len();
        let max_stale = self.config.max_stale;
        // Holding the shard lock keeps `slot()` from handing out new references meanwhile
        self.cache.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.state.try_read() {
                Ok(state) => !state.is_dead(now, max_stale),
                Err(_) => true,
            }
        });
        let swept = before.saturating_sub(self.cache.len());
        if swept > 0 {
            debug!(swept, remaining = self.cache.len(), "Swept dead resolver cache slots");
        }
    }

    async fn refresh(
        &self,
        service: &ServiceName,
        slot: &CacheSlot,
    ) -> Result<ResolutionResult, NotFoundError> {
        let queried = with_timeout(self.config.query_timeout, self.authority.query_healthy(service)).await;

        let now = Instant::now();
        let mut state = slot.state.write().await;
        state.generation += 1;

        match queried {
            Ok(instances) if !instances.is_empty() => {
                debug!(service = %service, instances = instances.len(), "Resolved service");
                let result = ResolutionResult::new(service.clone(), instances);
                state.entry = Some(CachedResult {
                    result: result.clone(),
                    expires_at: now + self.config.cache_ttl,
                });
                state.negative_until = None;
                state.last_refresh = Some(RefreshOutcome::Found);
                Ok(result)
            }
            Ok(_) => {
                debug!(service = %service, "No healthy instances");
                state.entry = None;
                state.negative_until =
                    (!self.config.negative_ttl.is_zero()).then(|| now + self.config.negative_ttl);
                state.last_refresh = Some(RefreshOutcome::Empty);
                Err(NotFoundError::no_healthy_instances(service))
            }
            Err(e) => {
                state.last_refresh = Some(RefreshOutcome::Failed);
                if let Some(cached) = &state.entry {
                    if cached.servable_stale(now, self.config.max_stale) {
                        warn!(service = %service, error = %e, "Authority query failed, serving stale entry");
                        return Ok(cached.result.clone().into_stale());
                    }
                    warn!(service = %service, error = %e, "Authority query failed, cached entry too old to serve");
                    state.entry = None;
                    return Err(NotFoundError::authority_unavailable(service));
                }
                warn!(service = %service, error = %e, "Authority query failed, nothing cached");
                Err(NotFoundError::authority_unavailable(service))
            }
        }
    }
}
