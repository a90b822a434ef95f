//! Resource proxy registry
//!
//! Tracks configured resource managers, the running instances of their proxy
//! processes and the external resources (queue groups, gateways to other
//! domains) that announce themselves at runtime. Instances live in one arena
//! keyed by [`InstanceId`]; proxies refer to them by id only.

use crate::config::{ProxyConfig, ResourceProperty};
use crate::error::{CoordinatorError, Result};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{Duration, Instant};
use tmx_common::{Pid, ProcessHandle, ResourceId, Xid};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instance-{}", self.0)
    }
}

/// Lifecycle of a proxy instance. An instance that is not in the registry
/// is absent. `Shutdown` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Process spawned, resource not opened yet
    Started,
    Idle,
    Busy,
    StartupError,
    Shutdown,
}

/// Round trip times of requests served by an instance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Statistics {
    pub min: Option<Duration>,
    pub max: Duration,
    pub total: Duration,
    pub invoked: u64,
}

impl Statistics {
    pub fn record(&mut self, elapsed: Duration) {
        self.min = Some(self.min.map_or(elapsed, |min| min.min(elapsed)));
        self.max = self.max.max(elapsed);
        self.total += elapsed;
        self.invoked += 1;
    }

    pub fn merge(&mut self, other: &Statistics) {
        self.min = match (self.min, other.min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max = self.max.max(other.max);
        self.total += other.total;
        self.invoked += other.invoked;
    }

    pub fn average(&self) -> Option<Duration> {
        u32::try_from(self.invoked)
            .ok()
            .filter(|invoked| *invoked > 0)
            .map(|invoked| self.total / invoked)
    }
}

/// One running proxy process
#[derive(Debug, Clone)]
pub struct Instance {
    pub id: InstanceId,
    pub proxy: ResourceId,
    pub process: ProcessHandle,
    state: InstanceState,
    current: Option<(Xid, Instant)>,
    statistics: Statistics,
}

impl Instance {
    pub fn state(&self) -> InstanceState {
        self.state
    }

    /// Transaction the instance is working on, if busy
    pub fn current(&self) -> Option<&Xid> {
        self.current.as_ref().map(|(xid, _)| xid)
    }

    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    fn set_state(&mut self, state: InstanceState) {
        if self.state == InstanceState::Shutdown {
            tracing::debug!(
                "[{}] {} is shutting down, ignoring {:?}",
                self.proxy,
                self.id,
                state
            );
            return;
        }
        self.state = state;
    }
}

/// A configured resource manager
#[derive(Debug, Clone)]
pub struct Proxy {
    pub id: ResourceId,
    pub config: ProxyConfig,
    pub property: ResourceProperty,
    instances: Vec<InstanceId>,
    cursor: usize,
    statistics: Statistics,
}

impl Proxy {
    pub fn instances(&self) -> &[InstanceId] {
        &self.instances
    }

    /// Statistics of instances that have gone away
    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }
}

/// A resource outside the configuration, reached through its own process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct External {
    pub id: ResourceId,
    pub process: ProcessHandle,
}

/// What a process exit took away
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detached {
    pub resource: ResourceId,
    /// `None` for external resources
    pub instance: Option<InstanceId>,
    /// Transaction the instance was serving when it died
    pub in_flight: Option<Xid>,
}

/// Registry of resource proxies, their instances and external resources
pub struct ResourceRegistry {
    catalogue: HashMap<String, ResourceProperty>,
    proxies: BTreeMap<ResourceId, Proxy>,
    instances: HashMap<InstanceId, Instance>,
    externals: BTreeMap<ResourceId, External>,
    next_proxy: i64,
    next_external: i64,
    next_instance: u64,
}

impl ResourceRegistry {
    pub fn new(catalogue: impl IntoIterator<Item = ResourceProperty>) -> Self {
        Self {
            catalogue: catalogue
                .into_iter()
                .map(|property| (property.key.clone(), property))
                .collect(),
            proxies: BTreeMap::new(),
            instances: HashMap::new(),
            externals: BTreeMap::new(),
            next_proxy: 1,
            next_external: -1,
            next_instance: 1,
        }
    }

    // === PROXIES ===

    /// Add a configured resource manager. Its key must be in the catalogue.
    pub fn register_proxy(&mut self, config: ProxyConfig) -> Result<ResourceId> {
        let property = self
            .catalogue
            .get(&config.key)
            .cloned()
            .ok_or_else(|| CoordinatorError::UnknownResourceKey(config.key.clone()))?;

        let id = ResourceId(self.next_proxy);
        self.next_proxy += 1;

        tracing::info!("[{}] registered resource '{}' ({})", id, config.name, config.key);

        self.proxies.insert(
            id,
            Proxy {
                id,
                config,
                property,
                instances: Vec::new(),
                cursor: 0,
                statistics: Statistics::default(),
            },
        );
        Ok(id)
    }

    pub fn proxy(&self, id: ResourceId) -> Option<&Proxy> {
        self.proxies.get(&id)
    }

    pub fn proxies(&self) -> impl Iterator<Item = &Proxy> {
        self.proxies.values()
    }

    /// Statistics of a proxy: instances that have gone away plus the live ones
    pub fn proxy_statistics(&self, id: ResourceId) -> Option<Statistics> {
        let proxy = self.proxies.get(&id)?;
        let mut statistics = proxy.statistics.clone();
        for instance in proxy.instances.iter().filter_map(|i| self.instances.get(i)) {
            statistics.merge(&instance.statistics);
        }
        Some(statistics)
    }

    /// Resource is a configured proxy or a live external resource
    pub fn contains(&self, id: ResourceId) -> bool {
        self.proxies.contains_key(&id) || self.externals.contains_key(&id)
    }

    // === INSTANCES ===

    /// Record a proxy process that has been spawned but has not announced
    /// readiness yet. It gets no work until it does.
    pub fn start_instance(
        &mut self,
        proxy: ResourceId,
        process: ProcessHandle,
    ) -> Result<InstanceId> {
        if let Some(id) = self.instance_of(process.pid, proxy) {
            return Ok(id);
        }
        self.insert_instance(proxy, process, InstanceState::Started)
    }

    /// Attach a proxy process that announced readiness. The instance becomes
    /// idle. A second announcement from the same process returns the same
    /// instance and leaves a busy instance busy: it still owes a reply.
    pub fn attach_instance(
        &mut self,
        proxy: ResourceId,
        process: ProcessHandle,
    ) -> Result<InstanceId> {
        if let Some(id) = self.instance_of(process.pid, proxy) {
            if let Some(instance) = self.instances.get_mut(&id) {
                if instance.state == InstanceState::Busy {
                    tracing::warn!(
                        "[{}] {} announced readiness while serving {:?}",
                        proxy,
                        id,
                        instance.current()
                    );
                } else {
                    instance.set_state(InstanceState::Idle);
                }
            }
            return Ok(id);
        }
        self.insert_instance(proxy, process, InstanceState::Idle)
    }

    fn insert_instance(
        &mut self,
        proxy: ResourceId,
        process: ProcessHandle,
        state: InstanceState,
    ) -> Result<InstanceId> {
        let entry = self
            .proxies
            .get_mut(&proxy)
            .ok_or(CoordinatorError::UnknownResource(proxy))?;

        let id = InstanceId(self.next_instance);
        self.next_instance += 1;
        entry.instances.push(id);

        self.instances.insert(
            id,
            Instance {
                id,
                proxy,
                process,
                state,
                current: None,
                statistics: Statistics::default(),
            },
        );

        tracing::debug!("[{}] attached {} ({}) {:?}", proxy, id, process, state);
        Ok(id)
    }

    pub fn instance(&self, id: InstanceId) -> Option<&Instance> {
        self.instances.get(&id)
    }

    /// Instance of `proxy` running in process `pid`
    pub fn instance_of(&self, pid: Pid, proxy: ResourceId) -> Option<InstanceId> {
        self.proxies.get(&proxy).and_then(|entry| {
            entry
                .instances
                .iter()
                .copied()
                .find(|id| self.instances.get(id).is_some_and(|i| i.process.pid == pid))
        })
    }

    pub fn mark_startup_error(&mut self, id: InstanceId) -> Result<()> {
        let instance = self.instance_mut(id)?;
        tracing::error!("[{}] {} failed to open its resource", instance.proxy, id);
        instance.current = None;
        instance.set_state(InstanceState::StartupError);
        Ok(())
    }

    /// The instance has been handed a request for `xid`
    pub fn mark_busy(&mut self, id: InstanceId, xid: Xid, now: Instant) -> Result<()> {
        let instance = self.instance_mut(id)?;
        if instance.state != InstanceState::Idle {
            tracing::warn!(
                "[{}] {} marked busy while {:?}",
                instance.proxy,
                id,
                instance.state
            );
        }
        instance.set_state(InstanceState::Busy);
        instance.current = Some((xid, now));
        Ok(())
    }

    /// The instance replied. Returns the transaction it had been serving.
    pub fn mark_idle(&mut self, id: InstanceId, now: Instant) -> Result<Option<Xid>> {
        let instance = self.instance_mut(id)?;
        let current = instance.current.take();
        if let Some((_, since)) = &current {
            instance.statistics.record(now.saturating_duration_since(*since));
        }
        instance.set_state(InstanceState::Idle);
        Ok(current.map(|(xid, _)| xid))
    }

    pub fn shutdown_instance(&mut self, id: InstanceId) -> Result<()> {
        let instance = self.instance_mut(id)?;
        instance.state = InstanceState::Shutdown;
        Ok(())
    }

    /// Put every instance into shutdown
    pub fn shutdown_all(&mut self) {
        for instance in self.instances.values_mut() {
            instance.state = InstanceState::Shutdown;
        }
    }

    /// One idle instance of `proxy`, rotating through instances so work is
    /// spread across them. `None` if every instance is busy or none is
    /// attached.
    pub fn find_idle_instance(&mut self, proxy: ResourceId) -> Option<InstanceId> {
        let entry = self.proxies.get_mut(&proxy)?;
        let count = entry.instances.len();
        for offset in 0..count {
            let index = (entry.cursor + offset) % count;
            let id = entry.instances[index];
            if self
                .instances
                .get(&id)
                .is_some_and(|i| i.state == InstanceState::Idle)
            {
                entry.cursor = (index + 1) % count;
                return Some(id);
            }
        }
        None
    }

    /// Some live instance of `proxy` is serving `xid`
    pub fn serving(&self, proxy: ResourceId, xid: &Xid) -> bool {
        self.proxies.get(&proxy).is_some_and(|entry| {
            entry
                .instances
                .iter()
                .filter_map(|id| self.instances.get(id))
                .any(|instance| instance.current() == Some(xid))
        })
    }

    /// Remove everything belonging to a process that exited
    pub fn detach_on_exit(&mut self, pid: Pid) -> Vec<Detached> {
        let mut detached = Vec::new();

        let dead: Vec<InstanceId> = self
            .instances
            .values()
            .filter(|instance| instance.process.pid == pid)
            .map(|instance| instance.id)
            .collect();

        for id in dead {
            let Some(instance) = self.instances.remove(&id) else {
                continue;
            };

            if instance.state == InstanceState::Shutdown {
                tracing::info!("[{}] {} exited after shutdown", instance.proxy, id);
            } else {
                tracing::error!("[{}] {} ({}) died", instance.proxy, id, instance.process);
            }

            if let Some(proxy) = self.proxies.get_mut(&instance.proxy) {
                proxy.instances.retain(|other| *other != id);
                proxy.cursor = 0;
                proxy.statistics.merge(&instance.statistics);
            }

            detached.push(Detached {
                resource: instance.proxy,
                instance: Some(id),
                in_flight: instance.current.map(|(xid, _)| xid),
            });
        }

        let gone: Vec<ResourceId> = self
            .externals
            .values()
            .filter(|external| external.process.pid == pid)
            .map(|external| external.id)
            .collect();

        for id in gone {
            self.externals.remove(&id);
            tracing::warn!("[{}] external resource process {} exited", id, pid);
            detached.push(Detached {
                resource: id,
                instance: None,
                in_flight: None,
            });
        }

        detached
    }

    // === EXTERNAL RESOURCES ===

    /// Id for a process acting as its own resource. The same process always
    /// gets the same id.
    pub fn register_external(&mut self, process: ProcessHandle) -> ResourceId {
        if let Some(external) = self.externals.values().find(|e| e.process == process) {
            return external.id;
        }

        let id = ResourceId(self.next_external);
        self.next_external -= 1;
        self.externals.insert(id, External { id, process });

        tracing::debug!("[{}] registered external resource {}", id, process);
        id
    }

    pub fn external(&self, id: ResourceId) -> Option<&External> {
        self.externals.get(&id)
    }

    fn instance_mut(&mut self, id: InstanceId) -> Result<&mut Instance> {
        self.instances
            .get_mut(&id)
            .ok_or(CoordinatorError::UnknownInstance(id.0))
    }
}
