//! Keyed stores for the fleet: servers, workers, worker groups and the
//! HAProxy config records workers materialise on their targets.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use super::types::*;

pub trait FleetRegistry: Send + Sync {
    /// A task target is either a known server or a known worker group.
    fn target_exists(&self, target_id: &str) -> bool;

    fn list_servers(&self, limit: usize) -> Vec<Server>;
    fn get_server(&self, id: &str) -> FleetResult<Server>;

    fn list_workers(&self, limit: usize) -> Vec<WorkerNode>;
    fn get_worker(&self, id: &str) -> FleetResult<WorkerNode>;

    fn list_groups(&self, limit: usize) -> Vec<WorkersGroup>;
    fn get_group(&self, id: &str) -> FleetResult<WorkersGroup>;
    fn create_group(&self, group: NewWorkersGroup) -> FleetResult<WorkersGroup>;
    fn update_group(&self, id: &str, update: WorkersGroupUpdate) -> FleetResult<WorkersGroup>;
    fn delete_group(&self, id: &str) -> FleetResult<()>;
    fn remove_group_worker(&self, id: &str, selector: &WorkerSelector) -> FleetResult<WorkersGroup>;

    fn list_haproxy_configs(&self, limit: usize) -> Vec<HaproxyConfig>;
    fn get_haproxy_config(&self, id: &str) -> FleetResult<HaproxyConfig>;
    fn upsert_haproxy_config(&self, config: HaproxyConfig);
    fn remove_haproxy_config(&self, id: &str) -> FleetResult<HaproxyConfig>;
}

#[derive(Debug, Default)]
pub struct InMemoryFleet {
    servers: DashMap<String, Server>,
    workers: DashMap<String, WorkerNode>,
    groups: DashMap<String, WorkersGroup>,
    haproxy_configs: DashMap<String, HaproxyConfig>,
    next_group_sys_id: AtomicU64,
}

fn not_found(kind: &'static str, id: &str) -> FleetError {
    FleetError::NotFound {
        kind,
        id: id.to_string(),
    }
}

fn sorted_by<T: Clone, K: Ord>(map: &DashMap<String, T>, limit: usize, key: impl Fn(&T) -> K) -> Vec<T> {
    let mut items: Vec<T> = map.iter().map(|entry| entry.value().clone()).collect();
    items.sort_by_key(|item| key(item));
    items.truncate(limit);
    items
}

impl InMemoryFleet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: FleetSnapshot) -> FleetResult<Self> {
        let fleet = Self::new();
        for server in snapshot.servers {
            fleet.add_server(server);
        }
        for worker in snapshot.workers {
            fleet.add_worker(worker);
        }
        for group in snapshot.groups {
            fleet.create_group(group)?;
        }
        for config in snapshot.haproxy_configs {
            fleet.upsert_haproxy_config(config);
        }
        Ok(fleet)
    }

    pub fn add_server(&self, server: Server) {
        tracing::debug!("Registered server {} ({})", server.server_name, server.id);
        self.servers.insert(server.id.clone(), server);
    }

    pub fn add_worker(&self, worker: WorkerNode) {
        tracing::debug!("Registered worker {} ({})", worker.server_name, worker.id);
        self.workers.insert(worker.id.clone(), worker);
    }

    fn validate_members(&self, server_id: &str, workers: &[String]) -> FleetResult<()> {
        if !self.servers.contains_key(server_id) {
            return Err(not_found("server", server_id));
        }
        if let Some(missing) = workers.iter().find(|id| !self.workers.contains_key(id.as_str())) {
            return Err(not_found("worker", missing));
        }
        Ok(())
    }
}

impl FleetRegistry for InMemoryFleet {
    fn target_exists(&self, target_id: &str) -> bool {
        self.servers.contains_key(target_id) || self.groups.contains_key(target_id)
    }

    fn list_servers(&self, limit: usize) -> Vec<Server> {
        sorted_by(&self.servers, limit, |s| s.server_name.clone())
    }

    fn get_server(&self, id: &str) -> FleetResult<Server> {
        self.servers
            .get(id)
            .map(|s| s.value().clone())
            .ok_or_else(|| not_found("server", id))
    }

    fn list_workers(&self, limit: usize) -> Vec<WorkerNode> {
        sorted_by(&self.workers, limit, |w| w.server_name.clone())
    }

    fn get_worker(&self, id: &str) -> FleetResult<WorkerNode> {
        self.workers
            .get(id)
            .map(|w| w.value().clone())
            .ok_or_else(|| not_found("worker", id))
    }

    fn list_groups(&self, limit: usize) -> Vec<WorkersGroup> {
        sorted_by(&self.groups, limit, |g| g.name.clone())
    }

    fn get_group(&self, id: &str) -> FleetResult<WorkersGroup> {
        self.groups
            .get(id)
            .map(|g| g.value().clone())
            .ok_or_else(|| not_found("group", id))
    }

    fn create_group(&self, group: NewWorkersGroup) -> FleetResult<WorkersGroup> {
        let name = group.name.trim();
        if name.is_empty() {
            return Err(FleetError::MissingParam("name"));
        }
        let server_id = group.server_id.trim();
        if server_id.is_empty() {
            return Err(FleetError::MissingParam("server_id"));
        }
        let workers: Vec<String> = group.workers.iter().map(|w| w.trim().to_string()).collect();
        self.validate_members(server_id, &workers)?;

        let created = WorkersGroup {
            id: uuid::Uuid::new_v4().to_string(),
            sys_id: self.next_group_sys_id.fetch_add(1, Ordering::SeqCst) + 1,
            name: name.to_string(),
            server_id: server_id.to_string(),
            workers,
        };
        self.groups.insert(created.id.clone(), created.clone());
        tracing::info!("Created workers group {} ({})", created.name, created.id);
        Ok(created)
    }

    fn update_group(&self, id: &str, update: WorkersGroupUpdate) -> FleetResult<WorkersGroup> {
        // Merge under the entry guard so a concurrent remove-worker is not lost.
        let mut stored = self.groups.get_mut(id).ok_or_else(|| not_found("group", id))?;
        let mut current = stored.value().clone();

        if let Some(name) = update.name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            current.name = name.to_string();
        }
        if let Some(server_id) = update.server_id.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            current.server_id = server_id.to_string();
        }
        if let Some(workers) = update.workers.filter(|w| !w.is_empty()) {
            current.workers = workers.iter().map(|w| w.trim().to_string()).collect();
        }
        self.validate_members(&current.server_id, &current.workers)?;

        *stored = current.clone();
        Ok(current)
    }

    fn delete_group(&self, id: &str) -> FleetResult<()> {
        self.groups
            .remove(id)
            .map(|(_, group)| tracing::info!("Removed workers group {} ({})", group.name, id))
            .ok_or_else(|| not_found("group", id))
    }

    fn remove_group_worker(&self, id: &str, selector: &WorkerSelector) -> FleetResult<WorkersGroup> {
        let mut group = self.groups.get_mut(id).ok_or_else(|| not_found("group", id))?;

        let position = match (&selector.name, selector.index) {
            (Some(name), _) => group.workers.iter().position(|worker_id| {
                worker_id == name
                    || self
                        .workers
                        .get(worker_id)
                        .is_some_and(|w| &w.server_name == name)
            }),
            (None, Some(index)) => (index < group.workers.len()).then_some(index),
            (None, None) => return Err(FleetError::MissingParam("name")),
        };

        let position = position.ok_or_else(|| {
            FleetError::InvalidParam(format!("no such worker in group \"{}\"", id))
        })?;
        let removed = group.workers.remove(position);
        tracing::info!("Removed worker {} from group {}", removed, id);
        Ok(group.clone())
    }

    fn list_haproxy_configs(&self, limit: usize) -> Vec<HaproxyConfig> {
        sorted_by(&self.haproxy_configs, limit, |c| (c.order_num.unwrap_or(0), c.name.clone()))
    }

    fn get_haproxy_config(&self, id: &str) -> FleetResult<HaproxyConfig> {
        self.haproxy_configs
            .get(id)
            .map(|c| c.value().clone())
            .ok_or_else(|| not_found("HAProxy config", id))
    }

    fn upsert_haproxy_config(&self, config: HaproxyConfig) {
        self.haproxy_configs.insert(config.id.clone(), config);
    }

    fn remove_haproxy_config(&self, id: &str) -> FleetResult<HaproxyConfig> {
        self.haproxy_configs
            .remove(id)
            .map(|(_, config)| config)
            .ok_or_else(|| not_found("HAProxy config", id))
    }
}
