//! Service registry: logical service name -> backend endpoints.
//!
//! Every request resolves through the registry, while membership only changes on config
//! reload or explicit `register` / `deregister` calls. The table is therefore an immutable
//! snapshot behind an [`ArcSwap`]; writers build a new table and swap it in, readers never
//! block. Endpoint health lives in atomics on [`Endpoint`] so health checks mutate state
//! without touching the table at all.
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use arc_swap::ArcSwap;

use crate::core::{
    backend::{BackendResult, BackendUrl, Endpoint, EndpointView},
    load_balancer::LoadBalancingStrategy,
};

type ServiceTable = BTreeMap<String, Vec<Arc<Endpoint>>>;

pub struct ServiceRegistry {
    services: ArcSwap<ServiceTable>,
    strategy: Box<dyn LoadBalancingStrategy>,
}

impl ServiceRegistry {
    /// Build a registry from the `[services]` section of the config.
    ///
    /// Endpoints sharing a URL across services share a single health record.
    pub fn from_config(
        services: &BTreeMap<String, Vec<String>>,
        strategy: Box<dyn LoadBalancingStrategy>,
    ) -> BackendResult<Self> {
        let table = build_table(services, &HashMap::new())?;
        Ok(Self {
            services: ArcSwap::from_pointee(table),
            strategy,
        })
    }

    /// Pick a healthy endpoint for `service`. Returns `None` for unknown services and for
    /// services whose endpoints are all unhealthy.
    pub fn resolve(&self, service: &str) -> Option<Arc<Endpoint>> {
        let table = self.services.load();
        let endpoints = table.get(service)?;
        let healthy: Vec<Arc<Endpoint>> = endpoints
            .iter()
            .filter(|endpoint| endpoint.is_healthy())
            .cloned()
            .collect();
        self.strategy.select_target(&healthy)
    }

    pub fn contains(&self, service: &str) -> bool {
        self.services.load().contains_key(service)
    }

    /// Add an endpoint to a service, creating the service if needed. Registering an
    /// endpoint that is already present is a no-op.
    pub fn register(&self, service: &str, url: BackendUrl) {
        self.services.rcu(|current| {
            let mut next = ServiceTable::clone(current);
            let existing = find_endpoint(current, &url);
            let endpoints = next.entry(service.to_string()).or_default();
            if !endpoints.iter().any(|endpoint| endpoint.url() == &url) {
                endpoints.push(existing.unwrap_or_else(|| Arc::new(Endpoint::new(url.clone()))));
            }
            next
        });
        tracing::info!(service = %service, backend = %url, "Registered backend endpoint");
    }

    /// Remove an endpoint from a service. A service left without endpoints is removed
    /// too. Returns whether anything was removed.
    pub fn deregister(&self, service: &str, url: &BackendUrl) -> bool {
        let mut removed = false;
        self.services.rcu(|current| {
            let mut next = ServiceTable::clone(current);
            removed = false;
            if let Some(endpoints) = next.get_mut(service) {
                let before = endpoints.len();
                endpoints.retain(|endpoint| endpoint.url() != url);
                removed = endpoints.len() != before;
                if endpoints.is_empty() {
                    next.remove(service);
                }
            }
            next
        });
        if removed {
            tracing::info!(service = %service, backend = %url, "Deregistered backend endpoint");
        }
        removed
    }

    /// Mark every endpoint with this URL healthy. Returns false if the URL is unknown.
    pub fn mark_healthy(&self, url: &str) -> bool {
        self.with_endpoint(url, |endpoint| endpoint.mark_healthy())
    }

    /// Mark every endpoint with this URL unhealthy. Returns false if the URL is unknown.
    pub fn mark_unhealthy(&self, url: &str) -> bool {
        self.with_endpoint(url, |endpoint| endpoint.mark_unhealthy())
    }

    fn with_endpoint(&self, url: &str, f: impl Fn(&Endpoint)) -> bool {
        let url = url.trim_end_matches('/');
        match self
            .endpoints()
            .into_iter()
            .find(|endpoint| endpoint.url().as_str() == url)
        {
            Some(endpoint) => {
                f(&endpoint);
                true
            }
            None => false,
        }
    }

    /// Replace the service table with a freshly loaded one. Endpoints that survive the
    /// reload keep their health state.
    pub fn reload(&self, services: &BTreeMap<String, Vec<String>>) -> BackendResult<()> {
        let mut outcome = Ok(());
        self.services.rcu(|current| {
            let known: HashMap<BackendUrl, Arc<Endpoint>> = current
                .values()
                .flatten()
                .map(|endpoint| (endpoint.url().clone(), endpoint.clone()))
                .collect();
            match build_table(services, &known) {
                Ok(next) => {
                    outcome = Ok(());
                    next
                }
                Err(err) => {
                    outcome = Err(err);
                    ServiceTable::clone(current)
                }
            }
        });
        outcome?;

        let table = self.services.load();
        tracing::info!(
            services = table.len(),
            endpoints = count_unique(&table),
            "Service registry reloaded"
        );
        Ok(())
    }

    /// All distinct endpoints, in service order.
    pub fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        let table = self.services.load();
        let mut seen = Vec::<Arc<Endpoint>>::new();
        for endpoint in table.values().flatten() {
            if !seen.iter().any(|e| Arc::ptr_eq(e, endpoint)) {
                seen.push(endpoint.clone());
            }
        }
        seen
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services.load().keys().cloned().collect()
    }

    /// Point-in-time view of every service and its endpoints.
    pub fn view(&self) -> BTreeMap<String, Vec<EndpointView>> {
        self.services
            .load()
            .iter()
            .map(|(name, endpoints)| {
                (
                    name.clone(),
                    endpoints.iter().map(|endpoint| endpoint.view()).collect(),
                )
            })
            .collect()
    }

    pub fn endpoint_count(&self) -> usize {
        count_unique(&self.services.load())
    }

    pub fn healthy_endpoint_count(&self) -> usize {
        self.endpoints()
            .iter()
            .filter(|endpoint| endpoint.is_healthy())
            .count()
    }
}

fn build_table(
    services: &BTreeMap<String, Vec<String>>,
    known: &HashMap<BackendUrl, Arc<Endpoint>>,
) -> BackendResult<ServiceTable> {
    let mut shared: HashMap<BackendUrl, Arc<Endpoint>> = HashMap::new();
    let mut table = ServiceTable::new();

    for (name, urls) in services {
        let mut endpoints: Vec<Arc<Endpoint>> = Vec::with_capacity(urls.len());
        for raw in urls {
            let url = BackendUrl::new(raw)?;
            if endpoints.iter().any(|endpoint| endpoint.url() == &url) {
                continue;
            }
            let endpoint = shared
                .entry(url.clone())
                .or_insert_with(|| {
                    known
                        .get(&url)
                        .cloned()
                        .unwrap_or_else(|| Arc::new(Endpoint::new(url.clone())))
                })
                .clone();
            endpoints.push(endpoint);
        }
        table.insert(name.clone(), endpoints);
    }

    Ok(table)
}

fn find_endpoint(table: &ServiceTable, url: &BackendUrl) -> Option<Arc<Endpoint>> {
    table
        .values()
        .flatten()
        .find(|endpoint| endpoint.url() == url)
        .cloned()
}

fn count_unique(table: &ServiceTable) -> usize {
    let mut urls: Vec<&str> = table
        .values()
        .flatten()
        .map(|endpoint| endpoint.url().as_str())
        .collect();
    urls.sort_unstable();
    urls.dedup();
    urls.len()
}
