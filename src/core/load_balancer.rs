use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use rand::Rng;

use crate::{config::LoadBalanceStrategy, core::backend::Endpoint};

/// Trait defining the interface for load balancing strategies.
///
/// Strategies only ever see the healthy subset of a service's endpoints; filtering is
/// done by the registry before selection.
pub trait LoadBalancingStrategy: Send + Sync + 'static {
    /// Select a target from a list of candidates
    fn select_target(&self, targets: &[Arc<Endpoint>]) -> Option<Arc<Endpoint>>;
    /// Create a new instance of this strategy as a boxed trait object
    fn boxed(self) -> Box<dyn LoadBalancingStrategy>
    where
        Self: Sized,
    {
        Box::new(self)
    }
}

/// Round-robin load balancing strategy
pub struct RoundRobinStrategy {
    counter: AtomicUsize,
}

impl Default for RoundRobinStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl LoadBalancingStrategy for RoundRobinStrategy {
    fn select_target(&self, targets: &[Arc<Endpoint>]) -> Option<Arc<Endpoint>> {
        if targets.is_empty() {
            return None;
        }
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        Some(targets[count % targets.len()].clone())
    }
}

/// Uniform random selection
pub struct RandomStrategy;

impl Default for RandomStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl RandomStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancingStrategy for RandomStrategy {
    fn select_target(&self, targets: &[Arc<Endpoint>]) -> Option<Arc<Endpoint>> {
        if targets.is_empty() {
            return None;
        }
        let index = rand::rng().random_range(0..targets.len());
        Some(targets[index].clone())
    }
}

/// Factory for creating load balancing strategies from configuration
pub struct LoadBalancerFactory;

impl LoadBalancerFactory {
    pub fn create_strategy(strategy: &LoadBalanceStrategy) -> Box<dyn LoadBalancingStrategy> {
        match strategy {
            LoadBalanceStrategy::RoundRobin => RoundRobinStrategy::new().boxed(),
            LoadBalanceStrategy::Random => RandomStrategy::new().boxed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::backend::BackendUrl;

    fn endpoints(urls: &[&str]) -> Vec<Arc<Endpoint>> {
        urls.iter()
            .map(|u| Arc::new(Endpoint::new(BackendUrl::new(u).unwrap())))
            .collect()
    }

    fn url_of(endpoint: Option<Arc<Endpoint>>) -> String {
        endpoint.unwrap().url().to_string()
    }

    #[test]
    fn test_round_robin_strategy() {
        let strategy = RoundRobinStrategy::new();
        let targets = endpoints(&["http://s1", "http://s2", "http://s3"]);

        assert_eq!(url_of(strategy.select_target(&targets)), "http://s1");
        assert_eq!(url_of(strategy.select_target(&targets)), "http://s2");
        assert_eq!(url_of(strategy.select_target(&targets)), "http://s3");
        assert_eq!(url_of(strategy.select_target(&targets)), "http://s1"); // Wraps around
    }

    #[test]
    fn test_round_robin_empty_targets() {
        let strategy = RoundRobinStrategy::new();
        assert!(strategy.select_target(&[]).is_none());
    }

    #[test]
    fn test_random_strategy_picks_from_targets() {
        let strategy = RandomStrategy::new();
        let targets = endpoints(&["http://s1", "http://s2", "http://s3"]);

        for _ in 0..50 {
            let selected = url_of(strategy.select_target(&targets));
            assert!(targets.iter().any(|t| t.url().as_str() == selected));
        }
    }

    #[test]
    fn test_random_strategy_empty_targets() {
        let strategy = RandomStrategy::new();
        assert!(strategy.select_target(&[]).is_none());
    }

    #[test]
    fn test_load_balancer_factory() {
        let targets = endpoints(&["http://s1", "http://s2"]);

        let rr_strategy = LoadBalancerFactory::create_strategy(&LoadBalanceStrategy::RoundRobin);
        assert!(rr_strategy.select_target(&targets).is_some());

        let random_strategy = LoadBalancerFactory::create_strategy(&LoadBalanceStrategy::Random);
        assert!(random_strategy.select_target(&targets).is_some());
    }
}
