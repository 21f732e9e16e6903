pub mod backend;
pub mod cache;
pub mod error;
pub mod forwarder;
pub mod gateway;
pub mod load_balancer;
pub mod pipeline;
pub mod rate_limiter;
pub mod registry;

pub use cache::ResponseCache;
pub use error::GatewayError;
pub use gateway::GatewayService;
pub use load_balancer::LoadBalancerFactory;
pub use pipeline::RequestContext;
pub use rate_limiter::SlidingWindowLimiter;
pub use registry::ServiceRegistry;
