pub mod agent;
pub mod balancer;
pub mod discovery;
pub mod feed;
pub mod proxy;
pub mod reaper;
pub mod registry;
pub mod store;

pub use balancer::{BalancerPolicy, InFlightTracker, LoadBalancer};
pub use discovery::DiscoveryCache;
pub use feed::ChangeFeed;
pub use proxy::ProxyService;
pub use reaper::HealthReaper;
pub use registry::RegistryService;
pub use store::{InstanceStore, StoreBackend};
