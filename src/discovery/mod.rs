pub mod service_discovery;

pub use service_discovery::{
    ServiceChangeEvent, ServiceChangeReceiver, ServiceDiscovery, StaticDiscovery,
};
