pub mod settings;

pub use settings::{
    AgentsConfig, ArbiterConfig, BeadsConfig, CacheConfig, ProjectEntry, ProviderEntry,
    SecurityConfig, ServerConfig,
};
