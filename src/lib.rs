// Library exports for the stock metadata generation service

pub mod core;
pub mod middleware;
pub mod orchestration;
pub mod providers;
pub mod utils;

// Re-export commonly used types and functions
pub use crate::core::{
    config::Config,
    errors::{BatchError, ConfigError, PoolError, ProviderError},
    types::{
        BatchSummary, GenerateConfig, ImageInput, MediaKind, MetadataResult, ProgressSnapshot,
        PromptSettings, ProviderStats, SchedulingStrategy, StockMetadata,
    },
};

pub use crate::middleware::{Credential, CredentialPool, CredentialView, RateLimitPolicy, RateLimiter};

pub use crate::orchestration::{BatchOrchestrator, ItemCallback};

pub use crate::providers::{make_adapter, ProviderAdapter, ProviderKind};

pub use crate::utils::Metrics;
