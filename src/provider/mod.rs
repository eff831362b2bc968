pub mod client;
pub mod complexity;
pub mod dry_run;
pub mod scorer;
pub mod types;

pub use client::{ChatProvider, ChunkResult, OpenAiClient};
pub use complexity::{is_model_sufficient, ComplexityEstimator, ComplexityLevel, ModelTier};
pub use dry_run::DryRunProvider;
pub use scorer::{ProviderMetrics, ProviderScorer};
pub use types::{
    ChatChoice, ChatMessage, ChatRequest, ChatResponse, ProviderSpec, StreamChoice, StreamChunk,
    StreamDelta, Usage,
};
