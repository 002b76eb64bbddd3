use common::ConfigError;

/// Run-level failures, each naming the stage it came from.
///
/// Per-article stage-1 failures are not errors: they are recorded on the
/// corresponding `ArticleSummary` and only tallied.
#[derive(Debug, thiserror::Error)]
pub enum DigestError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("fetch articles: source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("stage 1: completion endpoint unusable: {0}")]
    SummarizationUnavailable(String),

    #[error("stage 2: aggregation failed: {0}")]
    AggregationFailed(String),

    #[error("deliver: {0}")]
    DeliveryFailed(String),

    #[error("persist: {0}")]
    PersistenceFailed(String),

    #[error("run cancelled before completion")]
    Cancelled,
}
