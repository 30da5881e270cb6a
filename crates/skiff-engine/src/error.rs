use skiff_core::provider::ProviderError;
use skiff_store::StoreError;

/// Infrastructure failures escaping the runner. Model and tool errors are
/// converted into events instead (the turn continues or ends cleanly); only
/// persistence-layer problems propagate as `Err`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
}
