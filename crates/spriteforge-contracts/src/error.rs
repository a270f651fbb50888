use thiserror::Error;

/// A required credential or setting is missing. Fatal for the classifier,
/// non-fatal for a single provider (it is simply not registered).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("configuration error: {0}")]
pub struct ConfigurationError(pub String);

/// A single remote generation call failed: transport error, non-2xx status,
/// or a malformed/empty/undecodable response body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("provider error: {0}")]
pub struct ProviderError(pub String);

/// A raster image could not be normalized (undecodable or degenerate input).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("image processing error: {0}")]
pub struct ImageProcessingError(pub String);

/// Zero adapters were registered when a generation request was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no image providers available; configure at least one provider API key")]
pub struct NoProvidersAvailable;
