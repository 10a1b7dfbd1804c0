//! Common types for dkcloud: errors, retries, events and provider configuration

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod events;
pub mod retry;
pub mod telemetry;

pub use config::ProviderConfig;
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Prefix carried by provider IDs handed out for nodes (e.g. `clouddk://abc123`)
pub const PROVIDER_ID_PREFIX: &str = "clouddk://";

/// Default Cloud.dk API endpoint
pub const DEFAULT_API_ENDPOINT: &str = "https://api.cloud.dk/v1";

/// Default location for new backing instances
pub const DEFAULT_LOCATION: &str = "dk1";

/// Default OS template for new backing instances
pub const DEFAULT_TEMPLATE: &str = "ubuntu-18.04-x64";
