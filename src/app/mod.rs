pub mod config;
pub mod state;

pub use config::{AppConfig, BreakerConfig, CatalogConfig, LedgerBackend, ProviderConfig, QuotaConfig};
pub use state::AppState;
