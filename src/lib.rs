// Configuration (TOML file + env overrides)
pub mod config;

// Typed error taxonomy
pub mod error;

// Structured observability events
pub mod events;

// Encrypted credential storage
pub mod credentials;

// Remote OAuth token endpoint
pub mod provider;

// Explicit retry/backoff policy
pub mod retry;

// Refresh-or-fail decisions for a single credential
pub mod refresh;

// User-status collaborator
pub mod users;

// Public surface used by request handlers and disconnect flows
pub mod service;

pub use config::KeeperConfig;
pub use credentials::{Credential, CredentialRecord, CredentialStore, TokenBundle};
pub use error::{ConnectError, FailureKind, ProviderError, RefreshError, StoreError};
pub use events::{CredentialEvent, EventSink, TracingSink};
pub use provider::TokenProvider;
pub use refresh::{RefreshCoordinator, RefreshOutcome};
pub use retry::RetryPolicy;
pub use service::CredentialService;
pub use users::UserDirectory;
