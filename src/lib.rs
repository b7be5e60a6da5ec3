//! Session and streaming client for the Semki semantic employee directory.
//!
//! The [`Gateway`] attaches the stored credential to every call and renews it, once, for all
//! concurrent callers when the server rejects it.  The [`SearchSession`] turns a query into a
//! persisted chat and a stream of ranked [`SearchResult`]s.

// Public modules
pub mod auth;
pub mod chat;
pub mod config;
pub mod credentials;
pub mod error;
pub mod gateway;
pub mod observability;
pub mod search;
pub mod transport;
pub mod types;

// Re-exports
pub use auth::{LoginRequest, TokenResponse};
pub use chat::{ChatHistoryItem, ChatHistoryPage, ChatRecord, ChatSession, CreateChatRequest};
pub use config::{ClientConfig, SearchArgs};
pub use credentials::{
    Claims, Credential, CredentialStorage, CredentialStore, FileCredentialStorage,
    MemoryCredentialStorage, OrganizationRole, decode_claims,
};
pub use error::{Error, Result};
pub use gateway::{Gateway, LocationTracker, LoginRedirect};
pub use observability::register_biometrics;
pub use search::{FailureKind, SearchSession, SessionSnapshot, StreamState};
pub use transport::{ApiRequest, ApiResponse, HttpTransport, StreamResponse, Transport};
pub use types::{SearchFilters, SearchResult, UserRef, rank};
