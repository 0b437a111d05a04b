//! ptyhub-core: shared library for the ptyhub session service.
//!
//! Provides the error taxonomy, JSON API message types, and the credential
//! cipher used before anything touches durable storage.

pub mod cipher;
pub mod error;
pub mod messages;

// Re-export commonly used items at crate root.
pub use cipher::CredentialCipher;
pub use error::{HubError, HubResult};
pub use messages::{
    Credentials, OutputChunk, Request, Response, SessionSnapshot, SessionState, WorkspaceType,
};
