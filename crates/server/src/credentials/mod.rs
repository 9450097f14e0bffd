//! Split-knowledge credential system: master key + HKDF derivation,
//! AES-256-GCM blobs, one-time entry sessions, the web entry surface,
//! and the server-side proxy.

pub mod crypto;
pub mod entry;
pub mod http;
pub mod proxy;
