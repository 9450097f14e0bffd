//! Channel protocol: the envelope wire format exchanged between the local
//! agent and the server.
//!
//! Every frame on the channel is an envelope: a kind tag, a unique
//! message id (transport-level dedupe only), a Unix-millisecond timestamp,
//! and a kind-specific payload. Request/response pairing uses correlation
//! ids *inside* payloads, never the envelope id.
//!
//! Payloads are direction-split: [`ClientPayload`] flows client → server,
//! [`ServerPayload`] flows server → client. Both serialize adjacently
//! tagged as `{ "type": ..., "payload": ... }`.

mod envelope;
mod invite;
mod types;

pub use envelope::{ClientEnvelope, ClientPayload, ServerEnvelope, ServerPayload};
pub use invite::{format_invite, is_invite_format, INVITE_PREFIX};
pub use types::*;
