//! Message envelope and wire codec.
//!
//! Everything that crosses a connection is an [`Envelope`]: a uniform frame
//! carrying a kind discriminator, correlation metadata, an opaque JSON
//! payload, and optional room/error fields. [`codec`] turns envelopes into
//! JSON text and back, rejecting frames that lack the required fields.

pub mod codec;
pub mod envelope;

pub use envelope::{Envelope, EnvelopeKind, payload};
