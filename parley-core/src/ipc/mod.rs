//! Event types a host forwards to its UI.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so they can be
//! emitted as JSON without a translation layer.

pub mod events;
