//! Data-out contract: events the engine emits to its host.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so a host can
//! forward them across a process or language boundary as JSON.

pub mod events;
