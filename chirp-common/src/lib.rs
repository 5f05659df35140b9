//! chirp-common - shared plumbing for the Chirp services
//!
//! Holds the pieces both the Capture Coordinator and any future sibling
//! service need to agree on: the event vocabulary and per-user event
//! bus, and the injected clock / id sources used so tests can pin time
//! and identity.

pub mod events;
pub mod ids;
pub mod time;
