//! Core traits and types for the eventum event-sourcing library.
//!
//! This crate provides the substrate for building domain aggregates whose
//! state is derived by folding an ordered history of immutable events:
//!
//! - [`aggregate`] - Aggregate roots, change tracking, and history replay
//! - [`event`] - Event values in decoded and wire form
//! - [`register`] - Reason-string registry mapping payloads to decoders
//! - [`codec`] - Serialization boundary (`Codec`, `JsonCodec`)
//! - [`store`] - Event-store boundary and the in-memory reference store
//! - [`snapshot`] - Snapshot boundary and the in-memory reference store
//! - [`repository`] - Save/load orchestration (`EventRepository`,
//!   `SnapshotRepository`)
//! - [`stream`] - Live pub/sub fan-out of saved events
//! - [`projection`] - Cursor-driven consumers, groups, and races
//! - [`cancel`] - Cooperative cancellation primitives
//!
//! Most users should depend on the `eventum` crate, which re-exports these
//! types with a flatter API surface.

pub mod aggregate;
pub mod cancel;
pub mod codec;
pub mod event;
pub mod projection;
pub mod register;
pub mod repository;
pub mod snapshot;
pub mod store;
pub mod stream;
