//! # Race Coordination Engine
//!
//! This library implements the per-peer coordination engine for multiplayer
//! typing races run over a shared pub/sub room channel, with no central
//! server. Every peer holds a replica of the room state and derives one
//! consistent view from two independently-synchronizing sources: presence
//! snapshots (full membership with per-member telemetry) and broadcast
//! events (ordered per sender, echoed back to the sender, delivered
//! at-least-once).
//!
//! ## Architecture Overview
//!
//! The engine is synchronous and deterministic. It consumes decoded
//! events, presence snapshots, local UI actions and explicit `now_ms`
//! timestamps, and queues its side effects (broadcasts and presence
//! announcements) in an outbox that a transport driver drains. Timers are
//! plain deadline fields fired from [`RaceEngine::tick`], so the whole
//! state machine can be driven with simulated time in tests.
//!
//! ### Host role
//!
//! One peer acts as host: it mints the room's join key, admits joiners,
//! starts races, and keeps an authoritative copy of the race data that
//! answers late-joiner state syncs. The role survives disconnection
//! through a durable "was host" marker (instant reclamation) and a
//! deterministic failover election every peer computes independently.
//!
//! ### Module Organization
//!
//! - [`race`]: the [`RaceEngine`] core, lifecycle and local actions
//! - [`presence`]: snapshot reconciliation and departure handling
//! - [`router`]: broadcast event dispatch
//! - [`merge`]: per-field monotonic merge rules
//! - [`admission`]: racer/spectator classification and name dedup
//! - [`election`]: host failover countdown, reclamation and handoff
//! - [`results`]: progressive ranked standings and aggregates
//! - [`share`]: compact shareable result-code encoding
//! - [`session`], [`store`]: identity, tokens and durable session keys

pub mod admission;
pub mod election;
pub mod merge;
pub mod presence;
pub mod race;
pub mod results;
pub mod router;
pub mod session;
pub mod share;
pub mod store;

pub use election::FailoverState;
pub use race::{ChatLog, EngineError, Outbound, PendingStats, RaceEngine, StatsReply};
pub use results::RaceSummary;
pub use session::JoinIntent;
pub use share::ShareCode;
pub use store::{MemoryStore, SessionStore};
