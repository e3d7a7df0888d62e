//! # corebot
//!
//! Long-running network client daemon built around a minimal extensible
//! kernel: independently loadable modules cooperate through a shared event
//! scheduler and a named capability registry.
//!
//! ## Design Principles
//! * Single thread, cooperative: module code runs one entry point at a time and
//!   must never block; the scheduler's bounded readiness wait is the only
//!   suspension point.
//! * Explicit context: every kernel→module and module→module call carries the
//!   [`module_host::Context`] of the module being executed, which scopes config
//!   lookups, descriptor registration and callback ownership.
//! * Failures stay at module granularity: nothing below the scheduler aborts
//!   the process.
//!
//! ## Key Modules
//! * `config` – Scoped key/value configuration (INI-style file).
//! * `module_host` – Module kernel: loading, capability checks, context.
//! * `scheduler` – Timer ticks and descriptor readiness loop.
//! * `bus` – Ordered callback bus modules publish typed events on.
//! * `transport` – Connection lifecycle, backoff and line framing (`server`).
//! * `modules` – Built-in statically linked modules.
//! * `events` – Structured logging/events dispatcher.

pub mod bus;
pub mod config;
pub mod constants;
pub mod events;
pub mod module_host;
pub mod modules;
pub mod prelude;
pub mod scheduler;
pub mod transport;
