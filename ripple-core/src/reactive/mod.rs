//! Reactive Primitives
//!
//! This module implements the reactive substrate the synchronization engine
//! mirrors its entries into: cells, effects, and the runtime that schedules
//! their notifications.
//!
//! # Concepts
//!
//! ## Cells
//!
//! A Cell is a container for mutable state. When a cell's value is read
//! within a tracking context (an effect), the cell registers itself as a
//! dependency. When the value changes, all observers are notified.
//!
//! ## Effects
//!
//! An Effect is a side-effecting computation that runs whenever its
//! dependencies change. Effects are how UI code consumes synchronized
//! values, and how the event log decides when to hold a live subscription.
//!
//! ## Runtime
//!
//! The runtime batches notifications and defers observer hooks until the
//! current reactive pass has finished.
//!
//! # Implementation Notes
//!
//! The reactive system uses a thread-local tracking context to detect
//! dependencies automatically. When a cell is read, we check if there is an
//! active tracking context and, if so, record the dependency.

mod cell;
mod context;
mod effect;
mod runtime;
mod subscriber;

pub use cell::{Cell, Observable, ObserverHooks};
pub use context::{Dependency, ReactiveContext};
pub use effect::Effect;
pub use runtime::Runtime;
pub use subscriber::{Subscriber, SubscriberId};
