//! Host-side runtime core for serving NPU accelerator cards through an
//! out-of-process driver daemon.
//!
//! Three interlocked subsystems:
//!
//! - **Device manager** ([`manager`]): partitions physical cores into
//! execution groups per a user-supplied policy ([`config`]) and hands
//! them out to operator instances.
//! - **Per-device model scheduler** ([`device`], [`model`]): enforces the
//! at-most-one-running-model-per-execution-group rule and manages
//! load/unload/start/stop against the driver ([`driver`]).
//! - **Inference request pipeline** ([`operator`], [`runtime_io`],
//! [`tensor`], [`semaphore`]): shared-memory I/O ([`shm`]), admission
//! control, and batch splitting.
//!
//! [`profiler`] and [`signal`] are optional ambient hooks: a profiling
//! subprocess around each inference, and graceful teardown on
//! `SIGINT`/`SIGTERM`.

pub mod config;
pub mod device;
pub mod driver;
pub mod error;
pub mod manager;
pub mod model;
pub mod operator;
pub mod profiler;
pub mod runtime_io;
pub mod semaphore;
pub mod shm;
pub mod signal;
pub mod tensor;

pub use error::{Error, Result};
