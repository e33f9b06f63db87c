//! The remote build dispatch core.
//!
//! Given a build step and a chosen worker machine, [`Dispatcher::build_remote`]
//! opens a transport session, ships the input closure, drives the build over
//! the serve protocol, ingests the produced outputs into the destination
//! store, and reports the outcome as a [`RemoteResult`]. Failure history
//! feeds back into per-[`Machine`] health so flaky workers get backed off.
//!
//! The surrounding queue stays outside: it picks the machine, owns retry
//! policy, and consumes the result.

pub mod build;
pub mod closure;
pub mod connector;
pub mod counters;
pub mod dispatch;
pub mod error;
pub mod ingest;
pub mod log_file;
pub mod machine;
pub mod options;
pub mod result;
pub mod step;

pub use connector::{Connector, SshConnector};
pub use counters::{Counter, DispatchCounters, MaintainCount};
pub use dispatch::Dispatcher;
pub use error::DispatchError;
pub use machine::{ConnectInfo, Machine};
pub use options::{BuildOptions, DispatchConfig};
pub use result::{RemoteResult, StepStatus};
pub use step::{ActiveStep, Step, StepState};
