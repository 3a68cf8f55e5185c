//! The staged request processing pipeline.
//!
//! Every request becomes a [`ProgressTask`] that the [`ServiceEngine`] drives through the
//! seven [`Stage`]s. Each stage has a [`ServiceGroup`] of [`Service`]s sorted by priority:
//!
//! ```text
//! ReadRequest -> ParseRequest -> CreateDocument -> ProcessDocument
//!             -> CreateResponse -> SendResponse -> Cleanup
//! ```
//!
//! A service may route its task forward by setting the next stage, or end the current stage
//! with [`Outcome::Abort`]. Services of different tasks share nothing but their own state; the
//! services of one task communicate through the task's [`Document`].

mod document;
mod engine;
mod group;
mod monitor;
mod service;
mod stage;
mod task;

pub use document::Document;
pub use engine::{ChainOutcome, ConnectionTracker, ServiceEngine};
pub use group::{ServiceEntry, ServiceGroup, ServiceId, Services};
pub use monitor::{Monitor, Watch, WatchId};
pub use service::{Outcome, Service, ServiceData};
pub use stage::Stage;
pub use task::{ProgressTask, SwitchProtocol};

#[cfg(test)]
pub(crate) use task::tests as task_tests;
