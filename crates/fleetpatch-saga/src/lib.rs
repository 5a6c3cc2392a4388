//! fleetpatch-saga — staged fleet patch campaigns.
//!
//! A campaign waits for approval, fetches shared credentials once, then
//! patches every target cluster concurrently. Within a cluster a pilot
//! group of hosts is patched before the rest; within a group hosts run
//! concurrently and independently. Every remote call goes through the
//! journaled [`StepExecutor`], so an interrupted campaign can be resumed
//! without repeating side effects.
//!
//! # Architecture
//!
//! ```text
//! CampaignEngine ──► CampaignSaga ──► ClusterRollout ──► HostRollout
//!      │  (start/approve/         │            │               │
//!      │   terminate/resume)      └────────────┴──── StepExecutor ──► RemoteOps
//!      │                                                  │
//!      └──────────────────────── JournalStore ◄───────────┘
//! ```

pub mod campaign;
pub mod cluster;
pub mod context;
pub mod engine;
pub mod error;
pub mod executor;
pub mod host;
pub mod ops;
pub mod policy;
pub mod progress;
pub mod signal;
pub mod step;

#[cfg(test)]
mod fake;

use std::time::{SystemTime, UNIX_EPOCH};

pub use campaign::CampaignSaga;
pub use cluster::{ClusterRollout, partition};
pub use engine::{CampaignEngine, CampaignHandle, CampaignOutcome, IdReusePolicy, StartRequest};
pub use error::{
    EngineError, EngineResult, SagaError, SagaResult, StepError, StepFailure, StepResult,
};
pub use executor::StepExecutor;
pub use host::{HostFailure, HostPhase, HostRollout, HostTask};
pub use ops::{OpError, OpResult, RemoteOps};
pub use policy::{RetryPolicy, SagaSettings, StepOptions, StepPolicies};
pub use progress::{Milestone, ProgressLog};
pub use step::{StepKind, StepKey, StepScope};

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
