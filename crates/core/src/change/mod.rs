//! Apply configuration changes under commit-confirm.

mod config;
mod engine;
mod registry;
mod types;

pub use config::{CommitConfirmConfig, ReconcilePolicy};
pub use engine::CommitConfirmEngine;
pub use registry::ConfirmRegistry;
pub use types::{
    ChangeError, ChangePhase, ChangeReport, ChangeRequest, ConfirmationSource, PhaseRecord,
};
