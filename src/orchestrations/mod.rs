//! The provisioning workflows and the activities backing them.
//!
//! Workflows are thin deterministic coordinators: every side effect lives in
//! an activity, every cross-instance constraint in a lock, and every exit
//! path emits the command's result envelope.

use crate::commands::workflows;
use crate::runtime::{ActivityRegistry, OrchestrationRegistry};

pub mod activities;
pub mod providers;
pub mod users;

pub use activities::{activity_registry, Services};

/// How a workflow runs a batch of per-element activities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FanOutMode {
    /// One at a time, in order.
    Sequential,
    /// All scheduled up front, joined on completion.
    #[default]
    Parallel,
}

/// The shipped workflow set. Provider updates chain into registration on
/// success; `mode` selects how the user-deletion cascade fans out.
pub fn orchestration_registry(mode: FanOutMode) -> OrchestrationRegistry {
    OrchestrationRegistry::builder()
        .register(workflows::PROVIDER_UPDATE, providers::provider_update)
        .register(workflows::PROVIDER_REGISTER, providers::provider_register)
        .register(workflows::USER_DELETE, move |ctx, input| {
            users::user_delete(ctx, input, mode)
        })
        .register(workflows::PROJECT_USER_DELETE, users::project_user_delete)
        .chain(workflows::PROVIDER_UPDATE, workflows::PROVIDER_REGISTER)
        .build()
}

/// Activities wired to fresh in-memory services.
pub fn default_activity_registry() -> ActivityRegistry {
    activity_registry(Services::in_memory())
}
