//! User deletion workflows.
//!
//! Deleting an admin cascades a per-project membership removal across every
//! project the user belongs to. One project failing does not stop the rest:
//! each element failure is captured in the envelope and the remaining
//! removals still run.

use serde_json::json;

use crate::commands::{Command, CommandResult, CommandState};
use crate::data::{UserRecord, UserRole};
use crate::orchestrations::activities::names;
use crate::orchestrations::FanOutMode;
use crate::retry::RetryPolicy;
use crate::OrchestrationContext;

fn malformed(detail: impl Into<String>) -> Result<String, String> {
    CommandResult::synthesized("unknown", CommandState::Failed, detail.into()).into_output()
}

fn member_payload(project_id: &str, user_id: &str) -> String {
    json!({ "project_id": project_id, "user_id": user_id }).to_string()
}

/// Delete a user; admins additionally have their project memberships removed
/// across every project they belong to.
pub async fn user_delete(ctx: OrchestrationContext, input: String, mode: FanOutMode) -> Result<String, String> {
    let command: Command = match serde_json::from_str(&input) {
        Ok(c) => c,
        Err(e) => return malformed(format!("malformed command payload: {e}")),
    };
    let Command::DeleteUser { user_id, .. } = &command else {
        return malformed(format!("command '{}' does not delete a user", command.command_id()));
    };

    let mut result = CommandResult::for_command(&command);
    match ctx
        .call_activity_with_retry(names::USER_DELETE, user_id.clone(), &RetryPolicy::default())
        .await
    {
        Ok(raw) => {
            let removed: Option<UserRecord> = serde_json::from_str(&raw).unwrap_or(None);
            match removed {
                None => result.add_error(format!("user '{user_id}' not found")),
                Some(user) => {
                    let mut cascaded = 0usize;
                    if user.role == UserRole::Admin {
                        match ctx
                            .call_activity_with_retry(names::PROJECTS_LIST, user_id.clone(), &RetryPolicy::default())
                            .await
                        {
                            Ok(raw) => {
                                let project_ids: Vec<String> = serde_json::from_str(&raw).unwrap_or_default();
                                cascaded = project_ids.len();
                                ctx.trace_info(format!(
                                    "cascading removal of '{user_id}' across {cascaded} projects"
                                ));
                                cascade_membership_removal(&ctx, &mut result, user_id, &project_ids, mode).await;
                            }
                            Err(e) => result.add_error(format!("listing projects failed: {e}")),
                        }
                    }
                    result.set_value(json!({ "user_id": user_id, "cascaded_projects": cascaded }));
                }
            }
        }
        Err(e) => result.add_error(format!("user delete failed: {e}")),
    }
    result.into_output()
}

async fn cascade_membership_removal(
    ctx: &OrchestrationContext,
    result: &mut CommandResult,
    user_id: &str,
    project_ids: &[String],
    mode: FanOutMode,
) {
    match mode {
        FanOutMode::Parallel => {
            let futures = project_ids
                .iter()
                .map(|pid| ctx.schedule_activity(names::PROJECT_USER_DELETE, member_payload(pid, user_id)))
                .collect();
            for (pid, output) in project_ids.iter().zip(ctx.join(futures).await) {
                if let Err(e) = output.into_activity() {
                    result.add_error(format!("project '{pid}': {e}"));
                }
            }
        }
        FanOutMode::Sequential => {
            for pid in project_ids {
                if let Err(e) = ctx
                    .call_activity(names::PROJECT_USER_DELETE, member_payload(pid, user_id))
                    .await
                {
                    // Keep going; remaining projects still get cleaned up.
                    result.add_error(format!("project '{pid}': {e}"));
                }
            }
        }
    }
}

/// Remove a single user from a single project.
pub async fn project_user_delete(ctx: OrchestrationContext, input: String) -> Result<String, String> {
    let command: Command = match serde_json::from_str(&input) {
        Ok(c) => c,
        Err(e) => return malformed(format!("malformed command payload: {e}")),
    };
    let Command::DeleteProjectUser {
        project_id, user_id, ..
    } = &command
    else {
        return malformed(format!(
            "command '{}' does not delete a project user",
            command.command_id()
        ));
    };

    let mut result = CommandResult::for_command(&command);
    match ctx
        .call_activity_with_retry(
            names::PROJECT_USER_DELETE,
            member_payload(project_id, user_id),
            &RetryPolicy::default(),
        )
        .await
    {
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(value) => result.set_value(value),
            Err(e) => result.add_error(format!("malformed removal result: {e}")),
        },
        Err(e) => result.add_error(format!("project user delete failed: {e}")),
    }
    result.into_output()
}
