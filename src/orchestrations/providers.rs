//! Provider directory workflows: update and register.
//!
//! Provider records are guarded by a per-provider lock; reads of a record go
//! through [`get_provider`], which refuses to read unless the calling
//! instance holds the lock (or the caller explicitly opts out for read-only
//! diagnostics). An update that completes cleanly chains into registration.

use crate::commands::{Command, CommandResult, CommandState};
use crate::data::ProviderRecord;
use crate::orchestrations::activities::names;
use crate::retry::RetryPolicy;
use crate::OrchestrationContext;

/// Lock resource name guarding one provider record.
pub fn provider_lock(provider_id: &str) -> String {
    format!("provider/{provider_id}")
}

/// Lock-gated read of a provider record. Callers that do not hold the
/// provider's lock get an error unless they pass `allow_unsafe`.
pub async fn get_provider(
    ctx: &OrchestrationContext,
    provider_id: &str,
    allow_unsafe: bool,
) -> Result<Option<ProviderRecord>, String> {
    if !allow_unsafe && !ctx.holds_lock(&provider_lock(provider_id)) {
        return Err(format!("reading provider '{provider_id}' requires holding its lock"));
    }
    let raw = ctx
        .call_activity_with_retry(names::PROVIDER_GET, provider_id, &RetryPolicy::default())
        .await?;
    serde_json::from_str(&raw).map_err(|e| format!("malformed provider record: {e}"))
}

fn malformed(detail: impl Into<String>) -> Result<String, String> {
    CommandResult::synthesized("unknown", CommandState::Failed, detail.into()).into_output()
}

/// Update a provider record under its lock. The stored record becomes the
/// envelope value, which the chained registration run consumes as its input.
pub async fn provider_update(ctx: OrchestrationContext, input: String) -> Result<String, String> {
    let command: Command = match serde_json::from_str(&input) {
        Ok(c) => c,
        Err(e) => return malformed(format!("malformed command payload: {e}")),
    };
    let Command::UpdateProvider { provider, .. } = &command else {
        return malformed(format!("command '{}' does not update a provider", command.command_id()));
    };

    let mut result = CommandResult::for_command(&command);
    let lock = provider_lock(&provider.id);
    match ctx.acquire_lock(&lock).await.into_lock() {
        Ok(()) => {
            ctx.trace_info(format!("updating provider '{}'", provider.id));
            match serde_json::to_string(provider) {
                Ok(payload) => {
                    match ctx
                        .call_activity_with_retry(names::PROVIDER_UPSERT, payload, &RetryPolicy::default())
                        .await
                    {
                        Ok(stored) => match serde_json::from_str(&stored) {
                            Ok(value) => result.set_value(value),
                            Err(e) => result.add_error(format!("malformed stored provider: {e}")),
                        },
                        Err(e) => result.add_error(format!("provider upsert failed: {e}")),
                    }
                }
                Err(e) => result.add_error(format!("serialize provider: {e}")),
            }
            ctx.release_lock(&lock);
        }
        Err(denial) => result.add_error(denial.to_string()),
    }
    result.into_output()
}

/// The registration payload: either a direct register command, or the
/// envelope a completed update run chained into this one.
fn register_input(input: &str) -> Result<(String, ProviderRecord), String> {
    if let Ok(command) = serde_json::from_str::<Command>(input) {
        return match command {
            Command::RegisterProvider { command_id, provider } => Ok((command_id, provider)),
            other => Err(format!("command '{}' does not register a provider", other.command_id())),
        };
    }
    if let Ok(envelope) = serde_json::from_str::<CommandResult>(input) {
        if let Some(value) = envelope.value {
            if let Ok(provider) = serde_json::from_value::<ProviderRecord>(value) {
                return Ok((format!("{}-register", envelope.command_id), provider));
            }
        }
        return Err(format!(
            "chained envelope for command '{}' carries no provider record",
            envelope.command_id
        ));
    }
    Err("unrecognized registration payload".to_string())
}

/// Register a provider under its lock: exchange registration details with
/// the provider endpoint, stamp the registration time, and persist.
pub async fn provider_register(ctx: OrchestrationContext, input: String) -> Result<String, String> {
    let (command_id, incoming) = match register_input(&input) {
        Ok(parsed) => parsed,
        Err(e) => return malformed(e),
    };

    let mut result = CommandResult {
        command_id,
        value: None,
        errors: Vec::new(),
        state: CommandState::Completed,
    };
    let lock = provider_lock(&incoming.id);
    match ctx.acquire_lock(&lock).await.into_lock() {
        Ok(()) => {
            let record = match get_provider(&ctx, &incoming.id, false).await {
                Ok(stored) => stored.unwrap_or(incoming),
                Err(e) => {
                    result.add_error(e);
                    ctx.release_lock(&lock);
                    return result.into_output();
                }
            };
            ctx.trace_info(format!("registering provider '{}'", record.id));
            match serde_json::to_string(&record) {
                Ok(payload) => {
                    match ctx
                        .call_activity_with_retry(names::PROVIDER_REGISTER, payload, &RetryPolicy::default())
                        .await
                    {
                        Ok(registered) => match serde_json::from_str::<ProviderRecord>(&registered) {
                            Ok(mut registered) => {
                                registered.registered_at_ms = Some(ctx.now_ms());
                                match serde_json::to_string(&registered) {
                                    Ok(payload) => match ctx
                                        .call_activity_with_retry(
                                            names::PROVIDER_UPSERT,
                                            payload,
                                            &RetryPolicy::default(),
                                        )
                                        .await
                                    {
                                        Ok(stored) => match serde_json::from_str(&stored) {
                                            Ok(value) => result.set_value(value),
                                            Err(e) => result.add_error(format!("malformed stored provider: {e}")),
                                        },
                                        Err(e) => result.add_error(format!("provider upsert failed: {e}")),
                                    },
                                    Err(e) => result.add_error(format!("serialize provider: {e}")),
                                }
                            }
                            Err(e) => result.add_error(format!("malformed registration response: {e}")),
                        },
                        Err(e) => result.add_error(format!("provider registration failed: {e}")),
                    }
                }
                Err(e) => result.add_error(format!("serialize provider: {e}")),
            }
            ctx.release_lock(&lock);
        }
        Err(denial) => result.add_error(denial.to_string()),
    }
    result.into_output()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_input_accepts_a_direct_command() {
        let command = Command::RegisterProvider {
            command_id: "cmd-9".into(),
            provider: ProviderRecord::new("prov-a", "https://providers.example.com/a"),
        };
        let input = serde_json::to_string(&command).expect("encode");
        let (command_id, provider) = register_input(&input).expect("parses");
        assert_eq!(command_id, "cmd-9");
        assert_eq!(provider.id, "prov-a");
    }

    #[test]
    fn register_input_accepts_a_chained_update_envelope() {
        let provider = ProviderRecord::new("prov-a", "https://providers.example.com/a");
        let mut envelope = CommandResult {
            command_id: "cmd-1".into(),
            value: None,
            errors: Vec::new(),
            state: CommandState::Completed,
        };
        envelope.set_value(serde_json::to_value(&provider).expect("encode"));
        let input = serde_json::to_string(&envelope).expect("encode");

        let (command_id, parsed) = register_input(&input).expect("parses");
        assert_eq!(command_id, "cmd-1-register");
        assert_eq!(parsed, provider);
    }

    #[test]
    fn register_input_rejects_foreign_payloads() {
        assert!(register_input("{\"whatever\": true}").is_err());
        let command = Command::DeleteUser {
            command_id: "cmd-2".into(),
            user_id: "u-1".into(),
        };
        let input = serde_json::to_string(&command).expect("encode");
        assert!(register_input(&input).is_err());
    }
}
