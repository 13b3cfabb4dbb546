//! Parsing of cloud lifecycle-hook notifications into termination intents.

use fleetgrid_state::{IntentOrigin, TerminationIntent};
use serde::Deserialize;

use crate::error::{LifecycleError, LifecycleResult};

const TERMINATING: &str = "autoscaling:EC2_INSTANCE_TERMINATING";
const TEST_NOTIFICATION: &str = "autoscaling:TEST_NOTIFICATION";

/// The JSON body of a lifecycle-hook notification.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HookMessage {
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    lifecycle_transition: Option<String>,
    #[serde(default, rename = "EC2InstanceId")]
    instance_id: Option<String>,
    #[serde(default)]
    origin: Option<String>,
    #[serde(default)]
    lifecycle_hook_name: Option<String>,
    #[serde(default)]
    lifecycle_action_token: Option<String>,
    #[serde(default)]
    auto_scaling_group_name: Option<String>,
}

/// Turn a hook notification body into a termination intent.
///
/// Test notifications and transitions other than instance termination
/// yield `None`.
pub fn parse_hook_message(body: &str) -> LifecycleResult<Option<TerminationIntent>> {
    let message: HookMessage = serde_json::from_str(body)?;

    if message.event.as_deref() == Some(TEST_NOTIFICATION) {
        return Ok(None);
    }
    if message.lifecycle_transition.as_deref() != Some(TERMINATING) {
        return Ok(None);
    }

    let instance_id = message
        .instance_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| LifecycleError::InvalidMessage("missing EC2InstanceId".to_string()))?;
    let origin = match message.origin.as_deref() {
        Some(o) if o.eq_ignore_ascii_case("WarmPool") => IntentOrigin::WarmPool,
        _ => IntentOrigin::InService,
    };

    Ok(Some(TerminationIntent {
        instance_id,
        origin,
        hook_name: message.lifecycle_hook_name.unwrap_or_default(),
        hook_token: message.lifecycle_action_token.unwrap_or_default(),
        group_name: message.auto_scaling_group_name.unwrap_or_default(),
    }))
}
