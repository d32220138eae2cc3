use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub static CONDITION_INITIALIZED: &str = "ConditionInitialized";

/// Tri-state value of a status condition.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// A named status field with a machine readable reason and a human message.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
}

impl Condition {
    /// A fresh condition whose semantic check has not run yet.
    pub fn init(type_: &str) -> Self {
        let now = Utc::now();
        Self {
            type_: type_.to_string(),
            status: ConditionStatus::Unknown,
            reason: CONDITION_INITIALIZED.to_string(),
            message: "The condition has been initialized but its semantic check has not been performed yet.".to_string(),
            last_transition_time: Some(now),
            last_update_time: Some(now),
        }
    }

    /// Returns a copy with the new status, reason and message.
    ///
    /// The transition time only moves when the status value changes, the update
    /// time moves whenever reason or message change.
    pub fn updated(
        &self,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let (reason, message) = (reason.into(), message.into());
        let now = Utc::now();
        let mut next = self.clone();

        if next.status != status {
            next.last_transition_time = Some(now);
            next.last_update_time = Some(now);
        } else if next.reason != reason || next.message != message {
            next.last_update_time = Some(now);
        }

        next.status = status;
        next.reason = reason;
        next.message = message;
        next
    }
}

/// Looks up a condition by type.
pub fn get_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Returns the existing condition of the given type, or an initialized one.
pub fn get_or_init_condition(conditions: &[Condition], type_: &str) -> Condition {
    get_condition(conditions, type_)
        .cloned()
        .unwrap_or_else(|| Condition::init(type_))
}

/// Merges `updates` into `existing`.
///
/// Conditions are matched by type: a matching entry is replaced in place,
/// unmatched updates are appended. Entries without an update keep their
/// position and content.
pub fn merge_conditions(
    existing: &[Condition],
    updates: impl IntoIterator<Item = Condition>,
) -> Vec<Condition> {
    let mut out = existing.to_vec();
    for update in updates {
        match out.iter_mut().find(|c| c.type_ == update.type_) {
            Some(slot) => *slot = update,
            None => out.push(update),
        }
    }
    out
}
