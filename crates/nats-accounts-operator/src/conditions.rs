//! Shared condition model. Every resource carries an ordered set of typed
//! conditions with a single aggregate `Ready` condition whose truth is the
//! conjunction of the kind-specific dependents.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_SEED_SECRET_READY: &str = "SeedSecretReady";
pub const CONDITION_ISSUER_RESOLVED: &str = "IssuerResolved";
pub const CONDITION_OPERATOR_RESOLVED: &str = "OperatorResolved";
pub const CONDITION_ACCOUNT_RESOLVED: &str = "AccountResolved";
pub const CONDITION_OWNER_RESOLVED: &str = "OwnerResolved";
pub const CONDITION_SYSTEM_ACCOUNT_RESOLVED: &str = "SystemAccountResolved";
pub const CONDITION_SIGNING_KEYS_UPDATED: &str = "SigningKeysUpdated";
pub const CONDITION_JWT_SECRET_READY: &str = "JWTSecretReady";
pub const CONDITION_JWT_PUSHED: &str = "JWTPushed";
pub const CONDITION_CREDENTIALS_SECRET_READY: &str = "CredentialsSecretReady";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub r#type: String,
    pub status: ConditionStatus,
    /// `Error` on False, `Info` on Unknown, absent on True.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl Condition {
    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

fn now_rfc3339() -> Option<String> {
    OffsetDateTime::now_utc().format(&Rfc3339).ok()
}

fn severity_for(status: ConditionStatus) -> Option<String> {
    match status {
        ConditionStatus::True => None,
        ConditionStatus::False => Some("Error".into()),
        ConditionStatus::Unknown => Some("Info".into()),
    }
}

/// Ordered set of dependent condition types for one resource kind. `Ready`
/// is recomputed from the dependents after every mark, so it only becomes
/// True once every dependent is True.
pub struct ConditionSet {
    dependents: &'static [&'static str],
}

impl ConditionSet {
    pub const fn new(dependents: &'static [&'static str]) -> Self {
        Self { dependents }
    }

    pub fn dependents(&self) -> &'static [&'static str] {
        self.dependents
    }

    /// Sets any unset condition, including `Ready`, to Unknown.
    pub fn initialize(&self, conditions: &mut Vec<Condition>) {
        for t in self.dependents {
            if Self::find(conditions, t).is_none() {
                self.set(
                    conditions,
                    t,
                    ConditionStatus::Unknown,
                    None,
                    None,
                );
            }
        }
        self.recompute_ready(conditions);
    }

    pub fn mark_true(&self, conditions: &mut Vec<Condition>, t: &str) {
        self.set(conditions, t, ConditionStatus::True, None, None);
        self.recompute_ready(conditions);
    }

    pub fn mark_true_with_reason(
        &self,
        conditions: &mut Vec<Condition>,
        t: &str,
        reason: &str,
        message: &str,
    ) {
        self.set(
            conditions,
            t,
            ConditionStatus::True,
            Some(reason),
            Some(message),
        );
        self.recompute_ready(conditions);
    }

    pub fn mark_false(&self, conditions: &mut Vec<Condition>, t: &str, reason: &str, message: &str) {
        self.set(
            conditions,
            t,
            ConditionStatus::False,
            Some(reason),
            Some(message),
        );
        self.recompute_ready(conditions);
    }

    pub fn mark_unknown(
        &self,
        conditions: &mut Vec<Condition>,
        t: &str,
        reason: &str,
        message: &str,
    ) {
        self.set(
            conditions,
            t,
            ConditionStatus::Unknown,
            Some(reason),
            Some(message),
        );
        self.recompute_ready(conditions);
    }

    pub fn get<'a>(&self, conditions: &'a [Condition], t: &str) -> Option<&'a Condition> {
        Self::find(conditions, t)
    }

    pub fn is_ready(&self, conditions: &[Condition]) -> bool {
        Self::find(conditions, CONDITION_READY).is_some_and(Condition::is_true)
    }

    fn find<'a>(conditions: &'a [Condition], t: &str) -> Option<&'a Condition> {
        conditions.iter().find(|c| c.r#type == t)
    }

    /// Upserts a condition. A condition whose status, reason and message are
    /// unchanged is left untouched so its transition time survives and two
    /// back-to-back reconciles produce byte-identical statuses.
    fn set(
        &self,
        conditions: &mut Vec<Condition>,
        t: &str,
        status: ConditionStatus,
        reason: Option<&str>,
        message: Option<&str>,
    ) {
        let next = Condition {
            r#type: t.to_string(),
            status,
            severity: severity_for(status),
            reason: reason.map(str::to_string),
            message: message.map(str::to_string),
            last_transition_time: now_rfc3339(),
        };

        if let Some(existing) = conditions.iter_mut().find(|c| c.r#type == t) {
            let unchanged = existing.status == next.status
                && existing.reason == next.reason
                && existing.message == next.message;
            if !unchanged {
                *existing = next;
            }
            return;
        }

        let idx = self.order_index(t);
        let insert_at = conditions
            .iter()
            .position(|c| self.order_index(&c.r#type) > idx)
            .unwrap_or(conditions.len());
        conditions.insert(insert_at, next);
    }

    fn order_index(&self, t: &str) -> usize {
        if t == CONDITION_READY {
            return 0;
        }
        self.dependents
            .iter()
            .position(|d| *d == t)
            .map(|i| i + 1)
            .unwrap_or(usize::MAX)
    }

    fn recompute_ready(&self, conditions: &mut Vec<Condition>) {
        let mut status = ConditionStatus::True;
        let mut reason = None;
        let mut message = None;

        for t in self.dependents {
            let dependent = Self::find(conditions, t);
            let dep_status = dependent.map(|c| c.status).unwrap_or(ConditionStatus::Unknown);
            match dep_status {
                ConditionStatus::True => {}
                ConditionStatus::False => {
                    status = ConditionStatus::False;
                    reason = dependent.and_then(|c| c.reason.clone());
                    message = dependent.and_then(|c| c.message.clone());
                    break;
                }
                ConditionStatus::Unknown => {
                    if status == ConditionStatus::True {
                        status = ConditionStatus::Unknown;
                        reason = dependent.and_then(|c| c.reason.clone());
                        message = dependent.and_then(|c| c.message.clone());
                    }
                }
            }
        }

        self.set(
            conditions,
            CONDITION_READY,
            status,
            reason.as_deref(),
            message.as_deref(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static SET: ConditionSet =
        ConditionSet::new(&[CONDITION_SEED_SECRET_READY, CONDITION_JWT_SECRET_READY]);

    #[test]
    fn initialize_sets_unknown() {
        let mut conditions = Vec::new();
        SET.initialize(&mut conditions);
        assert_eq!(conditions.len(), 3);
        assert!(conditions.iter().all(|c| c.status == ConditionStatus::Unknown));
        assert_eq!(conditions[0].r#type, CONDITION_READY);
    }

    #[test]
    fn ready_requires_all_dependents() {
        let mut conditions = Vec::new();
        SET.initialize(&mut conditions);

        SET.mark_true(&mut conditions, CONDITION_SEED_SECRET_READY);
        assert!(!SET.is_ready(&conditions));

        SET.mark_true(&mut conditions, CONDITION_JWT_SECRET_READY);
        assert!(SET.is_ready(&conditions));
    }

    #[test]
    fn dependent_failure_fails_ready_with_reason() {
        let mut conditions = Vec::new();
        SET.initialize(&mut conditions);
        SET.mark_true(&mut conditions, CONDITION_SEED_SECRET_READY);
        SET.mark_false(
            &mut conditions,
            CONDITION_JWT_SECRET_READY,
            "InvalidJWTSecret",
            "secret missing nats.jwt",
        );

        let ready = SET.get(&conditions, CONDITION_READY).unwrap();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason.as_deref(), Some("InvalidJWTSecret"));
        assert_eq!(ready.severity.as_deref(), Some("Error"));
    }

    #[test]
    fn unchanged_mark_keeps_transition_time() {
        let mut conditions = Vec::new();
        SET.initialize(&mut conditions);
        SET.mark_true(&mut conditions, CONDITION_SEED_SECRET_READY);
        let before = conditions.clone();

        SET.mark_true(&mut conditions, CONDITION_SEED_SECRET_READY);
        assert_eq!(before, conditions);
    }
}
