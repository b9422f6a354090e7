use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::{
    CONDITION_ACCOUNT_RESOLVED, CONDITION_CREDENTIALS_SECRET_READY, CONDITION_ISSUER_RESOLVED,
    CONDITION_JWT_SECRET_READY, CONDITION_SEED_SECRET_READY, Condition, ConditionSet,
};
use crate::crds::common::{InferredObjectReference, IssuerReference, KeyPair};

pub static USER_CONDITIONS: ConditionSet = ConditionSet::new(&[
    CONDITION_SEED_SECRET_READY,
    CONDITION_ISSUER_RESOLVED,
    CONDITION_ACCOUNT_RESOLVED,
    CONDITION_JWT_SECRET_READY,
    CONDITION_CREDENTIALS_SECRET_READY,
]);

/// Per-principal credentials. Produces a seed, a user JWT and a credentials
/// bundle directly consumable by NATS client libraries.
#[derive(CustomResource, Debug, Serialize, Deserialize, Clone, JsonSchema)]
#[kube(
    group = "accounts.nats.io",
    version = "v1alpha1",
    kind = "User",
    plural = "users",
    namespaced,
    status = "UserStatus",
    shortname = "nusr"
)]
#[serde(rename_all = "camelCase")]
pub struct UserSpec {
    /// The Account or SigningKey whose keypair signs this User's JWT.
    pub issuer: IssuerReference,
    pub jwt_secret_name: String,
    pub seed_secret_name: String,
    /// Secret receiving the decorated `nats.creds` bundle.
    pub credentials_secret_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<UserPermissions>,
    #[serde(default)]
    pub limits: UserLimitsSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserPermissions {
    #[serde(default)]
    pub r#pub: UserPermission,
    #[serde(default)]
    pub sub: UserPermission,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resp: Option<RespPermission>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserPermission {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deny: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RespPermission {
    pub max: i64,
    /// Response TTL, e.g. "500ms", "5s", "1m". Empty means no expiry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserLimitsSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subs: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<i64>,
    /// CIDR blocks the user may connect from.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub src: Vec<String>,
    /// Daily connection windows, times formatted "15:04:05".
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub times: Vec<StartEndTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StartEndTime {
    pub start: String,
    pub end: String,
}

// status fields serialize even when unset so merge patches clear them
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserStatus {
    #[serde(default)]
    pub key_pair: Option<KeyPair>,
    #[serde(default)]
    pub account_ref: Option<InferredObjectReference>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl User {
    pub fn key_pair(&self) -> Option<&KeyPair> {
        self.status.as_ref().and_then(|s| s.key_pair.as_ref())
    }
}

impl UserStatus {
    pub fn initialize_conditions(&mut self) {
        USER_CONDITIONS.initialize(&mut self.conditions);
    }

    pub fn is_ready(&self) -> bool {
        USER_CONDITIONS.is_ready(&self.conditions)
    }

    pub fn mark_seed_secret_ready(&mut self, key_pair: KeyPair) {
        self.key_pair = Some(key_pair);
        USER_CONDITIONS.mark_true(&mut self.conditions, CONDITION_SEED_SECRET_READY);
    }

    pub fn mark_seed_secret_failed(&mut self, reason: &str, message: &str) {
        self.key_pair = None;
        USER_CONDITIONS.mark_false(&mut self.conditions, CONDITION_SEED_SECRET_READY, reason, message);
    }

    pub fn mark_seed_secret_unknown(&mut self, reason: &str, message: &str) {
        self.key_pair = None;
        USER_CONDITIONS.mark_unknown(&mut self.conditions, CONDITION_SEED_SECRET_READY, reason, message);
    }

    pub fn mark_issuer_resolved(&mut self) {
        USER_CONDITIONS.mark_true(&mut self.conditions, CONDITION_ISSUER_RESOLVED);
    }

    pub fn mark_issuer_resolve_failed(&mut self, reason: &str, message: &str) {
        USER_CONDITIONS.mark_false(&mut self.conditions, CONDITION_ISSUER_RESOLVED, reason, message);
    }

    pub fn mark_issuer_resolve_unknown(&mut self, reason: &str, message: &str) {
        USER_CONDITIONS.mark_unknown(&mut self.conditions, CONDITION_ISSUER_RESOLVED, reason, message);
    }

    pub fn mark_account_resolved(&mut self, reference: InferredObjectReference) {
        self.account_ref = Some(reference);
        USER_CONDITIONS.mark_true(&mut self.conditions, CONDITION_ACCOUNT_RESOLVED);
    }

    pub fn mark_account_resolve_failed(&mut self, reason: &str, message: &str) {
        self.account_ref = None;
        USER_CONDITIONS.mark_false(&mut self.conditions, CONDITION_ACCOUNT_RESOLVED, reason, message);
    }

    pub fn mark_account_resolve_unknown(&mut self, reason: &str, message: &str) {
        self.account_ref = None;
        USER_CONDITIONS.mark_unknown(&mut self.conditions, CONDITION_ACCOUNT_RESOLVED, reason, message);
    }

    pub fn mark_jwt_secret_ready(&mut self) {
        USER_CONDITIONS.mark_true(&mut self.conditions, CONDITION_JWT_SECRET_READY);
    }

    pub fn mark_jwt_secret_failed(&mut self, reason: &str, message: &str) {
        USER_CONDITIONS.mark_false(&mut self.conditions, CONDITION_JWT_SECRET_READY, reason, message);
    }

    pub fn mark_jwt_secret_unknown(&mut self, reason: &str, message: &str) {
        USER_CONDITIONS.mark_unknown(&mut self.conditions, CONDITION_JWT_SECRET_READY, reason, message);
    }

    pub fn mark_credentials_secret_ready(&mut self) {
        USER_CONDITIONS.mark_true(&mut self.conditions, CONDITION_CREDENTIALS_SECRET_READY);
    }

    pub fn mark_credentials_secret_failed(&mut self, reason: &str, message: &str) {
        USER_CONDITIONS.mark_false(
            &mut self.conditions,
            CONDITION_CREDENTIALS_SECRET_READY,
            reason,
            message,
        );
    }

    pub fn mark_credentials_secret_unknown(&mut self, reason: &str, message: &str) {
        USER_CONDITIONS.mark_unknown(
            &mut self.conditions,
            CONDITION_CREDENTIALS_SECRET_READY,
            reason,
            message,
        );
    }
}
