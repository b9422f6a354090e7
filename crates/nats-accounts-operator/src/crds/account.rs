use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::{
    CONDITION_ISSUER_RESOLVED, CONDITION_JWT_PUSHED, CONDITION_JWT_SECRET_READY,
    CONDITION_OPERATOR_RESOLVED, CONDITION_SEED_SECRET_READY, CONDITION_SIGNING_KEYS_UPDATED,
    Condition, ConditionSet,
};
use crate::crds::common::{
    InferredObjectReference, IssuerReference, KeyPair, SigningKeyEmbeddedStatus,
};

pub static ACCOUNT_CONDITIONS: ConditionSet = ConditionSet::new(&[
    CONDITION_SEED_SECRET_READY,
    CONDITION_ISSUER_RESOLVED,
    CONDITION_OPERATOR_RESOLVED,
    CONDITION_SIGNING_KEYS_UPDATED,
    CONDITION_JWT_SECRET_READY,
    CONDITION_JWT_PUSHED,
]);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ImportExportType {
    Stream,
    Service,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum AccountResponseType {
    Singleton,
    Stream,
    Chunked,
}

/// Per-tenant claims boundary. The Account controller is the only one with
/// external-system state (the pushed JWT at the account server).
#[derive(CustomResource, Debug, Serialize, Deserialize, Clone, JsonSchema)]
#[kube(
    group = "accounts.nats.io",
    version = "v1alpha1",
    kind = "Account",
    plural = "accounts",
    namespaced,
    status = "AccountStatus",
    shortname = "nacc"
)]
#[serde(rename_all = "camelCase")]
pub struct AccountSpec {
    /// The Operator or SigningKey whose keypair signs this Account's JWT.
    pub issuer: IssuerReference,
    /// Namespaces allowed to contain Users managed by this Account. Unset
    /// restricts Users to the Account's own namespace; `{}` allows all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub users_namespace_selector: Option<LabelSelector>,
    /// Restricts which Users this Account adopts. Unset matches all Users
    /// (subject to the namespace selector above).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub users_selector: Option<LabelSelector>,
    pub jwt_secret_name: String,
    pub seed_secret_name: String,
    /// Restricts which SigningKeys may sign for this Account. SigningKeys
    /// must share the Account's namespace. Unset and `{}` match all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_keys_selector: Option<LabelSelector>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub imports: Vec<AccountImport>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exports: Vec<AccountExport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<AccountLimitsSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccountImport {
    pub name: String,
    pub subject: String,
    #[serde(default)]
    pub account: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub to: String,
    pub r#type: ImportExportType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccountExport {
    pub name: String,
    pub subject: String,
    pub r#type: ImportExportType,
    #[serde(default)]
    pub token_req: bool,
    /// Required for service exports, must be unset for streams.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_type: Option<AccountResponseType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_latency: Option<AccountServiceLatency>,
    #[serde(default)]
    pub account_token_position: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccountServiceLatency {
    pub sampling: i64,
    pub results: String,
}

/// Unset fields inherit the NoLimit defaults of a fresh account claim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccountLimitsSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subs: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imports: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exports: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wildcard_exports: Option<bool>,
    #[serde(default)]
    pub disallow_bearer: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conn: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leaf_node_conn: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jet_stream: Option<JetStreamLimitsSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JetStreamLimitsSpec {
    #[serde(default)]
    pub memory_storage: i64,
    #[serde(default)]
    pub disk_storage: i64,
    #[serde(default)]
    pub streams: i64,
    #[serde(default)]
    pub consumer: i64,
    #[serde(default)]
    pub max_ack_pending: i64,
    #[serde(default)]
    pub memory_max_stream_bytes: i64,
    #[serde(default)]
    pub disk_max_stream_bytes: i64,
    #[serde(default)]
    pub max_bytes_required: bool,
}

// status fields serialize even when unset so merge patches clear them
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccountStatus {
    #[serde(default)]
    pub key_pair: Option<KeyPair>,
    #[serde(default)]
    pub signing_keys: Vec<SigningKeyEmbeddedStatus>,
    #[serde(default)]
    pub operator_ref: Option<InferredObjectReference>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl Account {
    pub fn key_pair(&self) -> Option<&KeyPair> {
        self.status.as_ref().and_then(|s| s.key_pair.as_ref())
    }

    pub fn is_ready(&self) -> bool {
        self.status.as_ref().is_some_and(AccountStatus::is_ready)
    }
}

impl AccountStatus {
    pub fn initialize_conditions(&mut self) {
        ACCOUNT_CONDITIONS.initialize(&mut self.conditions);
    }

    pub fn is_ready(&self) -> bool {
        ACCOUNT_CONDITIONS.is_ready(&self.conditions)
    }

    pub fn jwt_pushed(&self) -> bool {
        ACCOUNT_CONDITIONS
            .get(&self.conditions, CONDITION_JWT_PUSHED)
            .is_some_and(Condition::is_true)
    }

    pub fn jwt_secret_ready(&self) -> bool {
        ACCOUNT_CONDITIONS
            .get(&self.conditions, CONDITION_JWT_SECRET_READY)
            .is_some_and(Condition::is_true)
    }

    pub fn seed_secret_ready(&self) -> bool {
        ACCOUNT_CONDITIONS
            .get(&self.conditions, CONDITION_SEED_SECRET_READY)
            .is_some_and(Condition::is_true)
    }

    pub fn mark_seed_secret_ready(&mut self, key_pair: KeyPair) {
        self.key_pair = Some(key_pair);
        ACCOUNT_CONDITIONS.mark_true(&mut self.conditions, CONDITION_SEED_SECRET_READY);
    }

    pub fn mark_seed_secret_failed(&mut self, reason: &str, message: &str) {
        self.key_pair = None;
        ACCOUNT_CONDITIONS.mark_false(&mut self.conditions, CONDITION_SEED_SECRET_READY, reason, message);
    }

    pub fn mark_seed_secret_unknown(&mut self, reason: &str, message: &str) {
        self.key_pair = None;
        ACCOUNT_CONDITIONS.mark_unknown(&mut self.conditions, CONDITION_SEED_SECRET_READY, reason, message);
    }

    pub fn mark_issuer_resolved(&mut self) {
        ACCOUNT_CONDITIONS.mark_true(&mut self.conditions, CONDITION_ISSUER_RESOLVED);
    }

    pub fn mark_issuer_resolve_failed(&mut self, reason: &str, message: &str) {
        ACCOUNT_CONDITIONS.mark_false(&mut self.conditions, CONDITION_ISSUER_RESOLVED, reason, message);
    }

    pub fn mark_issuer_resolve_unknown(&mut self, reason: &str, message: &str) {
        ACCOUNT_CONDITIONS.mark_unknown(&mut self.conditions, CONDITION_ISSUER_RESOLVED, reason, message);
    }

    pub fn mark_operator_resolved(&mut self, reference: InferredObjectReference) {
        self.operator_ref = Some(reference);
        ACCOUNT_CONDITIONS.mark_true(&mut self.conditions, CONDITION_OPERATOR_RESOLVED);
    }

    pub fn mark_operator_resolve_failed(&mut self, reason: &str, message: &str) {
        self.operator_ref = None;
        ACCOUNT_CONDITIONS.mark_false(&mut self.conditions, CONDITION_OPERATOR_RESOLVED, reason, message);
    }

    pub fn mark_operator_resolve_unknown(&mut self, reason: &str, message: &str) {
        self.operator_ref = None;
        ACCOUNT_CONDITIONS.mark_unknown(&mut self.conditions, CONDITION_OPERATOR_RESOLVED, reason, message);
    }

    pub fn mark_signing_keys_updated(&mut self, signing_keys: Vec<SigningKeyEmbeddedStatus>) {
        let message = format!("found {} signing keys", signing_keys.len());
        self.signing_keys = signing_keys;
        ACCOUNT_CONDITIONS.mark_true_with_reason(
            &mut self.conditions,
            CONDITION_SIGNING_KEYS_UPDATED,
            "SigningKeysUpdated",
            &message,
        );
    }

    pub fn mark_signing_keys_update_unknown(&mut self, reason: &str, message: &str) {
        ACCOUNT_CONDITIONS.mark_unknown(
            &mut self.conditions,
            CONDITION_SIGNING_KEYS_UPDATED,
            reason,
            message,
        );
    }

    pub fn mark_jwt_secret_ready(&mut self) {
        ACCOUNT_CONDITIONS.mark_true(&mut self.conditions, CONDITION_JWT_SECRET_READY);
    }

    pub fn mark_jwt_secret_failed(&mut self, reason: &str, message: &str) {
        ACCOUNT_CONDITIONS.mark_false(&mut self.conditions, CONDITION_JWT_SECRET_READY, reason, message);
    }

    pub fn mark_jwt_secret_unknown(&mut self, reason: &str, message: &str) {
        ACCOUNT_CONDITIONS.mark_unknown(&mut self.conditions, CONDITION_JWT_SECRET_READY, reason, message);
    }

    pub fn mark_jwt_pushed(&mut self) {
        ACCOUNT_CONDITIONS.mark_true(&mut self.conditions, CONDITION_JWT_PUSHED);
    }

    pub fn mark_jwt_pushed_with_reason(&mut self, reason: &str, message: &str) {
        ACCOUNT_CONDITIONS.mark_true_with_reason(&mut self.conditions, CONDITION_JWT_PUSHED, reason, message);
    }

    pub fn mark_jwt_push_failed(&mut self, reason: &str, message: &str) {
        ACCOUNT_CONDITIONS.mark_false(&mut self.conditions, CONDITION_JWT_PUSHED, reason, message);
    }

    pub fn mark_jwt_push_unknown(&mut self, reason: &str, message: &str) {
        ACCOUNT_CONDITIONS.mark_unknown(&mut self.conditions, CONDITION_JWT_PUSHED, reason, message);
    }
}
