use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::{
    CONDITION_JWT_SECRET_READY, CONDITION_SEED_SECRET_READY, CONDITION_SIGNING_KEYS_UPDATED,
    CONDITION_SYSTEM_ACCOUNT_RESOLVED, Condition, ConditionSet,
};
use crate::crds::common::{
    KeyPair, KeyPairReference, LocalReference, SigningKeyEmbeddedStatus, TlsConfig,
};

pub static OPERATOR_CONDITIONS: ConditionSet = ConditionSet::new(&[
    CONDITION_SEED_SECRET_READY,
    CONDITION_SYSTEM_ACCOUNT_RESOLVED,
    CONDITION_SIGNING_KEYS_UPDATED,
    CONDITION_JWT_SECRET_READY,
]);

/// Root of trust for a NATS deployment. Owns the self-signed operator JWT,
/// the operator seed and the reference to the system Account.
#[derive(CustomResource, Debug, Serialize, Deserialize, Clone, JsonSchema)]
#[kube(
    group = "accounts.nats.io",
    version = "v1alpha1",
    kind = "Operator",
    plural = "operators",
    namespaced,
    status = "OperatorStatus",
    shortname = "nop"
)]
#[serde(rename_all = "camelCase")]
pub struct OperatorSpec {
    /// Secret holding the self-signed operator JWT.
    pub jwt_secret_name: String,
    /// Secret holding the operator seed. Created immutable with a
    /// deletion-prevention marker.
    pub seed_secret_name: String,
    /// The Account used as this operator's system account. Must live in the
    /// same namespace; the account selectors below do not apply to it.
    pub system_account_ref: LocalReference,
    /// Namespaces allowed to contain Accounts managed by this Operator.
    /// Unset restricts to the Operator's namespace, `{}` allows all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accounts_namespace_selector: Option<LabelSelector>,
    /// Restricts which Accounts this Operator adopts. Unset and `{}` are
    /// equivalent and match all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accounts_selector: Option<LabelSelector>,
    /// Restricts which SigningKeys may claim this Operator as owner. Unset
    /// and `{}` are equivalent and match all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_keys_selector: Option<LabelSelector>,
    /// TLS trust configuration for account-server connections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_config: Option<TlsConfig>,
    /// Account server URL, also embedded as a JWT claim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_server_url: Option<String>,
    /// Operator service URLs JWT claim.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operator_service_urls: Vec<String>,
}

// status fields serialize even when unset so merge patches clear them
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OperatorStatus {
    #[serde(default)]
    pub key_pair: Option<KeyPair>,
    #[serde(default)]
    pub signing_keys: Vec<SigningKeyEmbeddedStatus>,
    /// The system account from `spec.systemAccountRef`, validated to exist
    /// and carry a keypair.
    #[serde(default)]
    pub resolved_system_account: Option<KeyPairReference>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl Operator {
    pub fn key_pair(&self) -> Option<&KeyPair> {
        self.status.as_ref().and_then(|s| s.key_pair.as_ref())
    }

    pub fn is_ready(&self) -> bool {
        self.status.as_ref().is_some_and(OperatorStatus::is_ready)
    }
}

impl OperatorStatus {
    pub fn initialize_conditions(&mut self) {
        OPERATOR_CONDITIONS.initialize(&mut self.conditions);
    }

    pub fn is_ready(&self) -> bool {
        OPERATOR_CONDITIONS.is_ready(&self.conditions)
    }

    pub fn mark_seed_secret_ready(&mut self, key_pair: KeyPair) {
        self.key_pair = Some(key_pair);
        OPERATOR_CONDITIONS.mark_true(&mut self.conditions, CONDITION_SEED_SECRET_READY);
    }

    pub fn mark_seed_secret_failed(&mut self, reason: &str, message: &str) {
        self.key_pair = None;
        OPERATOR_CONDITIONS.mark_false(&mut self.conditions, CONDITION_SEED_SECRET_READY, reason, message);
    }

    pub fn mark_seed_secret_unknown(&mut self, reason: &str, message: &str) {
        self.key_pair = None;
        OPERATOR_CONDITIONS.mark_unknown(&mut self.conditions, CONDITION_SEED_SECRET_READY, reason, message);
    }

    pub fn mark_system_account_resolved(&mut self, reference: KeyPairReference) {
        self.resolved_system_account = Some(reference);
        OPERATOR_CONDITIONS.mark_true(&mut self.conditions, CONDITION_SYSTEM_ACCOUNT_RESOLVED);
    }

    pub fn mark_system_account_resolve_failed(&mut self, reason: &str, message: &str) {
        self.resolved_system_account = None;
        OPERATOR_CONDITIONS.mark_false(
            &mut self.conditions,
            CONDITION_SYSTEM_ACCOUNT_RESOLVED,
            reason,
            message,
        );
    }

    pub fn mark_system_account_resolve_unknown(&mut self, reason: &str, message: &str) {
        self.resolved_system_account = None;
        OPERATOR_CONDITIONS.mark_unknown(
            &mut self.conditions,
            CONDITION_SYSTEM_ACCOUNT_RESOLVED,
            reason,
            message,
        );
    }

    pub fn mark_signing_keys_updated(&mut self, signing_keys: Vec<SigningKeyEmbeddedStatus>) {
        let message = format!("found {} signing keys", signing_keys.len());
        self.signing_keys = signing_keys;
        OPERATOR_CONDITIONS.mark_true_with_reason(
            &mut self.conditions,
            CONDITION_SIGNING_KEYS_UPDATED,
            "SigningKeysUpdated",
            &message,
        );
    }

    pub fn mark_signing_keys_update_unknown(&mut self, reason: &str, message: &str) {
        OPERATOR_CONDITIONS.mark_unknown(
            &mut self.conditions,
            CONDITION_SIGNING_KEYS_UPDATED,
            reason,
            message,
        );
    }

    pub fn mark_jwt_secret_ready(&mut self) {
        OPERATOR_CONDITIONS.mark_true(&mut self.conditions, CONDITION_JWT_SECRET_READY);
    }

    pub fn mark_jwt_secret_failed(&mut self, reason: &str, message: &str) {
        OPERATOR_CONDITIONS.mark_false(&mut self.conditions, CONDITION_JWT_SECRET_READY, reason, message);
    }

    pub fn mark_jwt_secret_unknown(&mut self, reason: &str, message: &str) {
        OPERATOR_CONDITIONS.mark_unknown(&mut self.conditions, CONDITION_JWT_SECRET_READY, reason, message);
    }
}
