use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::{
    CONDITION_OWNER_RESOLVED, CONDITION_SEED_SECRET_READY, Condition, ConditionSet,
};
use crate::crds::common::{KeyPair, SigningKeyOwnerReference, TypedObjectReference};
use crate::nkey::KeyKind;

pub static SIGNING_KEY_CONDITIONS: ConditionSet =
    ConditionSet::new(&[CONDITION_OWNER_RESOLVED, CONDITION_SEED_SECRET_READY]);

/// Which role prefix the signing key seed carries. Matches the owner kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum SigningKeyType {
    Operator,
    Account,
}

impl SigningKeyType {
    pub fn key_kind(&self) -> KeyKind {
        match self {
            SigningKeyType::Operator => KeyKind::Operator,
            SigningKeyType::Account => KeyKind::Account,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SigningKeyType::Operator => "Operator",
            SigningKeyType::Account => "Account",
        }
    }
}

/// Delegated signer owned by an Operator or Account. Its public key joins
/// the owner's `signing_keys` set so JWTs it signs stay trusted across root
/// key rotation.
#[derive(CustomResource, Debug, Serialize, Deserialize, Clone, JsonSchema)]
#[kube(
    group = "accounts.nats.io",
    version = "v1alpha1",
    kind = "SigningKey",
    plural = "signingkeys",
    namespaced,
    status = "SigningKeyStatus",
    shortname = "nsk"
)]
#[serde(rename_all = "camelCase")]
pub struct SigningKeySpec {
    /// Role prefix for the generated seed, `Operator` or `Account`.
    pub r#type: SigningKeyType,
    pub seed_secret_name: String,
    /// The owning Operator or Account. Must be in the SigningKey's
    /// namespace; its `signingKeysSelector` must admit this key's labels.
    pub owner_ref: SigningKeyOwnerReference,
}

// status fields serialize even when unset so merge patches clear them
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SigningKeyStatus {
    #[serde(default)]
    pub key_pair: Option<KeyPair>,
    /// The resolved owner, including its uid for adoption checks.
    #[serde(default)]
    pub owner_ref: Option<TypedObjectReference>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl SigningKey {
    pub fn key_pair(&self) -> Option<&KeyPair> {
        self.status.as_ref().and_then(|s| s.key_pair.as_ref())
    }

    pub fn is_ready(&self) -> bool {
        self.status.as_ref().is_some_and(SigningKeyStatus::is_ready)
    }

    pub fn owner_ref(&self) -> Option<&TypedObjectReference> {
        self.status.as_ref().and_then(|s| s.owner_ref.as_ref())
    }
}

impl SigningKeyStatus {
    pub fn initialize_conditions(&mut self) {
        SIGNING_KEY_CONDITIONS.initialize(&mut self.conditions);
    }

    pub fn is_ready(&self) -> bool {
        SIGNING_KEY_CONDITIONS.is_ready(&self.conditions)
    }

    pub fn owner_resolved(&self) -> bool {
        SIGNING_KEY_CONDITIONS
            .get(&self.conditions, CONDITION_OWNER_RESOLVED)
            .is_some_and(Condition::is_true)
    }

    pub fn mark_owner_resolved(&mut self, reference: TypedObjectReference) {
        self.owner_ref = Some(reference);
        SIGNING_KEY_CONDITIONS.mark_true(&mut self.conditions, CONDITION_OWNER_RESOLVED);
    }

    pub fn mark_owner_resolve_failed(&mut self, reason: &str, message: &str) {
        self.owner_ref = None;
        SIGNING_KEY_CONDITIONS.mark_false(&mut self.conditions, CONDITION_OWNER_RESOLVED, reason, message);
    }

    pub fn mark_owner_resolve_unknown(&mut self, reason: &str, message: &str) {
        self.owner_ref = None;
        SIGNING_KEY_CONDITIONS.mark_unknown(&mut self.conditions, CONDITION_OWNER_RESOLVED, reason, message);
    }

    pub fn mark_seed_secret_ready(&mut self, key_pair: KeyPair) {
        self.key_pair = Some(key_pair);
        SIGNING_KEY_CONDITIONS.mark_true(&mut self.conditions, CONDITION_SEED_SECRET_READY);
    }

    pub fn mark_seed_secret_failed(&mut self, reason: &str, message: &str) {
        self.key_pair = None;
        SIGNING_KEY_CONDITIONS.mark_false(&mut self.conditions, CONDITION_SEED_SECRET_READY, reason, message);
    }

    pub fn mark_seed_secret_unknown(&mut self, reason: &str, message: &str) {
        self.key_pair = None;
        SIGNING_KEY_CONDITIONS.mark_unknown(&mut self.conditions, CONDITION_SEED_SECRET_READY, reason, message);
    }
}
