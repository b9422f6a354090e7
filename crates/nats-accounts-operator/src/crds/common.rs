use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const API_GROUP: &str = "accounts.nats.io";
pub const API_VERSION: &str = "accounts.nats.io/v1alpha1";

/// Secret data keys shared by every materialized secret.
pub const SECRET_SEED_KEY: &str = "seed.nk";
pub const SECRET_PUBLIC_KEY_KEY: &str = "public.nk";
pub const SECRET_JWT_KEY: &str = "nats.jwt";
pub const SECRET_CREDS_KEY: &str = "nats.creds";
pub const SECRET_CA_KEY: &str = "ca.crt";

pub const ANNOTATION_SECRET_TYPE: &str = "accounts.nats.io/secret-type";
pub const ANNOTATION_SEED_TYPE: &str = "accounts.nats.io/seed-type";
pub const ANNOTATION_JWT_TYPE: &str = "accounts.nats.io/jwt-type";

pub const SECRET_TYPE_SEED: &str = "seed";
pub const SECRET_TYPE_JWT: &str = "jwt";
pub const SECRET_TYPE_CREDENTIALS: &str = "credentials";

pub const LABEL_SUBJECT: &str = "accounts.nats.io/subject";
pub const LABEL_OPERATOR_NAME: &str = "accounts.nats.io/operator";
pub const LABEL_ACCOUNT_NAME: &str = "accounts.nats.io/account";
pub const LABEL_SIGNING_KEY_NAME: &str = "accounts.nats.io/signing-key";
pub const LABEL_USER_NAME: &str = "accounts.nats.io/user";

/// Finalizer owned by the Account controller; gates account-server teardown.
pub const ACCOUNT_FINALIZER: &str = "accounts.nats.io/finalizer";

/// Deletion-prevention marker placed on Operator seed secrets. No controller
/// removes it; an operator must clear it by hand before the seed can be
/// garbage-collected.
pub const SEED_PROTECTION_FINALIZER: &str = "accounts.nats.io/seed-protection";

/// The four resource kinds materializing credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Operator,
    SigningKey,
    Account,
    User,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Operator => "Operator",
            ResourceKind::SigningKey => "SigningKey",
            ResourceKind::Account => "Account",
            ResourceKind::User => "User",
        }
    }

    /// Label key carrying the owning resource's name on materialized secrets.
    pub fn name_label(&self) -> &'static str {
        match self {
            ResourceKind::Operator => LABEL_OPERATOR_NAME,
            ResourceKind::SigningKey => LABEL_SIGNING_KEY_NAME,
            ResourceKind::Account => LABEL_ACCOUNT_NAME,
            ResourceKind::User => LABEL_USER_NAME,
        }
    }
}

/// Public half of a keypair plus the name of the secret carrying its seed.
/// Seed material never appears in a status, only the secret name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KeyPair {
    pub public_key: String,
    pub seed_secret_name: String,
}

/// Object reference whose apiVersion and kind are inferred from where the
/// reference is used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InferredObjectReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TypedObjectReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

impl TypedObjectReference {
    /// The API group portion of `apiVersion`.
    pub fn group(&self) -> &str {
        self.api_version
            .split_once('/')
            .map(|(group, _)| group)
            .unwrap_or("")
    }
}

/// Reference to a local resource by name only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalReference {
    pub name: String,
}

/// Reference plus the public key observed when the reference was resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KeyPairReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
    pub public_key: String,
}

/// Points at the object whose keypair signs JWTs for an Account or User.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IssuerReference {
    pub r#ref: TypedObjectReference,
}

/// The owning object for a SigningKey; one of Operator or Account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SigningKeyOwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
}

/// Name + keypair of a SigningKey embedded into its owner's status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SigningKeyEmbeddedStatus {
    pub name: String,
    pub key_pair: KeyPair,
}

/// Server-side TLS verification for the account-server connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    /// Secret holding the CA certificate bundle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<SecretKeyReference>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyReference {
    pub name: String,
    /// Key within the secret, defaults to `ca.crt`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl SecretKeyReference {
    pub fn key_or_default(&self) -> &str {
        self.key.as_deref().unwrap_or(SECRET_CA_KEY)
    }
}
