//! Sub-reconcile steps shared by the four controllers: seed-secret
//! materialization, JWT-secret convergence, polymorphic issuer and
//! signing-key-owner resolution, and issuer seed loading.

use k8s_openapi::api::core::v1::{ObjectReference, Secret};
use kube::api::{Patch, PatchParams, PostParams};
use kube::core::NamespaceResourceScope;
use kube::{Api, Client, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, info};

use crate::crds::account::Account;
use crate::crds::common::{
    API_GROUP, IssuerReference, KeyPair, SECRET_JWT_KEY, SECRET_PUBLIC_KEY_KEY, SECRET_SEED_KEY,
};
use crate::crds::operator::Operator;
use crate::crds::signing_key::SigningKey;
use crate::error::{
    ConditionError, REASON_INVALID_JWT_SECRET, REASON_INVALID_SEED_SECRET,
    REASON_INVALID_SIGNING_KEY_OWNER, REASON_ISSUER_SEED_ERROR, REASON_MALFORMED_SEED_SECRET,
    REASON_NOT_FOUND, REASON_NOT_READY, REASON_PUBLIC_KEY_MISMATCH, REASON_UNKNOWN_ERROR,
    REASON_UNSUPPORTED_ISSUER, ReconcileError, is_not_found,
};
use crate::events::EventRecorder;
use crate::jwt::{self, Claims};
use crate::nkey::{self, KeyKind, SeedError};
use crate::resources::{
    SecretOwner, SeedSecretOptions, build_jwt_secret, build_seed_secret, populate_jwt_secret,
    populate_seed_secret,
};

/// Happy-path resync interval; reconciles are full reassertions of desired
/// state, so every resource is revisited periodically.
pub const RESYNC: std::time::Duration = std::time::Duration::from_secs(300);

pub struct SeedSecretOutcome {
    pub key_pair: KeyPair,
    /// Seed material, held on the stack for signing within this reconcile
    /// only. Never copied into status, logs or events.
    pub seed: String,
}

/// Materializes or validates the seed secret for a resource. Missing secrets
/// get a fresh keypair of the requested kind; existing secrets are validated
/// (parseable seed, matching role prefix, public key agreement) and only
/// their metadata is repaired in place.
pub async fn reconcile_seed_secret(
    client: &Client,
    events: &EventRecorder,
    reference: &ObjectReference,
    owner: &SecretOwner,
    secret_name: &str,
    kind: KeyKind,
    opts: &SeedSecretOptions,
) -> Result<SeedSecretOutcome, ReconcileError> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &owner.namespace);

    let got = secrets.get_opt(secret_name).await.map_err(|e| {
        ReconcileError::temporary(ConditionError::unknown(
            REASON_UNKNOWN_ERROR,
            format!("failed to get seed secret: {e}"),
        ))
    })?;

    match got {
        None => {
            debug!(secret = secret_name, "seed secret does not exist, creating");
            create_seed_secret(client, events, reference, owner, secret_name, kind, opts).await
        }
        Some(got) => {
            ensure_seed_secret_up_to_date(client, events, reference, owner, secret_name, kind, opts, got)
                .await
        }
    }
}

async fn create_seed_secret(
    client: &Client,
    events: &EventRecorder,
    reference: &ObjectReference,
    owner: &SecretOwner,
    secret_name: &str,
    kind: KeyKind,
    opts: &SeedSecretOptions,
) -> Result<SeedSecretOutcome, ReconcileError> {
    let kp = kind.create();
    let seed = kp.seed().map_err(|e| {
        ReconcileError::terminal(ConditionError::failed(
            REASON_UNKNOWN_ERROR,
            format!("failed to get seed from generated keypair: {e}"),
        ))
    })?;
    let public_key = kp.public_key();

    let secret = build_seed_secret(owner, secret_name, &seed, &public_key, opts);
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &owner.namespace);
    secrets
        .create(&PostParams::default(), &secret)
        .await
        .map_err(|e| {
            ReconcileError::temporary(ConditionError::unknown(
                REASON_UNKNOWN_ERROR,
                format!("failed to create seed secret: {e}"),
            ))
        })?;

    events
        .normal(
            reference,
            "SeedSecretCreated",
            format!("created secret: {}/{}", owner.namespace, secret_name),
        )
        .await;

    Ok(SeedSecretOutcome {
        key_pair: KeyPair {
            public_key,
            seed_secret_name: secret_name.to_string(),
        },
        seed,
    })
}

#[allow(clippy::too_many_arguments)]
async fn ensure_seed_secret_up_to_date(
    client: &Client,
    events: &EventRecorder,
    reference: &ObjectReference,
    owner: &SecretOwner,
    secret_name: &str,
    kind: KeyKind,
    opts: &SeedSecretOptions,
    got: Secret,
) -> Result<SeedSecretOutcome, ReconcileError> {
    let data = got.data.clone().unwrap_or_default();
    let seed_bytes = data.get(SECRET_SEED_KEY).ok_or_else(|| {
        ReconcileError::terminal(ConditionError::failed(
            REASON_INVALID_SEED_SECRET,
            "seed secret does not contain seed data, delete the secret for a new keypair",
        ))
    })?;

    let seed = nkey::seed_from_bytes(&seed_bytes.0).map_err(|e| {
        ReconcileError::terminal(ConditionError::failed(
            REASON_MALFORMED_SEED_SECRET,
            e.to_string(),
        ))
    })?;

    let kp = nkey::from_seed_expecting(&seed, kind).map_err(|e| {
        let reason = match e {
            SeedError::WrongPrefix { .. } => REASON_MALFORMED_SEED_SECRET,
            _ => REASON_INVALID_SEED_SECRET,
        };
        ReconcileError::terminal(ConditionError::failed(reason, e.to_string()))
    })?;

    let public_key = kp.public_key();
    if let Some(stored) = data.get(SECRET_PUBLIC_KEY_KEY) {
        let stored = String::from_utf8_lossy(&stored.0);
        let stored = stored.trim();
        if stored != public_key {
            return Err(ReconcileError::terminal(ConditionError::failed(
                REASON_PUBLIC_KEY_MISMATCH,
                format!("public key mismatch, wanted {stored:?} but got {public_key:?}"),
            )));
        }
    }

    let mut want = got.clone();
    populate_seed_secret(&mut want, owner, secret_name, &seed, &public_key, opts);
    if want != got {
        debug!(secret = secret_name, "seed secret does not match desired state, updating");
        let secrets: Api<Secret> = Api::namespaced(client.clone(), &owner.namespace);
        secrets
            .replace(secret_name, &PostParams::default(), &want)
            .await
            .map_err(|e| {
                ReconcileError::temporary(ConditionError::unknown(
                    REASON_UNKNOWN_ERROR,
                    format!("failed to update seed secret: {e}"),
                ))
            })?;

        events
            .normal(
                reference,
                "SeedSecretUpdated",
                format!("updated secret: {}/{}", owner.namespace, secret_name),
            )
            .await;
    }

    Ok(SeedSecretOutcome {
        key_pair: KeyPair {
            public_key,
            seed_secret_name: secret_name.to_string(),
        },
        seed,
    })
}

pub async fn create_jwt_secret(
    client: &Client,
    events: &EventRecorder,
    reference: &ObjectReference,
    owner: &SecretOwner,
    secret_name: &str,
    jwt: &str,
) -> Result<(), ReconcileError> {
    let secret = build_jwt_secret(owner, secret_name, jwt);
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &owner.namespace);
    secrets
        .create(&PostParams::default(), &secret)
        .await
        .map_err(|e| {
            ReconcileError::temporary(ConditionError::unknown(
                REASON_UNKNOWN_ERROR,
                format!("failed to create JWT secret: {e}"),
            ))
        })?;

    events
        .normal(
            reference,
            "JWTSecretCreated",
            format!("created secret: {}/{}", owner.namespace, secret_name),
        )
        .await;

    Ok(())
}

pub struct JwtSecretOutcome {
    /// The JWT that ended up in the secret.
    pub jwt: String,
    /// Whether the secret was created or rewritten this reconcile.
    pub written: bool,
}

/// Converges the JWT secret on the desired claims. The stored token is
/// decoded and compared structurally (ignoring `jti`/`iat`); only drift
/// triggers a rewrite with `next_jwt`.
pub async fn ensure_jwt_secret<T>(
    client: &Client,
    events: &EventRecorder,
    reference: &ObjectReference,
    owner: &SecretOwner,
    secret_name: &str,
    want_claims: &Claims<T>,
    next_jwt: &str,
) -> Result<JwtSecretOutcome, ReconcileError>
where
    T: Serialize + DeserializeOwned + Clone + PartialEq,
{
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &owner.namespace);
    let got = secrets.get_opt(secret_name).await.map_err(|e| {
        ReconcileError::temporary(ConditionError::unknown(
            REASON_UNKNOWN_ERROR,
            format!("failed to get JWT secret: {e}"),
        ))
    })?;

    let Some(got) = got else {
        debug!(secret = secret_name, "JWT secret not found, creating new secret");
        create_jwt_secret(client, events, reference, owner, secret_name, next_jwt).await?;
        return Ok(JwtSecretOutcome {
            jwt: next_jwt.to_string(),
            written: true,
        });
    };

    let data = got.data.clone().unwrap_or_default();
    let Some(got_jwt) = data.get(SECRET_JWT_KEY) else {
        let owned = got
            .owner_references()
            .iter()
            .any(|r| r.uid == owner.uid);
        if !owned {
            return Err(ReconcileError::terminal(ConditionError::failed(
                REASON_INVALID_JWT_SECRET,
                "JWT secret does not contain JWT data and is not owned by this controller",
            )));
        }

        info!(secret = secret_name, "existing JWT secret does not contain JWT data, deleting to generate a new JWT");
        secrets
            .delete(secret_name, &Default::default())
            .await
            .map_err(|e| {
                ReconcileError::temporary(ConditionError::unknown(
                    REASON_UNKNOWN_ERROR,
                    format!("failed to delete invalid JWT secret: {e}"),
                ))
            })?;
        events
            .normal(
                reference,
                "JWTSecretDeleted",
                format!("deleted secret: {}/{}", owner.namespace, secret_name),
            )
            .await;

        create_jwt_secret(client, events, reference, owner, secret_name, next_jwt).await?;
        return Ok(JwtSecretOutcome {
            jwt: next_jwt.to_string(),
            written: true,
        });
    };

    let got_jwt = String::from_utf8_lossy(&got_jwt.0).to_string();
    match jwt::decode::<T>(&got_jwt) {
        Err(err) => {
            info!(reason = %err, "failed to decode JWT from secret, updating to latest version");
        }
        Ok(got_claims) if !got_claims.equal_ignoring_stamps(want_claims) => {
            debug!(secret = secret_name, "existing JWT secret does not match desired claims, updating");
        }
        Ok(_) => {
            debug!(secret = secret_name, "existing JWT secret matches desired claims, no update required");
            return Ok(JwtSecretOutcome {
                jwt: got_jwt,
                written: false,
            });
        }
    }

    let mut want = got.clone();
    populate_jwt_secret(&mut want, owner, secret_name, next_jwt);
    match secrets.replace(secret_name, &PostParams::default(), &want).await {
        Ok(_) => {}
        Err(e) if is_not_found(&e) => {
            create_jwt_secret(client, events, reference, owner, secret_name, next_jwt).await?;
            return Ok(JwtSecretOutcome {
                jwt: next_jwt.to_string(),
                written: true,
            });
        }
        Err(e) => {
            return Err(ReconcileError::temporary(ConditionError::unknown(
                REASON_UNKNOWN_ERROR,
                format!("failed to update JWT secret: {e}"),
            )));
        }
    }

    events
        .normal(
            reference,
            "JWTSecretUpdated",
            format!("updated secret: {}/{}", owner.namespace, secret_name),
        )
        .await;

    Ok(JwtSecretOutcome {
        jwt: next_jwt.to_string(),
        written: true,
    })
}

/// The resolved issuer of an Account or User: the single polymorphic join
/// point of the hierarchy. Dispatch is explicit at every call site;
/// unsupported variants mark terminal conditions there.
pub enum Issuer {
    Operator(Box<Operator>),
    Account(Box<Account>),
    SigningKey(Box<SigningKey>),
}

impl Issuer {
    pub fn kind(&self) -> &'static str {
        match self {
            Issuer::Operator(_) => "Operator",
            Issuer::Account(_) => "Account",
            Issuer::SigningKey(_) => "SigningKey",
        }
    }

    pub fn name(&self) -> String {
        match self {
            Issuer::Operator(o) => o.name_any(),
            Issuer::Account(a) => a.name_any(),
            Issuer::SigningKey(s) => s.name_any(),
        }
    }

    pub fn namespace(&self) -> Option<String> {
        match self {
            Issuer::Operator(o) => o.namespace(),
            Issuer::Account(a) => a.namespace(),
            Issuer::SigningKey(s) => s.namespace(),
        }
    }

    pub fn key_pair(&self) -> Option<&KeyPair> {
        match self {
            Issuer::Operator(o) => o.key_pair(),
            Issuer::Account(a) => a.key_pair(),
            Issuer::SigningKey(s) => s.key_pair(),
        }
    }

    fn is_ready(&self) -> bool {
        match self {
            Issuer::Operator(o) => o.is_ready(),
            Issuer::Account(a) => a.is_ready(),
            Issuer::SigningKey(s) => s.is_ready(),
        }
    }
}

/// Resolves an issuer reference to its typed object. The reference
/// namespace defaults to `fallback_namespace` (the referencing resource's
/// own namespace). The issuer must be overall Ready before it may sign.
pub async fn resolve_issuer(
    client: &Client,
    issuer: &IssuerReference,
    fallback_namespace: &str,
) -> Result<Issuer, ReconcileError> {
    let r = &issuer.r#ref;
    if r.group() != API_GROUP {
        return Err(ReconcileError::terminal(ConditionError::failed(
            REASON_UNSUPPORTED_ISSUER,
            format!("unsupported issuer apiVersion {:?}", r.api_version),
        )));
    }

    let namespace = r
        .namespace
        .as_deref()
        .filter(|ns| !ns.is_empty())
        .unwrap_or(fallback_namespace);

    let resolved = match r.kind.as_str() {
        "Operator" => {
            let api: Api<Operator> = Api::namespaced(client.clone(), namespace);
            get_issuer(&api, &r.name).await?.map(|o| Issuer::Operator(Box::new(o)))
        }
        "Account" => {
            let api: Api<Account> = Api::namespaced(client.clone(), namespace);
            get_issuer(&api, &r.name).await?.map(|a| Issuer::Account(Box::new(a)))
        }
        "SigningKey" => {
            let api: Api<SigningKey> = Api::namespaced(client.clone(), namespace);
            get_issuer(&api, &r.name).await?.map(|s| Issuer::SigningKey(Box::new(s)))
        }
        other => {
            return Err(ReconcileError::terminal(ConditionError::failed(
                REASON_UNSUPPORTED_ISSUER,
                format!("unsupported issuer kind {other:?}"),
            )));
        }
    };

    let Some(issuer) = resolved else {
        return Err(ReconcileError::temporary(ConditionError::failed(
            REASON_NOT_FOUND,
            format!("{}, {}/{}: not found", r.kind, namespace, r.name),
        )));
    };

    if !issuer.is_ready() {
        return Err(ReconcileError::temporary(ConditionError::failed(
            REASON_NOT_READY,
            "issuer is not ready",
        )));
    }

    Ok(issuer)
}

async fn get_issuer<K>(api: &Api<K>, name: &str) -> Result<Option<K>, ReconcileError>
where
    K: kube::Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    api.get_opt(name).await.map_err(|e| {
        ReconcileError::temporary(ConditionError::unknown(
            REASON_UNKNOWN_ERROR,
            format!("failed to get issuer object: {e}"),
        ))
    })
}

/// The owner a SigningKey resolved in its status: an Operator or Account.
pub enum SigningKeyOwner {
    Operator(Box<Operator>),
    Account(Box<Account>),
}

/// Dereferences `status.ownerRef` of a SigningKey back to its owning object.
pub async fn resolve_signing_key_owner(
    client: &Client,
    signing_key: &SigningKey,
) -> Result<SigningKeyOwner, ReconcileError> {
    let status_resolved = signing_key
        .status
        .as_ref()
        .is_some_and(|s| s.owner_resolved());
    if !status_resolved {
        return Err(ReconcileError::temporary(ConditionError::unknown(
            REASON_NOT_READY,
            "signing key owner has not been resolved",
        )));
    }

    let owner_ref = signing_key.owner_ref().expect("owner resolved implies ownerRef");
    let namespace = owner_ref
        .namespace
        .clone()
        .or_else(|| signing_key.namespace())
        .unwrap_or_default();

    match owner_ref.kind.as_str() {
        "Operator" => {
            let api: Api<Operator> = Api::namespaced(client.clone(), &namespace);
            match api.get_opt(&owner_ref.name).await {
                Ok(Some(operator)) => Ok(SigningKeyOwner::Operator(Box::new(operator))),
                Ok(None) => Err(owner_not_found(&owner_ref.kind, &namespace, &owner_ref.name)),
                Err(e) => Err(owner_get_failed(e)),
            }
        }
        "Account" => {
            let api: Api<Account> = Api::namespaced(client.clone(), &namespace);
            match api.get_opt(&owner_ref.name).await {
                Ok(Some(account)) => Ok(SigningKeyOwner::Account(Box::new(account))),
                Ok(None) => Err(owner_not_found(&owner_ref.kind, &namespace, &owner_ref.name)),
                Err(e) => Err(owner_get_failed(e)),
            }
        }
        other => Err(ReconcileError::temporary(ConditionError::failed(
            REASON_INVALID_SIGNING_KEY_OWNER,
            format!("unsupported signing key owner kind {other:?}"),
        ))),
    }
}

fn owner_not_found(kind: &str, namespace: &str, name: &str) -> ReconcileError {
    ReconcileError::temporary(ConditionError::failed(
        REASON_NOT_FOUND,
        format!("{kind}, {namespace}/{name}: not found"),
    ))
}

fn owner_get_failed(err: kube::Error) -> ReconcileError {
    ReconcileError::temporary(ConditionError::unknown(
        REASON_UNKNOWN_ERROR,
        format!("failed to get owner object: {err}"),
    ))
}

/// Loads and validates the seed behind an issuer's keypair: the named secret
/// must exist, parse as a seed of the expected role, and derive the exact
/// public key recorded in the issuer's status.
pub async fn load_issuer_seed(
    client: &Client,
    issuer_namespace: &str,
    issuer_key_pair: &KeyPair,
    want: KeyKind,
) -> Result<nkeys::KeyPair, ReconcileError> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), issuer_namespace);
    let secret = secrets
        .get_opt(&issuer_key_pair.seed_secret_name)
        .await
        .map_err(|e| {
            ReconcileError::temporary(ConditionError::unknown(
                REASON_ISSUER_SEED_ERROR,
                format!("failed to get issuer seed: {e}"),
            ))
        })?;

    let Some(secret) = secret else {
        return Err(ReconcileError::temporary(ConditionError::failed(
            REASON_NOT_FOUND,
            format!(
                "core/v1; Secret, {}/{}: not found",
                issuer_namespace, issuer_key_pair.seed_secret_name
            ),
        )));
    };

    let data = secret.data.unwrap_or_default();
    let seed_bytes = data.get(SECRET_SEED_KEY).ok_or_else(|| {
        ReconcileError::terminal(ConditionError::failed(
            REASON_MALFORMED_SEED_SECRET,
            format!("secret missing required field: {SECRET_SEED_KEY}"),
        ))
    })?;

    let seed = nkey::seed_from_bytes(&seed_bytes.0).map_err(|e| {
        ReconcileError::terminal(ConditionError::failed(
            REASON_MALFORMED_SEED_SECRET,
            e.to_string(),
        ))
    })?;

    let kp = nkey::from_seed_expecting(&seed, want).map_err(|e| {
        ReconcileError::terminal(ConditionError::failed(
            REASON_MALFORMED_SEED_SECRET,
            e.to_string(),
        ))
    })?;

    let public_key = kp.public_key();
    if public_key != issuer_key_pair.public_key {
        return Err(ReconcileError::terminal(ConditionError::failed(
            REASON_PUBLIC_KEY_MISMATCH,
            format!(
                "public key mismatch, wanted {:?} but got {:?}",
                issuer_key_pair.public_key, public_key
            ),
        )));
    }

    Ok(kp)
}

/// Loads the CA bundle referenced by the operator's TLS config. `Ok(None)`
/// when no TLS config is present.
pub async fn load_ca_bundle(
    client: &Client,
    operator: &Operator,
) -> Result<Option<Vec<u8>>, ReconcileError> {
    let Some(tls) = &operator.spec.tls_config else {
        return Ok(None);
    };
    let Some(ca_ref) = &tls.ca_file else {
        return Err(ReconcileError::temporary(ConditionError::failed(
            REASON_UNKNOWN_ERROR,
            "invalid TLS config: missing caFile",
        )));
    };

    let namespace = operator.namespace().unwrap_or_default();
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &namespace);
    let secret = secrets.get_opt(&ca_ref.name).await.map_err(|e| {
        ReconcileError::temporary(ConditionError::unknown(
            REASON_UNKNOWN_ERROR,
            format!("failed to get caFile secret: {e}"),
        ))
    })?;

    let Some(secret) = secret else {
        return Err(ReconcileError::temporary(ConditionError::failed(
            REASON_NOT_FOUND,
            format!("caFile secret {}/{}: not found", namespace, ca_ref.name),
        )));
    };

    let key = ca_ref.key_or_default();
    let data = secret.data.unwrap_or_default();
    match data.get(key) {
        Some(ca) => Ok(Some(ca.0.clone())),
        None => Err(ReconcileError::temporary(ConditionError::failed(
            REASON_UNKNOWN_ERROR,
            format!("caFile secret missing key {key:?}"),
        ))),
    }
}

/// Posts a status merge patch for a resource.
pub async fn patch_status<K, S>(
    client: &Client,
    namespace: &str,
    name: &str,
    status: &S,
) -> Result<(), kube::Error>
where
    K: kube::Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + std::fmt::Debug,
    K::DynamicType: Default,
    S: Serialize,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    api.patch_status(
        name,
        &PatchParams::default(),
        &Patch::Merge(json!({ "status": status })),
    )
    .await?;
    Ok(())
}

/// Adds `finalizer` if absent, preserving any other entries. Returns true
/// when the object was patched.
pub async fn ensure_finalizer<K>(api: &Api<K>, obj: &K, finalizer: &str) -> Result<bool, kube::Error>
where
    K: kube::Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    if obj.finalizers().iter().any(|f| f == finalizer) {
        return Ok(false);
    }
    let mut finalizers = obj.finalizers().to_vec();
    finalizers.push(finalizer.to_string());
    let patch = json!({ "metadata": { "finalizers": finalizers } });
    api.patch(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(true)
}

/// Removes `finalizer`, leaving other entries in place.
pub async fn remove_finalizer<K>(api: &Api<K>, obj: &K, finalizer: &str) -> Result<(), kube::Error>
where
    K: kube::Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    let remaining: Vec<String> = obj
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != finalizer)
        .cloned()
        .collect();
    let value = if remaining.is_empty() {
        serde_json::Value::Null
    } else {
        json!(remaining)
    };
    let patch = json!({ "metadata": { "finalizers": value } });
    api.patch(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}
