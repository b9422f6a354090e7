//! Account controller: materializes the account keypair and JWT, resolves
//! the issuer chain up to the owning Operator, keeps the signing-key set
//! current, pushes the account JWT to the account server, and revokes it on
//! deletion through a finalizer.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use k8s_openapi::api::core::v1::{ObjectReference, Secret};
use kube::api::ListParams;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Api, Client, Resource, ResourceExt};
use tracing::{debug, error, info, warn};

use crate::base::{self, Issuer, RESYNC, SigningKeyOwner};
use crate::claims::build_account_claims;
use crate::crds::account::{Account, AccountStatus};
use crate::crds::common::{
    ACCOUNT_FINALIZER, InferredObjectReference, ResourceKind, SECRET_SEED_KEY,
};
use crate::crds::operator::Operator;
use crate::crds::signing_key::SigningKey;
use crate::error::{
    CONFLICT_REQUEUE, ConditionError, DEFAULT_BACKOFF, REASON_INVALID_SIGNING_KEY_OWNER,
    REASON_JWT_PUSH_ERROR, REASON_NOT_FOUND, REASON_NOT_READY, REASON_SYSTEM_ACCOUNT,
    REASON_UNKNOWN_ERROR, REASON_UNSUPPORTED_ISSUER, ReconcileError, is_conflict,
};
use crate::events::EventRecorder;
use crate::helpers::{next_signing_keys, selector_admits};
use crate::http::Metrics;
use crate::jwt::AccountPayload;
use crate::nkey::{self, KeyKind};
use crate::nsc::Session;
use crate::resources::{SecretOwner, SeedSecretOptions};

#[derive(Clone)]
pub struct Ctx {
    pub client: Client,
    pub recorder: EventRecorder,
    pub metrics: Arc<Metrics>,
}

pub fn controller(client: Client) -> Controller<Account> {
    let api: Api<Account> = Api::all(client.clone());
    Controller::new(api, watcher::Config::default())
        .shutdown_on_signal()
        .owns(Api::<Secret>::all(client.clone()), watcher::Config::default())
        .watches(
            Api::<SigningKey>::all(client),
            watcher::Config::default(),
            |sk: SigningKey| {
                let fallback = sk.namespace();
                sk.status
                    .as_ref()
                    .and_then(|s| s.owner_ref.as_ref())
                    .filter(|r| r.kind == "Account")
                    .and_then(|r| {
                        let namespace = r.namespace.clone().or(fallback)?;
                        Some(ObjectRef::new(&r.name).within(&namespace))
                    })
            },
        )
}

pub async fn reconcile(account: Arc<Account>, ctx: Arc<Ctx>) -> Result<Action, ReconcileError> {
    let namespace = account.namespace().unwrap_or_default();
    let name = account.name_any();
    debug!(%name, "reconciling account");

    let mut status = account.status.clone().unwrap_or_default();
    status.initialize_conditions();

    let outcome = reconcile_account(&account, &mut status, &ctx).await;

    if account.status.as_ref() != Some(&status) {
        if let Err(err) =
            base::patch_status::<Account, AccountStatus>(&ctx.client, &namespace, &name, &status)
                .await
        {
            if is_conflict(&err) && outcome.is_ok() {
                return Ok(Action::requeue(CONFLICT_REQUEUE));
            }
            warn!(error = %err, %name, "failed to update account status");
        }
    }

    outcome
}

pub fn error_policy(_account: Arc<Account>, err: &ReconcileError, _ctx: Arc<Ctx>) -> Action {
    match err {
        ReconcileError::Terminal(condition) => {
            debug!(reason = %condition.reason, "account reconcile halted until input changes");
            Action::await_change()
        }
        ReconcileError::RequeueAfter(delay, _) => Action::requeue(*delay),
        _ => {
            error!(error = ?err, "account reconcile failed");
            Action::requeue(DEFAULT_BACKOFF)
        }
    }
}

/// The system account is the Account an Operator's `systemAccountRef`
/// points at, in the Operator's namespace. It is never pushed to the
/// account server.
fn is_system_account(account: &Account, operator: &Operator) -> bool {
    account.namespace() == operator.namespace()
        && account.name_any() == operator.spec.system_account_ref.name
}

async fn reconcile_account(
    account: &Account,
    status: &mut AccountStatus,
    ctx: &Ctx,
) -> Result<Action, ReconcileError> {
    let namespace = account.namespace().unwrap_or_default();
    let api: Api<Account> = Api::namespaced(ctx.client.clone(), &namespace);

    if account.meta().deletion_timestamp.is_some() {
        if account.finalizers().iter().any(|f| f == ACCOUNT_FINALIZER) {
            finalize_account(account, ctx).await?;
            debug!("account successfully finalized");
            base::remove_finalizer(&api, account, ACCOUNT_FINALIZER)
                .await
                .map_err(|e| {
                    ReconcileError::temporary(ConditionError::unknown(
                        REASON_UNKNOWN_ERROR,
                        format!("failed to remove finalizer: {e}"),
                    ))
                })?;
        }
        return Ok(Action::await_change());
    }

    base::ensure_finalizer(&api, account, ACCOUNT_FINALIZER)
        .await
        .map_err(|e| {
            ReconcileError::temporary(ConditionError::unknown(
                REASON_UNKNOWN_ERROR,
                format!("failed to add finalizer: {e}"),
            ))
        })?;

    let reference = account.object_ref(&());
    let owner = SecretOwner {
        kind: ResourceKind::Account,
        name: account.name_any(),
        namespace: namespace.clone(),
        uid: account.uid().unwrap_or_default(),
    };

    match base::reconcile_seed_secret(
        &ctx.client,
        &ctx.recorder,
        &reference,
        &owner,
        &account.spec.seed_secret_name,
        KeyKind::Account,
        &SeedSecretOptions::default(),
    )
    .await
    {
        Ok(outcome) => status.mark_seed_secret_ready(outcome.key_pair),
        Err(err) => {
            let (failure, reason, message) = err.marking();
            if failure {
                status.mark_seed_secret_failed(&reason, &message);
            } else {
                status.mark_seed_secret_unknown(&reason, &message);
            }
            return Err(err);
        }
    }

    // the KeyPairable signing this Account's JWT
    let issuer = match base::resolve_issuer(&ctx.client, &account.spec.issuer, &namespace).await {
        Ok(issuer) => issuer,
        Err(err) => {
            let (failure, reason, message) = err.marking();
            if failure {
                status.mark_issuer_resolve_failed(&reason, &message);
            } else {
                status.mark_issuer_resolve_unknown(&reason, &message);
            }
            return Err(err);
        }
    };

    let operator = resolve_operator(account, status, ctx, &issuer).await?;

    ensure_signing_keys_updated(account, status, ctx).await?;

    let issuer_kp = match load_issuer_seed(ctx, &issuer).await {
        Ok(kp) => kp,
        Err(err) => {
            let (failure, reason, message) = err.marking();
            if failure {
                status.mark_issuer_resolve_failed(&reason, &message);
            } else {
                status.mark_issuer_resolve_unknown(&reason, &message);
            }
            return Err(err);
        }
    };
    status.mark_issuer_resolved();

    let jwt_outcome =
        match reconcile_jwt_secret(account, status, ctx, &issuer_kp, &owner, &reference).await {
            Ok(outcome) => outcome,
            Err(err) => {
                let (failure, reason, message) = err.marking();
                if failure {
                    status.mark_jwt_secret_failed(&reason, &message);
                } else {
                    status.mark_jwt_secret_unknown(&reason, &message);
                }
                return Err(err);
            }
        };
    status.mark_jwt_secret_ready();

    ensure_jwt_pushed(account, status, ctx, &operator, issuer_kp, &jwt_outcome).await?;

    Ok(Action::requeue(RESYNC))
}

/// Resolves the owning Operator: the issuer itself when it is an Operator,
/// or the signing key's owner otherwise.
async fn resolve_operator(
    account: &Account,
    status: &mut AccountStatus,
    ctx: &Ctx,
    issuer: &Issuer,
) -> Result<Operator, ReconcileError> {
    let operator = match issuer {
        Issuer::Operator(operator) => {
            debug!("account issuer is an operator");
            (**operator).clone()
        }
        Issuer::SigningKey(sk) => {
            debug!("account issuer is a signing key, resolving operator");
            match base::resolve_signing_key_owner(&ctx.client, sk).await {
                Ok(SigningKeyOwner::Operator(operator)) => *operator,
                Ok(SigningKeyOwner::Account(owner)) => {
                    let message = format!(
                        "account issuer is not owned by an Operator, got: Account {}",
                        owner.name_any()
                    );
                    status.mark_operator_resolve_failed(REASON_INVALID_SIGNING_KEY_OWNER, &message);
                    return Err(ReconcileError::terminal(ConditionError::failed(
                        REASON_INVALID_SIGNING_KEY_OWNER,
                        message,
                    )));
                }
                Err(err) => {
                    let (failure, reason, message) = err.marking();
                    if failure {
                        status.mark_operator_resolve_failed(&reason, &message);
                    } else {
                        status.mark_operator_resolve_unknown(&reason, &message);
                    }
                    return Err(err);
                }
            }
        }
        Issuer::Account(_) => {
            let message = "invalid issuer, expected Operator or SigningKey, got: Account";
            status.mark_operator_resolve_failed(REASON_UNSUPPORTED_ISSUER, message);
            return Err(ReconcileError::terminal(ConditionError::failed(
                REASON_UNSUPPORTED_ISSUER,
                message,
            )));
        }
    };

    status.mark_operator_resolved(InferredObjectReference {
        namespace: operator.namespace(),
        name: operator.name_any(),
    });

    Ok(operator)
}

async fn ensure_signing_keys_updated(
    account: &Account,
    status: &mut AccountStatus,
    ctx: &Ctx,
) -> Result<(), ReconcileError> {
    let namespace = account.namespace().unwrap_or_default();
    let api: Api<SigningKey> = Api::namespaced(ctx.client.clone(), &namespace);
    let list = api.list(&ListParams::default()).await.map_err(|e| {
        ReconcileError::temporary(ConditionError::unknown(
            REASON_UNKNOWN_ERROR,
            format!("failed to list SigningKeys: {e}"),
        ))
    })?;

    let mut eligible = Vec::new();
    for sk in list.items {
        match selector_admits(account.spec.signing_keys_selector.as_ref(), sk.labels()) {
            Ok(true) => eligible.push(sk),
            Ok(false) => {}
            Err(e) => {
                ctx.recorder
                    .warning(
                        &account.object_ref(&()),
                        "InvalidSigningKeysSelector",
                        format!("failed to parse label selector: {e}"),
                    )
                    .await;
                return Err(ReconcileError::temporary(ConditionError::failed(
                    REASON_UNKNOWN_ERROR,
                    format!("failed to parse signingKeysSelector: {e}"),
                )));
            }
        }
    }

    let uid = account.uid().unwrap_or_default();
    let next = next_signing_keys(&uid, &status.signing_keys, &eligible);

    if next != status.signing_keys {
        ctx.recorder
            .normal(
                &account.object_ref(&()),
                "SigningKeysChanged",
                format!("signing keys set now has {} entries", next.len()),
            )
            .await;
    }

    status.mark_signing_keys_updated(next);

    Ok(())
}

/// Loads the issuer's seed, requiring an Operator-prefixed key (both direct
/// Operator issuers and their signing keys carry the Operator prefix).
async fn load_issuer_seed(ctx: &Ctx, issuer: &Issuer) -> Result<nkeys::KeyPair, ReconcileError> {
    let Some(key_pair) = issuer.key_pair() else {
        warn!("issuer KeyPair is nil, but condition checks should have caught this");
        return Err(ReconcileError::temporary(ConditionError::unknown(
            REASON_UNKNOWN_ERROR,
            "issuer KeyPair is nil",
        )));
    };
    let issuer_namespace = issuer.namespace().unwrap_or_default();
    base::load_issuer_seed(&ctx.client, &issuer_namespace, key_pair, KeyKind::Operator).await
}

async fn reconcile_jwt_secret(
    account: &Account,
    status: &mut AccountStatus,
    ctx: &Ctx,
    issuer_kp: &nkeys::KeyPair,
    owner: &SecretOwner,
    reference: &ObjectReference,
) -> Result<base::JwtSecretOutcome, ReconcileError> {
    let mut want_claims = build_account_claims(account, status).map_err(|e| {
        ReconcileError::terminal(ConditionError::failed(
            REASON_UNKNOWN_ERROR,
            format!("failed to create account JWT claims: {e}"),
        ))
    })?;

    let next_jwt = want_claims.clone().encode(issuer_kp).map_err(|e| {
        ReconcileError::terminal(ConditionError::failed(
            REASON_UNKNOWN_ERROR,
            format!("failed to encode account JWT: {e}"),
        ))
    })?;
    want_claims.iss = issuer_kp.public_key();

    base::ensure_jwt_secret::<AccountPayload>(
        &ctx.client,
        &ctx.recorder,
        reference,
        owner,
        &account.spec.jwt_secret_name,
        &want_claims,
        &next_jwt,
    )
    .await
}

async fn ensure_jwt_pushed(
    account: &Account,
    status: &mut AccountStatus,
    ctx: &Ctx,
    operator: &Operator,
    issuer_kp: nkeys::KeyPair,
    jwt_outcome: &base::JwtSecretOutcome,
) -> Result<(), ReconcileError> {
    if is_system_account(account, operator) {
        status.mark_jwt_pushed_with_reason(
            REASON_SYSTEM_ACCOUNT,
            "system account JWTs are not pushed to the account server",
        );
        return Ok(());
    }

    let previously_pushed = account.status.as_ref().is_some_and(AccountStatus::jwt_pushed);

    let outcome = push_jwt(ctx, operator, issuer_kp, &jwt_outcome.jwt).await;
    if let Err(err) = outcome {
        let (_, reason, message) = err.marking();
        status.mark_jwt_push_failed(&reason, &message);
        return Err(err);
    }

    ctx.metrics.jwt_pushes_total.fetch_add(1, Ordering::Relaxed);
    if jwt_outcome.written && previously_pushed {
        // re-push of a rewritten JWT whose prior version was already
        // acknowledged; the source behavior is ambiguous here, count it
        ctx.metrics
            .jwt_push_ambiguous_total
            .fetch_add(1, Ordering::Relaxed);
    }

    status.mark_jwt_pushed();

    Ok(())
}

async fn push_jwt(
    ctx: &Ctx,
    operator: &Operator,
    issuer_kp: nkeys::KeyPair,
    ajwt: &str,
) -> Result<(), ReconcileError> {
    let url = account_server_url(operator)?;
    let system_seed = load_system_account_seed(ctx, operator).await?;
    let ca = base::load_ca_bundle(&ctx.client, operator).await?;

    let session = Session::connect(&url, issuer_kp, &system_seed, ca.as_deref())
        .await
        .map_err(|e| {
            ReconcileError::temporary(ConditionError::failed(
                REASON_UNKNOWN_ERROR,
                format!("failed to connect to account server: {e}"),
            ))
        })?;

    let result = session.push(ajwt).await;
    session.close().await;

    result.map_err(|e| {
        ReconcileError::temporary(ConditionError::failed(
            REASON_JWT_PUSH_ERROR,
            format!("failed to push account JWT: {e}"),
        ))
    })
}

fn account_server_url(operator: &Operator) -> Result<String, ReconcileError> {
    operator
        .spec
        .account_server_url
        .clone()
        .filter(|url| !url.is_empty())
        .ok_or_else(|| {
            ReconcileError::temporary(ConditionError::failed(
                REASON_NOT_READY,
                "operator has no accountServerURL",
            ))
        })
}

/// Reads the system account's seed via the operator's resolved reference.
async fn load_system_account_seed(ctx: &Ctx, operator: &Operator) -> Result<String, ReconcileError> {
    let resolved = operator
        .status
        .as_ref()
        .and_then(|s| s.resolved_system_account.as_ref())
        .ok_or_else(|| {
            ReconcileError::temporary(ConditionError::unknown(
                REASON_NOT_READY,
                format!(
                    "operator {} does not have a resolved system account",
                    operator.name_any()
                ),
            ))
        })?;

    let namespace = resolved
        .namespace
        .clone()
        .or_else(|| operator.namespace())
        .unwrap_or_default();

    let api: Api<Account> = Api::namespaced(ctx.client.clone(), &namespace);
    let account = api.get_opt(&resolved.name).await.map_err(|e| {
        ReconcileError::temporary(ConditionError::unknown(
            REASON_UNKNOWN_ERROR,
            format!("failed to get system account: {e}"),
        ))
    })?;
    let Some(account) = account else {
        return Err(ReconcileError::temporary(ConditionError::failed(
            REASON_NOT_FOUND,
            format!("system account {}/{}: not found", namespace, resolved.name),
        )));
    };

    let Some(key_pair) = account.key_pair() else {
        return Err(ReconcileError::temporary(ConditionError::failed(
            REASON_NOT_READY,
            format!("system account {}/{} does not have a keypair", namespace, resolved.name),
        )));
    };

    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &namespace);
    let secret = secrets
        .get_opt(&key_pair.seed_secret_name)
        .await
        .map_err(|e| {
            ReconcileError::temporary(ConditionError::unknown(
                REASON_UNKNOWN_ERROR,
                format!("failed to get system account seed secret: {e}"),
            ))
        })?;
    let Some(secret) = secret else {
        return Err(ReconcileError::temporary(ConditionError::failed(
            REASON_NOT_FOUND,
            format!(
                "core/v1; Secret, {}/{}: not found",
                namespace, key_pair.seed_secret_name
            ),
        )));
    };

    let data = secret.data.unwrap_or_default();
    let seed = data.get(SECRET_SEED_KEY).ok_or_else(|| {
        ReconcileError::terminal(ConditionError::failed(
            REASON_UNKNOWN_ERROR,
            format!("system account seed secret missing field {SECRET_SEED_KEY:?}"),
        ))
    })?;

    nkey::seed_from_bytes(&seed.0).map_err(|e| {
        ReconcileError::terminal(ConditionError::failed(
            REASON_UNKNOWN_ERROR,
            format!("system account seed is invalid: {e}"),
        ))
    })
}

/// Deletes the account JWT at the account server. Only acts when the JWT
/// was previously pushed; a half-built account has nothing to tear down.
async fn finalize_account(account: &Account, ctx: &Ctx) -> Result<(), ReconcileError> {
    let Some(status) = account.status.as_ref() else {
        return Ok(());
    };

    if !status.jwt_secret_ready() {
        info!("JWT secret is not ready, skipping finalization");
        return Ok(());
    }
    if !status.jwt_pushed() {
        info!("JWT not pushed, skipping finalization");
        return Ok(());
    }

    let Some(operator_ref) = status.operator_ref.as_ref() else {
        info!("account has no operator reference, skipping finalization");
        return Ok(());
    };
    let Some(account_key_pair) = status.key_pair.as_ref() else {
        info!("account has no keypair, skipping finalization");
        return Ok(());
    };

    let operator_namespace = operator_ref
        .namespace
        .clone()
        .or_else(|| account.namespace())
        .unwrap_or_default();
    let operators: Api<Operator> = Api::namespaced(ctx.client.clone(), &operator_namespace);
    let operator = operators.get_opt(&operator_ref.name).await.map_err(|e| {
        ReconcileError::temporary(ConditionError::unknown(
            REASON_UNKNOWN_ERROR,
            format!("operator could not be loaded: {e}"),
        ))
    })?;
    let Some(operator) = operator else {
        info!("operator not found, skipping finalization");
        return Ok(());
    };

    let Some(operator_key_pair) = operator.key_pair() else {
        return Err(ReconcileError::temporary(ConditionError::unknown(
            REASON_NOT_READY,
            "operator not ready",
        )));
    };

    // deletions are signed by the operator root key
    let operator_kp = base::load_issuer_seed(
        &ctx.client,
        &operator_namespace,
        operator_key_pair,
        KeyKind::Operator,
    )
    .await?;

    let system_seed = match load_system_account_seed(ctx, &operator).await {
        Ok(seed) => seed,
        Err(err) if err.condition().is_some_and(|c| c.reason == REASON_NOT_FOUND) => {
            info!("system account not found, skipping finalization");
            return Ok(());
        }
        Err(err) => return Err(err),
    };

    let url = account_server_url(&operator)?;
    let ca = base::load_ca_bundle(&ctx.client, &operator).await?;

    let session = Session::connect(&url, operator_kp, &system_seed, ca.as_deref())
        .await
        .map_err(|e| {
            ReconcileError::temporary(ConditionError::unknown(
                REASON_UNKNOWN_ERROR,
                format!("failed to connect to account server during finalization: {e}"),
            ))
        })?;

    let result = session.delete(&account_key_pair.public_key).await;
    session.close().await;

    result.map_err(|e| {
        ReconcileError::temporary(ConditionError::unknown(
            REASON_JWT_PUSH_ERROR,
            format!("failed to delete account JWT: {e}"),
        ))
    })?;

    ctx.metrics.jwt_deletes_total.fetch_add(1, Ordering::Relaxed);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::account::AccountSpec;
    use crate::crds::common::{
        API_VERSION, IssuerReference, LocalReference, TypedObjectReference,
    };
    use crate::crds::operator::OperatorSpec;

    fn operator(namespace: &str, system_account: &str) -> Operator {
        let mut operator = Operator::new(
            "main",
            OperatorSpec {
                jwt_secret_name: "main-jwt".into(),
                seed_secret_name: "main-seed".into(),
                system_account_ref: LocalReference {
                    name: system_account.into(),
                },
                accounts_namespace_selector: None,
                accounts_selector: None,
                signing_keys_selector: None,
                tls_config: None,
                account_server_url: Some("nats://nats.example:4222".into()),
                operator_service_urls: Vec::new(),
            },
        );
        operator.metadata.namespace = Some(namespace.into());
        operator
    }

    fn account(namespace: &str, name: &str) -> Account {
        let mut account = Account::new(
            name,
            AccountSpec {
                issuer: IssuerReference {
                    r#ref: TypedObjectReference {
                        api_version: API_VERSION.into(),
                        kind: "Operator".into(),
                        name: "main".into(),
                        namespace: None,
                        uid: None,
                    },
                },
                users_namespace_selector: None,
                users_selector: None,
                jwt_secret_name: format!("{name}-jwt"),
                seed_secret_name: format!("{name}-seed"),
                signing_keys_selector: None,
                imports: Vec::new(),
                exports: Vec::new(),
                limits: None,
            },
        );
        account.metadata.namespace = Some(namespace.into());
        account
    }

    #[test]
    fn system_account_is_name_and_namespace_bound() {
        let operator = operator("nats", "sys");
        assert!(is_system_account(&account("nats", "sys"), &operator));
        assert!(!is_system_account(&account("nats", "tenant-a"), &operator));
        assert!(!is_system_account(&account("other", "sys"), &operator));
    }

    #[test]
    fn missing_account_server_url_is_not_ready() {
        let mut operator = operator("nats", "sys");
        operator.spec.account_server_url = None;
        let err = account_server_url(&operator).unwrap_err();
        assert_eq!(err.condition().unwrap().reason, REASON_NOT_READY);
    }
}
