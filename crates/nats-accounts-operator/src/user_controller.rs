//! User controller: materializes per-principal credentials. Resolves the
//! issuer (Account or SigningKey owned by an Account), enforces the
//! account's user-admission policy, and produces the seed, JWT and
//! credentials-bundle secrets.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Namespace, ObjectReference, Secret};
use kube::api::{Patch, PatchParams, PostParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Api, Client, Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, error, warn};

use crate::base::{self, Issuer, RESYNC, SigningKeyOwner};
use crate::claims::build_user_claims;
use crate::crds::account::Account;
use crate::crds::common::{InferredObjectReference, LABEL_ACCOUNT_NAME, ResourceKind};
use crate::crds::operator::Operator;
use crate::crds::user::{User, UserStatus};
use crate::error::{
    CONFLICT_REQUEUE, ConditionError, DEFAULT_BACKOFF, REASON_INVALID_SIGNING_KEY_OWNER,
    REASON_NOT_ALLOWED, REASON_NOT_READY, REASON_UNKNOWN_ERROR, REASON_UNSUPPORTED_ISSUER,
    ReconcileError, is_conflict,
};
use crate::events::EventRecorder;
use crate::helpers::{label_selector_matches, namespace_selector_admits};
use crate::jwt::UserPayload;
use crate::nkey::KeyKind;
use crate::nsc::format_user_config;
use crate::resources::{SecretOwner, SeedSecretOptions, populate_credentials_secret};

#[derive(Clone)]
pub struct Ctx {
    pub client: Client,
    pub recorder: EventRecorder,
}

pub fn controller(client: Client) -> Controller<User> {
    let api: Api<User> = Api::all(client.clone());
    let controller = Controller::new(api, watcher::Config::default()).shutdown_on_signal();
    let store = controller.store();

    controller
        .owns(Api::<Secret>::all(client.clone()), watcher::Config::default())
        .watches(
            Api::<Account>::all(client),
            watcher::Config::default(),
            move |account: Account| {
                // enqueue every User labelled as belonging to this Account
                let name = account.name_any();
                store
                    .state()
                    .into_iter()
                    .filter(|user| user.labels().get(LABEL_ACCOUNT_NAME) == Some(&name))
                    .map(|user| ObjectRef::from_obj(&*user))
                    .collect::<Vec<_>>()
            },
        )
}

pub async fn reconcile(user: Arc<User>, ctx: Arc<Ctx>) -> Result<Action, ReconcileError> {
    let namespace = user.namespace().unwrap_or_default();
    let name = user.name_any();
    debug!(%name, "reconciling user");

    let mut status = user.status.clone().unwrap_or_default();
    status.initialize_conditions();

    let outcome = reconcile_user(&user, &mut status, &ctx).await;

    if user.status.as_ref() != Some(&status) {
        if let Err(err) =
            base::patch_status::<User, UserStatus>(&ctx.client, &namespace, &name, &status).await
        {
            if is_conflict(&err) && outcome.is_ok() {
                return Ok(Action::requeue(CONFLICT_REQUEUE));
            }
            warn!(error = %err, %name, "failed to update user status");
        }
    }

    outcome
}

pub fn error_policy(_user: Arc<User>, err: &ReconcileError, _ctx: Arc<Ctx>) -> Action {
    match err {
        ReconcileError::Terminal(condition) => {
            debug!(reason = %condition.reason, "user reconcile halted until input changes");
            Action::await_change()
        }
        ReconcileError::RequeueAfter(delay, _) => Action::requeue(*delay),
        _ => {
            error!(error = ?err, "user reconcile failed");
            Action::requeue(DEFAULT_BACKOFF)
        }
    }
}

async fn reconcile_user(
    user: &User,
    status: &mut UserStatus,
    ctx: &Ctx,
) -> Result<Action, ReconcileError> {
    // no external-system state, deletion needs no teardown
    if user.meta().deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    let namespace = user.namespace().unwrap_or_default();
    let reference = user.object_ref(&());
    let owner = SecretOwner {
        kind: ResourceKind::User,
        name: user.name_any(),
        namespace: namespace.clone(),
        uid: user.uid().unwrap_or_default(),
    };

    let seed = match base::reconcile_seed_secret(
        &ctx.client,
        &ctx.recorder,
        &reference,
        &owner,
        &user.spec.seed_secret_name,
        KeyKind::User,
        &SeedSecretOptions::default(),
    )
    .await
    {
        Ok(outcome) => {
            status.mark_seed_secret_ready(outcome.key_pair.clone());
            outcome
        }
        Err(err) => {
            let (failure, reason, message) = err.marking();
            if failure {
                status.mark_seed_secret_failed(&reason, &message);
            } else {
                status.mark_seed_secret_unknown(&reason, &message);
            }
            return Err(err);
        }
    };

    let issuer = match base::resolve_issuer(&ctx.client, &user.spec.issuer, &namespace).await {
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

    let account = resolve_account(user, status, ctx, &issuer).await?;

    if let Err(err) = validate_account_policy(user, &account, ctx).await {
        let (failure, reason, message) = err.marking();
        if failure {
            status.mark_account_resolve_failed(&reason, &message);
        } else {
            status.mark_account_resolve_unknown(&reason, &message);
        }
        return Err(err);
    }

    status.mark_account_resolved(InferredObjectReference {
        namespace: account.namespace(),
        name: account.name_any(),
    });

    if reconcile_labels(user, &account, ctx).await? {
        // the label write re-enqueues us through the Account watch index
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

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

    debug!("reconciling user JWT secret");
    let account_public_key = match account.key_pair() {
        Some(kp) => kp.public_key.clone(),
        None => {
            return Err(ReconcileError::temporary(ConditionError::unknown(
                REASON_NOT_READY,
                "account does not have a keypair",
            )));
        }
    };

    let jwt = match reconcile_jwt_secret(
        user,
        status,
        ctx,
        &issuer_kp,
        &account_public_key,
        &owner,
        &reference,
    )
    .await
    {
        Ok(outcome) => outcome.jwt,
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

    debug!("reconciling user credentials secret");
    if let Err(err) =
        ensure_credentials_secret(user, ctx, &account, &jwt, &seed.seed, &owner, &reference).await
    {
        let (failure, reason, message) = err.marking();
        if failure {
            status.mark_credentials_secret_failed(&reason, &message);
        } else {
            status.mark_credentials_secret_unknown(&reason, &message);
        }
        return Err(err);
    }
    status.mark_credentials_secret_ready();

    Ok(Action::requeue(RESYNC))
}

/// Resolves the Account behind the issuer. A SigningKey issuer must be
/// owned by an Account which must itself be Ready.
async fn resolve_account(
    user: &User,
    status: &mut UserStatus,
    ctx: &Ctx,
    issuer: &Issuer,
) -> Result<Account, ReconcileError> {
    match issuer {
        Issuer::Account(account) => {
            debug!("user issuer is an account");
            Ok((**account).clone())
        }
        Issuer::SigningKey(sk) => {
            debug!("user issuer is a signing key, resolving owner");
            match base::resolve_signing_key_owner(&ctx.client, sk).await {
                Ok(SigningKeyOwner::Account(account)) => {
                    if !account.is_ready() {
                        return Err(ReconcileError::temporary(ConditionError::unknown(
                            REASON_NOT_READY,
                            "signing key owner is not ready",
                        )));
                    }
                    Ok(*account)
                }
                Ok(SigningKeyOwner::Operator(owner)) => {
                    let message = format!(
                        "user issuer is not owned by an Account, got: Operator {}",
                        owner.name_any()
                    );
                    status.mark_account_resolve_failed(REASON_INVALID_SIGNING_KEY_OWNER, &message);
                    Err(ReconcileError::terminal(ConditionError::failed(
                        REASON_INVALID_SIGNING_KEY_OWNER,
                        message,
                    )))
                }
                Err(err) => {
                    let (failure, reason, message) = err.marking();
                    if failure {
                        status.mark_account_resolve_failed(&reason, &message);
                    } else {
                        status.mark_account_resolve_unknown(&reason, &message);
                    }
                    Err(err)
                }
            }
        }
        Issuer::Operator(_) => {
            let message = "invalid issuer, expected Account or SigningKey, got: Operator";
            status.mark_account_resolve_failed(REASON_UNSUPPORTED_ISSUER, message);
            Err(ReconcileError::terminal(ConditionError::failed(
                REASON_UNSUPPORTED_ISSUER,
                message,
            )))
        }
    }
}

/// Enforces the account's user-admission policy: the namespace selector
/// (nil restricts to the account's own namespace, empty admits any) and the
/// user label selector. Violations are terminal.
async fn validate_account_policy(
    user: &User,
    account: &Account,
    ctx: &Ctx,
) -> Result<(), ReconcileError> {
    let user_namespace = user.namespace().unwrap_or_default();
    let namespaces: Api<Namespace> = Api::all(ctx.client.clone());
    let namespace = namespaces.get_opt(&user_namespace).await.map_err(|e| {
        ReconcileError::temporary(ConditionError::unknown(
            REASON_UNKNOWN_ERROR,
            format!("failed to get user namespace: {e}"),
        ))
    })?;
    let Some(namespace) = namespace else {
        return Err(ReconcileError::temporary(ConditionError::unknown(
            REASON_UNKNOWN_ERROR,
            format!("user namespace {user_namespace:?} not found"),
        )));
    };

    let account_namespace = account.namespace().unwrap_or_default();
    let admitted = namespace_selector_admits(
        &account_namespace,
        account.spec.users_namespace_selector.as_ref(),
        &namespace,
    )
    .map_err(|e| {
        ReconcileError::terminal(ConditionError::failed(
            REASON_NOT_ALLOWED,
            format!("failed to validate usersNamespaceSelector: {e}"),
        ))
    })?;
    if !admitted {
        return Err(ReconcileError::terminal(ConditionError::failed(
            REASON_NOT_ALLOWED,
            "account.spec.usersNamespaceSelector does not match user namespace",
        )));
    }

    if let Some(selector) = account.spec.users_selector.as_ref() {
        let matched = label_selector_matches(selector, user.labels()).map_err(|e| {
            ReconcileError::terminal(ConditionError::failed(
                REASON_NOT_ALLOWED,
                format!("failed to parse account.spec.usersSelector: {e}"),
            ))
        })?;
        if !matched {
            return Err(ReconcileError::terminal(ConditionError::failed(
                REASON_NOT_ALLOWED,
                "account.spec.usersSelector does not match user labels",
            )));
        }
    }

    Ok(())
}

/// Maintains the `accounts.nats.io/account` label used by the Account
/// watch index. Returns true when a write happened.
async fn reconcile_labels(user: &User, account: &Account, ctx: &Ctx) -> Result<bool, ReconcileError> {
    let account_name = account.name_any();
    if user.labels().get(LABEL_ACCOUNT_NAME) == Some(&account_name) {
        return Ok(false);
    }

    let namespace = user.namespace().unwrap_or_default();
    let api: Api<User> = Api::namespaced(ctx.client.clone(), &namespace);
    let patch = json!({ "metadata": { "labels": { LABEL_ACCOUNT_NAME: account_name } } });
    api.patch(&user.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(|e| {
            ReconcileError::temporary(ConditionError::unknown(
                REASON_UNKNOWN_ERROR,
                format!("failed to update user labels: {e}"),
            ))
        })?;

    Ok(true)
}

async fn load_issuer_seed(ctx: &Ctx, issuer: &Issuer) -> Result<nkeys::KeyPair, ReconcileError> {
    let Some(key_pair) = issuer.key_pair() else {
        warn!("issuer KeyPair is nil, but condition checks should have caught this");
        return Err(ReconcileError::temporary(ConditionError::unknown(
            REASON_UNKNOWN_ERROR,
            "issuer KeyPair is nil",
        )));
    };
    let issuer_namespace = issuer.namespace().unwrap_or_default();
    base::load_issuer_seed(&ctx.client, &issuer_namespace, key_pair, KeyKind::Account).await
}

#[allow(clippy::too_many_arguments)]
async fn reconcile_jwt_secret(
    user: &User,
    status: &mut UserStatus,
    ctx: &Ctx,
    issuer_kp: &nkeys::KeyPair,
    account_public_key: &str,
    owner: &SecretOwner,
    reference: &ObjectReference,
) -> Result<base::JwtSecretOutcome, ReconcileError> {
    let issuer_public_key = issuer_kp.public_key();
    let mut want_claims = build_user_claims(user, status, account_public_key, &issuer_public_key)
        .map_err(|e| {
            ReconcileError::terminal(ConditionError::failed(
                REASON_UNKNOWN_ERROR,
                format!("failed to create user JWT claims: {e}"),
            ))
        })?;

    let next_jwt = want_claims.clone().encode(issuer_kp).map_err(|e| {
        ReconcileError::terminal(ConditionError::failed(
            REASON_UNKNOWN_ERROR,
            format!("failed to encode user JWT: {e}"),
        ))
    })?;
    want_claims.iss = issuer_public_key;

    base::ensure_jwt_secret::<UserPayload>(
        &ctx.client,
        &ctx.recorder,
        reference,
        owner,
        &user.spec.jwt_secret_name,
        &want_claims,
        &next_jwt,
    )
    .await
}

/// Copies the CA bundle from the operator's TLS config when one exists.
/// Absent references resolve to no bundle rather than an error.
async fn ca_bundle_if_exists(ctx: &Ctx, account: &Account) -> Result<Option<Vec<u8>>, ReconcileError> {
    let Some(operator_ref) = account.status.as_ref().and_then(|s| s.operator_ref.as_ref()) else {
        return Ok(None);
    };

    let namespace = operator_ref
        .namespace
        .clone()
        .or_else(|| account.namespace())
        .unwrap_or_default();
    let operators: Api<Operator> = Api::namespaced(ctx.client.clone(), &namespace);
    let operator = operators.get_opt(&operator_ref.name).await.map_err(|e| {
        ReconcileError::temporary(ConditionError::unknown(
            REASON_UNKNOWN_ERROR,
            format!("failed to get operator for account: {e}"),
        ))
    })?;
    let Some(operator) = operator else {
        return Ok(None);
    };

    let Some(ca_ref) = operator.spec.tls_config.as_ref().and_then(|t| t.ca_file.as_ref()) else {
        return Ok(None);
    };

    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &namespace);
    let secret = secrets.get_opt(&ca_ref.name).await.map_err(|e| {
        ReconcileError::temporary(ConditionError::unknown(
            REASON_UNKNOWN_ERROR,
            format!("failed to get caFile secret: {e}"),
        ))
    })?;
    let Some(secret) = secret else {
        debug!(secret = %ca_ref.name, "caFile secret not found, credentials will carry no CA");
        return Ok(None);
    };

    let key = ca_ref.key_or_default();
    Ok(secret.data.unwrap_or_default().get(key).map(|b| b.0.clone()))
}

#[allow(clippy::too_many_arguments)]
async fn ensure_credentials_secret(
    user: &User,
    ctx: &Ctx,
    account: &Account,
    jwt: &str,
    seed: &str,
    owner: &SecretOwner,
    reference: &ObjectReference,
) -> Result<(), ReconcileError> {
    let ca = ca_bundle_if_exists(ctx, account).await?;
    let creds = format_user_config(jwt, seed);
    let public_key = nkeys::KeyPair::from_seed(seed)
        .map(|kp| kp.public_key())
        .unwrap_or_default();

    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &owner.namespace);
    let secret_name = &user.spec.credentials_secret_name;
    let got = secrets.get_opt(secret_name).await.map_err(|e| {
        ReconcileError::temporary(ConditionError::unknown(
            REASON_UNKNOWN_ERROR,
            format!("failed to get credentials secret: {e}"),
        ))
    })?;

    match got {
        None => {
            debug!(secret = %secret_name, "credentials secret not found, creating new secret");
            let mut secret = Secret::default();
            populate_credentials_secret(
                &mut secret,
                owner,
                secret_name,
                &creds,
                &public_key,
                ca.as_deref(),
            );
            secrets
                .create(&PostParams::default(), &secret)
                .await
                .map_err(|e| {
                    ReconcileError::temporary(ConditionError::unknown(
                        REASON_UNKNOWN_ERROR,
                        format!("failed to create credentials secret: {e}"),
                    ))
                })?;
            ctx.recorder
                .normal(
                    reference,
                    "CredentialsSecretCreated",
                    format!("created secret: {}/{}", owner.namespace, secret_name),
                )
                .await;
        }
        Some(got) => {
            let mut want = got.clone();
            populate_credentials_secret(
                &mut want,
                owner,
                secret_name,
                &creds,
                &public_key,
                ca.as_deref(),
            );
            if want != got {
                secrets
                    .replace(secret_name, &PostParams::default(), &want)
                    .await
                    .map_err(|e| {
                        ReconcileError::temporary(ConditionError::unknown(
                            REASON_UNKNOWN_ERROR,
                            format!("failed to update credentials secret: {e}"),
                        ))
                    })?;
                ctx.recorder
                    .normal(
                        reference,
                        "CredentialsSecretUpdated",
                        format!("updated secret: {}/{}", owner.namespace, secret_name),
                    )
                    .await;
            } else {
                debug!(secret = %secret_name, "existing credentials secret matches desired state, no update required");
            }
        }
    }

    Ok(())
}
