//! Operator controller: root of trust. Materializes the operator seed
//! (immutable, deletion-protected), resolves the system account softly so a
//! fresh cluster can bootstrap, keeps the signing-key set current and
//! self-signs the operator JWT.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use kube::api::ListParams;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Api, Client, Resource, ResourceExt};
use tracing::{debug, error, warn};

use crate::base::{self, RESYNC};
use crate::claims::build_operator_claims;
use crate::crds::account::Account;
use crate::crds::common::{KeyPairReference, ResourceKind};
use crate::crds::operator::{Operator, OperatorStatus};
use crate::crds::signing_key::SigningKey;
use crate::error::{
    CONFLICT_REQUEUE, ConditionError, DEFAULT_BACKOFF, REASON_NOT_FOUND, REASON_NOT_READY,
    REASON_UNKNOWN_ERROR, ReconcileError, is_conflict,
};
use crate::events::EventRecorder;
use crate::helpers::{next_signing_keys, selector_admits};
use crate::jwt::OperatorPayload;
use crate::nkey::{self, KeyKind};
use crate::resources::{SecretOwner, SeedSecretOptions};

#[derive(Clone)]
pub struct Ctx {
    pub client: Client,
    pub recorder: EventRecorder,
}

pub fn controller(client: Client) -> Controller<Operator> {
    let api: Api<Operator> = Api::all(client.clone());
    Controller::new(api, watcher::Config::default())
        .shutdown_on_signal()
        .owns(Api::<Secret>::all(client.clone()), watcher::Config::default())
        .watches(
            Api::<Account>::all(client.clone()),
            watcher::Config::default(),
            |account: Account| {
                // an Account advancing re-evaluates its owning Operator
                let fallback = account.namespace();
                account
                    .status
                    .as_ref()
                    .and_then(|s| s.operator_ref.as_ref())
                    .and_then(|r| {
                        let namespace = r.namespace.clone().or(fallback)?;
                        Some(ObjectRef::new(&r.name).within(&namespace))
                    })
            },
        )
        .watches(
            Api::<SigningKey>::all(client),
            watcher::Config::default(),
            |sk: SigningKey| {
                let fallback = sk.namespace();
                sk.status
                    .as_ref()
                    .and_then(|s| s.owner_ref.as_ref())
                    .filter(|r| r.kind == "Operator")
                    .and_then(|r| {
                        let namespace = r.namespace.clone().or(fallback)?;
                        Some(ObjectRef::new(&r.name).within(&namespace))
                    })
            },
        )
}

pub async fn reconcile(operator: Arc<Operator>, ctx: Arc<Ctx>) -> Result<Action, ReconcileError> {
    let namespace = operator.namespace().unwrap_or_default();
    let name = operator.name_any();
    debug!(%name, "reconciling operator");

    let mut status = operator.status.clone().unwrap_or_default();
    status.initialize_conditions();

    let outcome = reconcile_operator(&operator, &mut status, &ctx).await;

    if operator.status.as_ref() != Some(&status) {
        if let Err(err) =
            base::patch_status::<Operator, OperatorStatus>(&ctx.client, &namespace, &name, &status)
                .await
        {
            if is_conflict(&err) && outcome.is_ok() {
                return Ok(Action::requeue(CONFLICT_REQUEUE));
            }
            warn!(error = %err, %name, "failed to update operator status");
        }
    }

    outcome
}

pub fn error_policy(_operator: Arc<Operator>, err: &ReconcileError, _ctx: Arc<Ctx>) -> Action {
    match err {
        ReconcileError::Terminal(condition) => {
            debug!(reason = %condition.reason, "operator reconcile halted until input changes");
            Action::await_change()
        }
        ReconcileError::RequeueAfter(delay, _) => Action::requeue(*delay),
        _ => {
            error!(error = ?err, "operator reconcile failed");
            Action::requeue(DEFAULT_BACKOFF)
        }
    }
}

async fn reconcile_operator(
    operator: &Operator,
    status: &mut OperatorStatus,
    ctx: &Ctx,
) -> Result<Action, ReconcileError> {
    // operators hold no external-system state, deletion needs no teardown
    if operator.meta().deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    let reference = operator.object_ref(&());
    let owner = SecretOwner {
        kind: ResourceKind::Operator,
        name: operator.name_any(),
        namespace: operator.namespace().unwrap_or_default(),
        uid: operator.uid().unwrap_or_default(),
    };

    let seed = match base::reconcile_seed_secret(
        &ctx.client,
        &ctx.recorder,
        &reference,
        &owner,
        &operator.spec.seed_secret_name,
        KeyKind::Operator,
        &SeedSecretOptions {
            deletion_prevention: true,
        },
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

    if let Err(err) = ensure_system_account_resolved(operator, status, ctx).await {
        let (failure, reason, message) = err.marking();
        if failure {
            status.mark_system_account_resolve_failed(&reason, &message);
        } else {
            status.mark_system_account_resolve_unknown(&reason, &message);
        }
        return Err(err);
    }

    if let Err(err) = ensure_signing_keys_updated(operator, status, ctx).await {
        let (_, reason, message) = err.marking();
        status.mark_signing_keys_update_unknown(&reason, &message);
        return Err(err);
    }

    if let Err(err) = reconcile_jwt_secret(operator, status, ctx, &seed.seed, &owner, &reference).await
    {
        let (failure, reason, message) = err.marking();
        if failure {
            status.mark_jwt_secret_failed(&reason, &message);
        } else {
            status.mark_jwt_secret_unknown(&reason, &message);
        }
        return Err(err);
    }
    status.mark_jwt_secret_ready();

    Ok(Action::requeue(RESYNC))
}

/// Resolves the system account as a soft dependency: only the account's
/// keypair is required, not overall readiness. A fresh cluster cannot push
/// the system account's JWT before the operator JWT exists, so requiring
/// Ready here would deadlock the bootstrap.
async fn ensure_system_account_resolved(
    operator: &Operator,
    status: &mut OperatorStatus,
    ctx: &Ctx,
) -> Result<(), ReconcileError> {
    let namespace = operator.namespace().unwrap_or_default();
    let name = &operator.spec.system_account_ref.name;

    let api: Api<Account> = Api::namespaced(ctx.client.clone(), &namespace);
    let account = api.get_opt(name).await.map_err(|e| {
        ReconcileError::temporary(ConditionError::unknown(
            REASON_UNKNOWN_ERROR,
            format!("failed to get system account {name:?}: {e}"),
        ))
    })?;

    let Some(account) = account else {
        return Err(ReconcileError::temporary(ConditionError::failed(
            REASON_NOT_FOUND,
            format!("failed to get system account {name:?}: not found"),
        )));
    };

    let key_pair = account
        .status
        .as_ref()
        .filter(|s| s.seed_secret_ready())
        .and_then(|s| s.key_pair.as_ref());
    let Some(key_pair) = key_pair else {
        return Err(ReconcileError::temporary(ConditionError::failed(
            REASON_NOT_READY,
            "system account KeyPair not ready",
        )));
    };

    status.mark_system_account_resolved(KeyPairReference {
        namespace: account.namespace(),
        name: account.name_any(),
        public_key: key_pair.public_key.clone(),
    });

    Ok(())
}

async fn ensure_signing_keys_updated(
    operator: &Operator,
    status: &mut OperatorStatus,
    ctx: &Ctx,
) -> Result<(), ReconcileError> {
    let namespace = operator.namespace().unwrap_or_default();
    let api: Api<SigningKey> = Api::namespaced(ctx.client.clone(), &namespace);
    let list = api.list(&ListParams::default()).await.map_err(|e| {
        ReconcileError::temporary(ConditionError::unknown(
            REASON_UNKNOWN_ERROR,
            format!("failed to list SigningKeys: {e}"),
        ))
    })?;

    let mut eligible = Vec::new();
    for sk in list.items {
        match selector_admits(operator.spec.signing_keys_selector.as_ref(), sk.labels()) {
            Ok(true) => eligible.push(sk),
            Ok(false) => {}
            Err(e) => {
                ctx.recorder
                    .warning(
                        &operator.object_ref(&()),
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

    let uid = operator.uid().unwrap_or_default();
    let next = next_signing_keys(&uid, &status.signing_keys, &eligible);

    if next != status.signing_keys {
        ctx.recorder
            .normal(
                &operator.object_ref(&()),
                "SigningKeysChanged",
                format!("signing keys set now has {} entries", next.len()),
            )
            .await;
    }

    status.mark_signing_keys_updated(next);

    Ok(())
}

async fn reconcile_jwt_secret(
    operator: &Operator,
    status: &mut OperatorStatus,
    ctx: &Ctx,
    seed: &str,
    owner: &SecretOwner,
    reference: &k8s_openapi::api::core::v1::ObjectReference,
) -> Result<(), ReconcileError> {
    let signing_key = nkey::from_seed_expecting(seed, KeyKind::Operator).map_err(|e| {
        ReconcileError::terminal(ConditionError::failed(
            REASON_UNKNOWN_ERROR,
            format!("failed to get signing key from seed: {e}"),
        ))
    })?;

    let mut want_claims = build_operator_claims(operator, status).map_err(|e| {
        ReconcileError::terminal(ConditionError::failed(
            REASON_UNKNOWN_ERROR,
            format!("failed to create operator JWT claims: {e}"),
        ))
    })?;

    let next_jwt = want_claims.clone().encode(&signing_key).map_err(|e| {
        ReconcileError::terminal(ConditionError::failed(
            REASON_UNKNOWN_ERROR,
            format!("failed to encode operator JWT: {e}"),
        ))
    })?;
    // stamp the issuer so desired-vs-stored comparison sees the signer
    want_claims.iss = signing_key.public_key();

    base::ensure_jwt_secret::<OperatorPayload>(
        &ctx.client,
        &ctx.recorder,
        reference,
        owner,
        &operator.spec.jwt_secret_name,
        &want_claims,
        &next_jwt,
    )
    .await?;

    Ok(())
}
