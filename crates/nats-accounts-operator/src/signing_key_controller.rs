//! SigningKey controller: resolves the owning Operator/Account, maintains
//! the fan-out labels other controllers watch by, and materializes the seed
//! secret with the role prefix declared in the spec.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Api, Client, Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, error, warn};

use crate::base::{self, RESYNC};
use crate::crds::account::Account;
use crate::crds::common::{
    API_VERSION, LABEL_ACCOUNT_NAME, LABEL_OPERATOR_NAME, ResourceKind, TypedObjectReference,
};
use crate::crds::operator::Operator;
use crate::crds::signing_key::{SigningKey, SigningKeyStatus};
use crate::error::{
    CONFLICT_REQUEUE, ConditionError, DEFAULT_BACKOFF, REASON_INVALID_SIGNING_KEY_OWNER,
    REASON_NOT_ALLOWED, REASON_NOT_FOUND, REASON_UNKNOWN_ERROR, ReconcileError, is_conflict,
};
use crate::events::EventRecorder;
use crate::helpers::selector_admits;
use crate::resources::{SecretOwner, SeedSecretOptions};

#[derive(Clone)]
pub struct Ctx {
    pub client: Client,
    pub recorder: EventRecorder,
}

pub fn controller(client: Client) -> Controller<SigningKey> {
    let api: Api<SigningKey> = Api::all(client.clone());
    let controller = Controller::new(api, watcher::Config::default()).shutdown_on_signal();
    let store = controller.store();

    let operator_store = store.clone();
    let account_store = store;

    controller
        .owns(Api::<Secret>::all(client.clone()), watcher::Config::default())
        .watches(
            Api::<Operator>::all(client.clone()),
            watcher::Config::default(),
            move |operator: Operator| {
                // enqueue every SigningKey labelled as managed by this Operator
                let name = operator.name_any();
                let namespace = operator.namespace();
                operator_store
                    .state()
                    .into_iter()
                    .filter(|sk| {
                        sk.namespace() == namespace
                            && sk.labels().get(LABEL_OPERATOR_NAME) == Some(&name)
                    })
                    .map(|sk| ObjectRef::from_obj(&*sk))
                    .collect::<Vec<_>>()
            },
        )
        .watches(
            Api::<Account>::all(client),
            watcher::Config::default(),
            move |account: Account| {
                let name = account.name_any();
                let namespace = account.namespace();
                account_store
                    .state()
                    .into_iter()
                    .filter(|sk| {
                        sk.namespace() == namespace
                            && sk.labels().get(LABEL_ACCOUNT_NAME) == Some(&name)
                    })
                    .map(|sk| ObjectRef::from_obj(&*sk))
                    .collect::<Vec<_>>()
            },
        )
}

pub async fn reconcile(sk: Arc<SigningKey>, ctx: Arc<Ctx>) -> Result<Action, ReconcileError> {
    let namespace = sk.namespace().unwrap_or_default();
    let name = sk.name_any();
    debug!(%name, "reconciling signing key");

    let mut status = sk.status.clone().unwrap_or_default();
    status.initialize_conditions();

    let outcome = reconcile_signing_key(&sk, &mut status, &ctx).await;

    if sk.status.as_ref() != Some(&status) {
        if let Err(err) =
            base::patch_status::<SigningKey, SigningKeyStatus>(&ctx.client, &namespace, &name, &status)
                .await
        {
            if is_conflict(&err) && outcome.is_ok() {
                return Ok(Action::requeue(CONFLICT_REQUEUE));
            }
            warn!(error = %err, %name, "failed to update signing key status");
        }
    }

    outcome
}

pub fn error_policy(_sk: Arc<SigningKey>, err: &ReconcileError, _ctx: Arc<Ctx>) -> Action {
    match err {
        ReconcileError::Terminal(condition) => {
            debug!(reason = %condition.reason, "signing key reconcile halted until input changes");
            Action::await_change()
        }
        ReconcileError::RequeueAfter(delay, _) => Action::requeue(*delay),
        _ => {
            error!(error = ?err, "signing key reconcile failed");
            Action::requeue(DEFAULT_BACKOFF)
        }
    }
}

enum Owner {
    Operator(Box<Operator>),
    Account(Box<Account>),
}

async fn reconcile_signing_key(
    sk: &SigningKey,
    status: &mut SigningKeyStatus,
    ctx: &Ctx,
) -> Result<Action, ReconcileError> {
    // no external state, deletion needs no teardown
    if sk.meta().deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    let owner = match ensure_owner_resolved(sk, status, ctx).await {
        Ok(owner) => owner,
        Err(err) => {
            let (failure, reason, message) = err.marking();
            if failure {
                status.mark_owner_resolve_failed(&reason, &message);
            } else {
                status.mark_owner_resolve_unknown(&reason, &message);
            }
            return Err(err);
        }
    };

    if reconcile_labels(sk, &owner, ctx).await? {
        // the label write re-enqueues us through our own watch
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let reference = sk.object_ref(&());
    let owner_meta = SecretOwner {
        kind: ResourceKind::SigningKey,
        name: sk.name_any(),
        namespace: sk.namespace().unwrap_or_default(),
        uid: sk.uid().unwrap_or_default(),
    };
    match base::reconcile_seed_secret(
        &ctx.client,
        &ctx.recorder,
        &reference,
        &owner_meta,
        &sk.spec.seed_secret_name,
        sk.spec.r#type.key_kind(),
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

    Ok(Action::requeue(RESYNC))
}

async fn ensure_owner_resolved(
    sk: &SigningKey,
    status: &mut SigningKeyStatus,
    ctx: &Ctx,
) -> Result<Owner, ReconcileError> {
    let owner_ref = &sk.spec.owner_ref;
    // owners always share the SigningKey's namespace
    let namespace = sk.namespace().unwrap_or_default();

    let owner = match owner_ref.kind.as_str() {
        "Operator" => {
            let api: Api<Operator> = Api::namespaced(ctx.client.clone(), &namespace);
            match api.get_opt(&owner_ref.name).await {
                Ok(Some(operator)) => Owner::Operator(Box::new(operator)),
                Ok(None) => {
                    return Err(ReconcileError::temporary(ConditionError::failed(
                        REASON_NOT_FOUND,
                        format!("Operator, {namespace}/{}: not found", owner_ref.name),
                    )));
                }
                Err(e) => {
                    return Err(ReconcileError::temporary(ConditionError::unknown(
                        REASON_UNKNOWN_ERROR,
                        format!("failed to resolve owner reference: {e}"),
                    )));
                }
            }
        }
        "Account" => {
            let api: Api<Account> = Api::namespaced(ctx.client.clone(), &namespace);
            match api.get_opt(&owner_ref.name).await {
                Ok(Some(account)) => Owner::Account(Box::new(account)),
                Ok(None) => {
                    return Err(ReconcileError::temporary(ConditionError::failed(
                        REASON_NOT_FOUND,
                        format!("Account, {namespace}/{}: not found", owner_ref.name),
                    )));
                }
                Err(e) => {
                    return Err(ReconcileError::temporary(ConditionError::unknown(
                        REASON_UNKNOWN_ERROR,
                        format!("failed to resolve owner reference: {e}"),
                    )));
                }
            }
        }
        other => {
            return Err(ReconcileError::terminal(ConditionError::failed(
                REASON_INVALID_SIGNING_KEY_OWNER,
                format!("owner must be one of Account or Operator, got {other:?}"),
            )));
        }
    };

    let (owner_kind, owner_name, owner_namespace, owner_uid, selector) = match &owner {
        Owner::Operator(o) => (
            "Operator",
            o.name_any(),
            o.namespace(),
            o.uid(),
            o.spec.signing_keys_selector.clone(),
        ),
        Owner::Account(a) => (
            "Account",
            a.name_any(),
            a.namespace(),
            a.uid(),
            a.spec.signing_keys_selector.clone(),
        ),
    };

    if owner_kind != sk.spec.r#type.as_str() {
        return Err(ReconcileError::terminal(ConditionError::failed(
            REASON_INVALID_SIGNING_KEY_OWNER,
            format!(
                "signing key type {:?} does not match owner kind {owner_kind:?}",
                sk.spec.r#type.as_str()
            ),
        )));
    }

    match selector_admits(selector.as_ref(), sk.labels()) {
        Ok(true) => {}
        Ok(false) => {
            return Err(ReconcileError::terminal(ConditionError::failed(
                REASON_NOT_ALLOWED,
                "SigningKey does not match selector requirements",
            )));
        }
        Err(e) => {
            ctx.recorder
                .warning(
                    &sk.object_ref(&()),
                    "InvalidSigningKeysSelector",
                    format!("failed to parse label selector: {e}"),
                )
                .await;
            return Err(ReconcileError::terminal(ConditionError::failed(
                REASON_NOT_ALLOWED,
                format!("failed to parse signing key label selector: {e}"),
            )));
        }
    }

    status.mark_owner_resolved(TypedObjectReference {
        api_version: API_VERSION.to_string(),
        kind: owner_kind.to_string(),
        name: owner_name,
        namespace: owner_namespace,
        uid: owner_uid,
    });

    Ok(owner)
}

/// Maintains the `accounts.nats.io/operator` / `accounts.nats.io/account`
/// label on the SigningKey itself; these labels are the fan-out indices used
/// by the Operator and Account watchers. Returns true when a write happened.
async fn reconcile_labels(sk: &SigningKey, owner: &Owner, ctx: &Ctx) -> Result<bool, ReconcileError> {
    let (label, owner_name) = match owner {
        Owner::Operator(o) => (LABEL_OPERATOR_NAME, o.name_any()),
        Owner::Account(a) => (LABEL_ACCOUNT_NAME, a.name_any()),
    };

    if sk.labels().get(label) == Some(&owner_name) {
        return Ok(false);
    }

    let namespace = sk.namespace().unwrap_or_default();
    let api: Api<SigningKey> = Api::namespaced(ctx.client.clone(), &namespace);
    let patch = json!({ "metadata": { "labels": { label: owner_name } } });
    api.patch(&sk.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(|e| {
            ReconcileError::temporary(ConditionError::unknown(
                REASON_UNKNOWN_ERROR,
                format!("failed to update signing key labels: {e}"),
            ))
        })?;

    Ok(true)
}
