//! Builders mapping CRD specs onto NATS JWT claim sets. The desired claims
//! built here are compared against whatever the JWT secret currently holds;
//! only structural drift triggers a re-sign.

use kube::ResourceExt;

use crate::crds::account::{
    Account, AccountExport, AccountImport, AccountResponseType, AccountStatus, ImportExportType,
};
use crate::crds::operator::{Operator, OperatorStatus};
use crate::crds::user::{User, UserStatus};
use crate::helpers::parse_duration_ns;
use crate::jwt::{
    AccountPayload, Claims, Export, ExportType, Import, JetStreamLimits, OperatorPayload,
    Permission, ResponsePermission, ResponseType, ServiceLatency, TimeRange, UserPayload,
};

/// Self-signed operator claims. Requires the keypair and the resolved system
/// account, both established earlier in the reconcile.
pub fn build_operator_claims(
    operator: &Operator,
    status: &OperatorStatus,
) -> Result<Claims<OperatorPayload>, String> {
    let key_pair = status
        .key_pair
        .as_ref()
        .ok_or("cannot build operator claims without a key pair")?;
    let system_account = status
        .resolved_system_account
        .as_ref()
        .ok_or("cannot build operator claims without a resolved system account")?;

    let mut claims = Claims::<OperatorPayload>::new(key_pair.public_key.clone());
    claims.name = operator.name_any();
    claims.nats.signing_keys = status
        .signing_keys
        .iter()
        .map(|sk| sk.key_pair.public_key.clone())
        .collect();
    claims.nats.account_server_url = operator.spec.account_server_url.clone().unwrap_or_default();
    claims.nats.operator_service_urls = operator.spec.operator_service_urls.clone();
    claims.nats.system_account = system_account.public_key.clone();

    Ok(claims)
}

pub fn build_account_claims(
    account: &Account,
    status: &AccountStatus,
) -> Result<Claims<AccountPayload>, String> {
    let key_pair = status
        .key_pair
        .as_ref()
        .ok_or("cannot build account claims without a key pair")?;

    let mut claims = Claims::<AccountPayload>::new(key_pair.public_key.clone());
    claims.name = account.name_any();
    claims.nats.imports = account.spec.imports.iter().map(convert_import).collect();
    claims.nats.exports = account.spec.exports.iter().map(convert_export).collect();
    claims.nats.signing_keys = status
        .signing_keys
        .iter()
        .map(|sk| sk.key_pair.public_key.clone())
        .collect();

    if let Some(limits) = &account.spec.limits {
        let defaults = &claims.nats.limits;
        let mut merged = claims.nats.limits.clone();
        merged.nats.subs = limits.subs.unwrap_or(defaults.nats.subs);
        merged.nats.data = limits.data.unwrap_or(defaults.nats.data);
        merged.nats.payload = limits.payload.unwrap_or(defaults.nats.payload);
        merged.account.imports = limits.imports.unwrap_or(defaults.account.imports);
        merged.account.exports = limits.exports.unwrap_or(defaults.account.exports);
        merged.account.wildcards = limits.wildcard_exports.unwrap_or(defaults.account.wildcards);
        merged.account.disallow_bearer = limits.disallow_bearer;
        merged.account.conn = limits.conn.unwrap_or(defaults.account.conn);
        merged.account.leaf = limits.leaf_node_conn.unwrap_or(defaults.account.leaf);
        if let Some(js) = &limits.jet_stream {
            merged.jetstream = JetStreamLimits {
                mem_storage: js.memory_storage,
                disk_storage: js.disk_storage,
                streams: js.streams,
                consumer: js.consumer,
                mem_max_stream_bytes: js.memory_max_stream_bytes,
                disk_max_stream_bytes: js.disk_max_stream_bytes,
                max_bytes_required: js.max_bytes_required,
                max_ack_pending: js.max_ack_pending,
            };
        }
        claims.nats.limits = merged;
    }

    Ok(claims)
}

/// User claims signed by `issuer_public_key`. When the issuer is a signing
/// key rather than the account's root key, `issuer_account` carries the
/// account public key so the server can verify the delegation.
pub fn build_user_claims(
    user: &User,
    status: &UserStatus,
    account_public_key: &str,
    issuer_public_key: &str,
) -> Result<Claims<UserPayload>, String> {
    let key_pair = status
        .key_pair
        .as_ref()
        .ok_or("cannot build user claims without a key pair")?;

    let mut claims = Claims::<UserPayload>::new(key_pair.public_key.clone());
    claims.name = user.name_any();

    let limits = &user.spec.limits;
    if let Some(subs) = limits.subs {
        claims.nats.limits.subs = subs;
    }
    if let Some(data) = limits.data {
        claims.nats.limits.data = data;
    }
    if let Some(payload) = limits.payload {
        claims.nats.limits.payload = payload;
    }
    claims.nats.src = limits.src.clone();
    claims.nats.times = limits
        .times
        .iter()
        .map(|t| TimeRange {
            start: t.start.clone(),
            end: t.end.clone(),
        })
        .collect();
    claims.nats.locale = limits.locale.clone().unwrap_or_default();
    claims.nats.bearer_token = user.spec.bearer_token.unwrap_or(false);

    if let Some(permissions) = &user.spec.permissions {
        claims.nats.publish = Permission {
            allow: permissions.r#pub.allow.clone(),
            deny: permissions.r#pub.deny.clone(),
        };
        claims.nats.subscribe = Permission {
            allow: permissions.sub.allow.clone(),
            deny: permissions.sub.deny.clone(),
        };
        if let Some(resp) = &permissions.resp {
            let ttl = match resp.ttl.as_deref() {
                Some(raw) => parse_duration_ns(raw)
                    .map_err(|e| format!("invalid permissions.resp.ttl: {e}"))?,
                None => 0,
            };
            claims.nats.resp = Some(ResponsePermission { max: resp.max, ttl });
        }
    }

    if account_public_key != issuer_public_key {
        claims.nats.issuer_account = account_public_key.to_string();
    }

    Ok(claims)
}

fn convert_import(import: &AccountImport) -> Import {
    Import {
        name: import.name.clone(),
        subject: import.subject.clone(),
        account: import.account.clone(),
        token: import.token.clone(),
        to: import.to.clone(),
        import_type: convert_export_type(import.r#type),
    }
}

fn convert_export(export: &AccountExport) -> Export {
    Export {
        name: export.name.clone(),
        subject: export.subject.clone(),
        export_type: convert_export_type(export.r#type),
        token_req: export.token_req,
        response_type: export.response_type.map(convert_response_type),
        service_latency: export.service_latency.as_ref().map(|l| ServiceLatency {
            sampling: l.sampling,
            results: l.results.clone(),
        }),
        account_token_position: export.account_token_position,
    }
}

fn convert_export_type(t: ImportExportType) -> ExportType {
    match t {
        ImportExportType::Stream => ExportType::Stream,
        ImportExportType::Service => ExportType::Service,
    }
}

fn convert_response_type(t: AccountResponseType) -> ResponseType {
    match t {
        AccountResponseType::Singleton => ResponseType::Singleton,
        AccountResponseType::Stream => ResponseType::Stream,
        AccountResponseType::Chunked => ResponseType::Chunked,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::account::{AccountLimitsSpec, AccountSpec, JetStreamLimitsSpec};
    use crate::crds::common::{
        API_VERSION, IssuerReference, KeyPair, TypedObjectReference,
    };
    use crate::crds::user::{RespPermission, UserPermission, UserPermissions, UserSpec};
    use crate::jwt::{self, NO_LIMIT};
    use crate::nkey::KeyKind;

    fn issuer_ref(kind: &str, name: &str) -> IssuerReference {
        IssuerReference {
            r#ref: TypedObjectReference {
                api_version: API_VERSION.into(),
                kind: kind.into(),
                name: name.into(),
                namespace: None,
                uid: None,
            },
        }
    }

    fn account_fixture() -> (Account, AccountStatus) {
        let account = Account::new(
            "tenant-a",
            AccountSpec {
                issuer: issuer_ref("Operator", "main"),
                users_namespace_selector: None,
                users_selector: None,
                jwt_secret_name: "tenant-a-jwt".into(),
                seed_secret_name: "tenant-a-seed".into(),
                signing_keys_selector: None,
                imports: Vec::new(),
                exports: Vec::new(),
                limits: Some(AccountLimitsSpec {
                    conn: Some(64),
                    jet_stream: Some(JetStreamLimitsSpec {
                        memory_storage: 1 << 30,
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
            },
        );
        let mut status = AccountStatus::default();
        status.key_pair = Some(KeyPair {
            public_key: KeyKind::Account.create().public_key(),
            seed_secret_name: "tenant-a-seed".into(),
        });
        (account, status)
    }

    #[test]
    fn account_limits_merge_over_no_limit_defaults() {
        let (account, status) = account_fixture();
        let claims = build_account_claims(&account, &status).unwrap();

        assert_eq!(claims.nats.limits.account.conn, 64);
        assert_eq!(claims.nats.limits.nats.subs, NO_LIMIT);
        assert_eq!(claims.nats.limits.account.imports, NO_LIMIT);
        assert!(claims.nats.limits.account.wildcards);
        assert_eq!(claims.nats.limits.jetstream.mem_storage, 1 << 30);
    }

    #[test]
    fn built_account_claims_round_trip_through_encode() {
        let (account, status) = account_fixture();
        let operator_kp = KeyKind::Operator.create();

        let want = build_account_claims(&account, &status).unwrap();
        let mut signed = want.clone();
        let token = signed.encode(&operator_kp).unwrap();

        let decoded = jwt::decode::<AccountPayload>(&token).unwrap();
        let mut want_with_iss = want.clone();
        want_with_iss.iss = operator_kp.public_key();
        assert!(decoded.equal_ignoring_stamps(&want_with_iss));
        assert_eq!(decoded.sub, status.key_pair.unwrap().public_key);
    }

    #[test]
    fn issuer_account_set_only_for_delegated_signing() {
        let user = User::new(
            "svc",
            UserSpec {
                issuer: issuer_ref("Account", "tenant-a"),
                jwt_secret_name: "svc-jwt".into(),
                seed_secret_name: "svc-seed".into(),
                credentials_secret_name: "svc-creds".into(),
                permissions: None,
                limits: Default::default(),
                bearer_token: None,
            },
        );
        let mut status = UserStatus::default();
        status.key_pair = Some(KeyPair {
            public_key: KeyKind::User.create().public_key(),
            seed_secret_name: "svc-seed".into(),
        });

        let account_pk = KeyKind::Account.create().public_key();
        let signing_pk = KeyKind::Account.create().public_key();

        let direct = build_user_claims(&user, &status, &account_pk, &account_pk).unwrap();
        assert!(direct.nats.issuer_account.is_empty());

        let delegated = build_user_claims(&user, &status, &account_pk, &signing_pk).unwrap();
        assert_eq!(delegated.nats.issuer_account, account_pk);
    }

    #[test]
    fn user_permissions_and_resp_ttl_convert() {
        let user = User::new(
            "svc",
            UserSpec {
                issuer: issuer_ref("Account", "tenant-a"),
                jwt_secret_name: "svc-jwt".into(),
                seed_secret_name: "svc-seed".into(),
                credentials_secret_name: "svc-creds".into(),
                permissions: Some(UserPermissions {
                    r#pub: UserPermission {
                        allow: vec!["orders.>".into()],
                        deny: Vec::new(),
                    },
                    sub: UserPermission {
                        allow: vec!["_INBOX.>".into()],
                        deny: Vec::new(),
                    },
                    resp: Some(RespPermission {
                        max: 1,
                        ttl: Some("5s".into()),
                    }),
                }),
                limits: Default::default(),
                bearer_token: Some(true),
            },
        );
        let mut status = UserStatus::default();
        status.key_pair = Some(KeyPair {
            public_key: KeyKind::User.create().public_key(),
            seed_secret_name: "svc-seed".into(),
        });

        let pk = KeyKind::Account.create().public_key();
        let claims = build_user_claims(&user, &status, &pk, &pk).unwrap();
        assert_eq!(claims.nats.publish.allow, vec!["orders.>".to_string()]);
        assert_eq!(claims.nats.resp.as_ref().unwrap().ttl, 5_000_000_000);
        assert!(claims.nats.bearer_token);
    }

    #[test]
    fn missing_key_pair_is_an_error() {
        let (account, _) = account_fixture();
        let err = build_account_claims(&account, &AccountStatus::default()).unwrap_err();
        assert!(err.contains("key pair"));
    }
}
