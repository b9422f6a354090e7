//! End-to-end claim chain: operator signs the account, the account signs
//! the user, and the resulting artifacts decode and verify against each
//! other the way a NATS deployment would consume them.

use nats_accounts_operator::jwt::{self, AccountPayload, Claims, OperatorPayload, UserPayload};
use nats_accounts_operator::nkey::KeyKind;
use nats_accounts_operator::nsc::format_user_config;

#[test]
fn operator_account_user_chain_verifies() {
    let operator_kp = KeyKind::Operator.create();
    let account_kp = KeyKind::Account.create();
    let user_kp = KeyKind::User.create();
    let system_account_kp = KeyKind::Account.create();

    // operator JWT is self-signed and names the system account
    let mut operator_claims = Claims::<OperatorPayload>::new(operator_kp.public_key());
    operator_claims.name = "main".to_string();
    operator_claims.nats.system_account = system_account_kp.public_key();
    operator_claims.nats.account_server_url = "nats://nats.example:4222".to_string();
    let operator_jwt = operator_claims.encode(&operator_kp).expect("operator jwt");

    let decoded_operator = jwt::decode::<OperatorPayload>(&operator_jwt).expect("decode operator");
    assert_eq!(decoded_operator.iss, operator_kp.public_key());
    assert_eq!(decoded_operator.sub, operator_kp.public_key());
    assert_eq!(decoded_operator.nats.system_account, system_account_kp.public_key());

    // account JWT is signed by the operator
    let mut account_claims = Claims::<AccountPayload>::new(account_kp.public_key());
    account_claims.name = "tenant-a".to_string();
    let account_jwt = account_claims.encode(&operator_kp).expect("account jwt");

    let decoded_account = jwt::decode::<AccountPayload>(&account_jwt).expect("decode account");
    assert_eq!(decoded_account.iss, operator_kp.public_key());
    assert_eq!(decoded_account.sub, account_kp.public_key());

    // user JWT is signed by the account
    let mut user_claims = Claims::<UserPayload>::new(user_kp.public_key());
    user_claims.name = "svc".to_string();
    let user_jwt = user_claims.encode(&account_kp).expect("user jwt");

    let decoded_user = jwt::decode::<UserPayload>(&user_jwt).expect("decode user");
    assert_eq!(decoded_user.iss, account_kp.public_key());
    assert_eq!(decoded_user.sub, user_kp.public_key());
}

#[test]
fn resigning_unchanged_claims_is_a_no_op_under_claims_equality() {
    let operator_kp = KeyKind::Operator.create();
    let account_kp = KeyKind::Account.create();

    let mut claims = Claims::<AccountPayload>::new(account_kp.public_key());
    claims.name = "tenant-a".to_string();
    claims.nats.signing_keys = vec![KeyKind::Account.create().public_key()];

    let first = claims.clone().encode(&operator_kp).expect("first");
    let second = claims.clone().encode(&operator_kp).expect("second");

    // tokens differ (jti/iat) but decode to equal claims
    assert_ne!(first, second);
    let a = jwt::decode::<AccountPayload>(&first).unwrap();
    let b = jwt::decode::<AccountPayload>(&second).unwrap();
    assert!(a.equal_ignoring_stamps(&b));
}

#[test]
fn credentials_bundle_round_trips_jwt_and_seed() {
    let account_kp = KeyKind::Account.create();
    let user_kp = KeyKind::User.create();
    let seed = user_kp.seed().expect("seed");

    let mut claims = Claims::<UserPayload>::new(user_kp.public_key());
    claims.name = "svc".to_string();
    let user_jwt = claims.encode(&account_kp).expect("user jwt");

    let creds = format_user_config(&user_jwt, &seed);

    // extract the JWT block the way nats client libraries do
    let jwt_block = creds
        .split("-----BEGIN NATS USER JWT-----\n")
        .nth(1)
        .and_then(|rest| rest.split("\n------END NATS USER JWT------").next())
        .expect("jwt block");
    assert_eq!(jwt_block, user_jwt);

    let seed_block = creds
        .split("-----BEGIN USER NKEY SEED-----\n")
        .nth(1)
        .and_then(|rest| rest.split("\n------END USER NKEY SEED------").next())
        .expect("seed block");
    assert_eq!(seed_block, seed);

    // the embedded artifacts still verify
    let decoded = jwt::decode::<UserPayload>(jwt_block).expect("decode embedded jwt");
    assert_eq!(decoded.sub, user_kp.public_key());
    let restored = nkeys::KeyPair::from_seed(seed_block).expect("restore seed");
    assert_eq!(restored.public_key(), user_kp.public_key());
}
