//! NATS JWT claim sets: typed payloads for Operator/Account/User roles, the
//! `ed25519-nkey` encoding, and the structural equality that makes JWT
//! rewrites idempotent.
//!
//! A NATS JWT is three base64url segments signed by an nkey. The `jti` and
//! `iat` fields change on every signing, so desired-vs-actual comparison goes
//! through [`Claims::equal_ignoring_stamps`] rather than comparing tokens.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use data_encoding::BASE32_NOPAD;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use time::OffsetDateTime;

pub const ALGORITHM: &str = "ed25519-nkey";
pub const TOKEN_TYPE: &str = "JWT";
pub const CLAIMS_VERSION: i64 = 2;

/// `-1` means unrestricted in NATS limit fields.
pub const NO_LIMIT: i64 = -1;

#[derive(Debug, Error)]
pub enum JwtError {
    #[error("malformed JWT: expected three dot-separated segments")]
    Malformed,
    #[error("failed to decode JWT segment: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("unsupported algorithm {0:?}")]
    UnsupportedAlgorithm(String),
    #[error("nkey failure: {0}")]
    Key(String),
    #[error("signature verification failed: {0}")]
    Signature(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    typ: String,
    alg: String,
}

/// Common claim fields wrapping a role-specific `nats` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims<T> {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub jti: String,
    #[serde(default, skip_serializing_if = "i64_is_zero")]
    pub iat: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub iss: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    pub nats: T,
}

impl<T: Default> Claims<T> {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            jti: String::new(),
            iat: 0,
            iss: String::new(),
            name: String::new(),
            sub: subject.into(),
            exp: None,
            nats: T::default(),
        }
    }
}

impl<T: Serialize + Clone + PartialEq> Claims<T> {
    /// Signs the claims with `kp`, stamping `iss`, `iat` and `jti` in place,
    /// and returns the encoded token.
    pub fn encode(&mut self, kp: &nkeys::KeyPair) -> Result<String, JwtError> {
        self.iss = kp.public_key();
        self.iat = OffsetDateTime::now_utc().unix_timestamp();
        self.jti = String::new();
        self.jti = BASE32_NOPAD.encode(Sha256::digest(serde_json::to_vec(self)?).as_slice());

        let header = serde_json::to_vec(&Header {
            typ: TOKEN_TYPE.to_string(),
            alg: ALGORITHM.to_string(),
        })?;
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header),
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(self)?),
        );
        let sig = kp
            .sign(signing_input.as_bytes())
            .map_err(|e| JwtError::Key(e.to_string()))?;

        Ok(format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(sig)))
    }

    /// Structural equality with the volatile `jti` and `iat` fields zeroed.
    /// This is the single mechanism making the controllers idempotent: a
    /// re-sign produces a new token but equal claims, so no update is
    /// written.
    pub fn equal_ignoring_stamps(&self, other: &Self) -> bool {
        let mut a = self.clone();
        let mut b = other.clone();
        a.jti = String::new();
        b.jti = String::new();
        a.iat = 0;
        b.iat = 0;
        a == b
    }
}

/// Decodes a token, checking the header algorithm and verifying the
/// signature against the embedded issuer key.
pub fn decode<T: DeserializeOwned>(token: &str) -> Result<Claims<T>, JwtError> {
    let mut segments = token.split('.');
    let (Some(header_b64), Some(payload_b64), Some(sig_b64), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(JwtError::Malformed);
    };

    let header: Header = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(header_b64)?)?;
    if !header.typ.eq_ignore_ascii_case(TOKEN_TYPE) {
        return Err(JwtError::Malformed);
    }
    if header.alg != ALGORITHM {
        return Err(JwtError::UnsupportedAlgorithm(header.alg));
    }

    let claims: Claims<T> = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload_b64)?)?;

    let issuer =
        nkeys::KeyPair::from_public_key(&claims.iss).map_err(|e| JwtError::Key(e.to_string()))?;
    let sig = URL_SAFE_NO_PAD.decode(sig_b64)?;
    issuer
        .verify(format!("{header_b64}.{payload_b64}").as_bytes(), &sig)
        .map_err(|e| JwtError::Signature(e.to_string()))?;

    Ok(claims)
}

fn i64_is_zero(v: &i64) -> bool {
    *v == 0
}

fn is_false(v: &bool) -> bool {
    !*v
}

// ---------------------------------------------------------------------------
// Operator

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorPayload {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signing_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub account_server_url: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operator_service_urls: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub system_account: String,
    #[serde(rename = "type")]
    pub claims_type: String,
    pub version: i64,
}

impl Default for OperatorPayload {
    fn default() -> Self {
        Self {
            signing_keys: Vec::new(),
            account_server_url: String::new(),
            operator_service_urls: Vec::new(),
            system_account: String::new(),
            claims_type: "operator".to_string(),
            version: CLAIMS_VERSION,
        }
    }
}

// ---------------------------------------------------------------------------
// Account

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportType {
    Stream,
    Service,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseType {
    Singleton,
    Stream,
    Chunked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Import {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subject: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub account: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub to: String,
    #[serde(rename = "type")]
    pub import_type: ExportType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceLatency {
    pub sampling: i64,
    pub results: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Export {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subject: String,
    #[serde(rename = "type")]
    pub export_type: ExportType,
    #[serde(default, skip_serializing_if = "is_false")]
    pub token_req: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_type: Option<ResponseType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_latency: Option<ServiceLatency>,
    #[serde(default, skip_serializing_if = "i64_is_zero")]
    pub account_token_position: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsLimits {
    pub subs: i64,
    pub data: i64,
    pub payload: i64,
}

impl Default for NatsLimits {
    fn default() -> Self {
        Self {
            subs: NO_LIMIT,
            data: NO_LIMIT,
            payload: NO_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountLimits {
    pub imports: i64,
    pub exports: i64,
    pub wildcards: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub disallow_bearer: bool,
    pub conn: i64,
    pub leaf: i64,
}

impl Default for AccountLimits {
    fn default() -> Self {
        Self {
            imports: NO_LIMIT,
            exports: NO_LIMIT,
            wildcards: true,
            disallow_bearer: false,
            conn: NO_LIMIT,
            leaf: NO_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JetStreamLimits {
    #[serde(default, skip_serializing_if = "i64_is_zero")]
    pub mem_storage: i64,
    #[serde(default, skip_serializing_if = "i64_is_zero")]
    pub disk_storage: i64,
    #[serde(default, skip_serializing_if = "i64_is_zero")]
    pub streams: i64,
    #[serde(default, skip_serializing_if = "i64_is_zero")]
    pub consumer: i64,
    #[serde(default, skip_serializing_if = "i64_is_zero")]
    pub mem_max_stream_bytes: i64,
    #[serde(default, skip_serializing_if = "i64_is_zero")]
    pub disk_max_stream_bytes: i64,
    #[serde(default, skip_serializing_if = "is_false")]
    pub max_bytes_required: bool,
    #[serde(default, skip_serializing_if = "i64_is_zero")]
    pub max_ack_pending: i64,
}

/// Account limits merged over the NoLimit defaults of a fresh account claim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperatorLimits {
    #[serde(flatten)]
    pub nats: NatsLimits,
    #[serde(flatten)]
    pub account: AccountLimits,
    #[serde(flatten)]
    pub jetstream: JetStreamLimits,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountPayload {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub imports: Vec<Import>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exports: Vec<Export>,
    #[serde(default)]
    pub limits: OperatorLimits,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signing_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub revocations: BTreeMap<String, i64>,
    #[serde(rename = "type")]
    pub claims_type: String,
    pub version: i64,
}

impl Default for AccountPayload {
    fn default() -> Self {
        Self {
            imports: Vec::new(),
            exports: Vec::new(),
            limits: OperatorLimits::default(),
            signing_keys: Vec::new(),
            revocations: BTreeMap::new(),
            claims_type: "account".to_string(),
            version: CLAIMS_VERSION,
        }
    }
}

// ---------------------------------------------------------------------------
// User

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Permission {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deny: Vec<String>,
}

impl Permission {
    pub fn is_empty(&self) -> bool {
        self.allow.is_empty() && self.deny.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePermission {
    pub max: i64,
    /// Time-to-live in nanoseconds; zero means no expiry.
    #[serde(default, skip_serializing_if = "i64_is_zero")]
    pub ttl: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPayload {
    #[serde(rename = "pub", default, skip_serializing_if = "Permission::is_empty")]
    pub publish: Permission,
    #[serde(rename = "sub", default, skip_serializing_if = "Permission::is_empty")]
    pub subscribe: Permission,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resp: Option<ResponsePermission>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub src: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub times: Vec<TimeRange>,
    #[serde(rename = "times_location", default, skip_serializing_if = "String::is_empty")]
    pub locale: String,
    #[serde(flatten)]
    pub limits: NatsLimits,
    #[serde(default, skip_serializing_if = "is_false")]
    pub bearer_token: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub issuer_account: String,
    #[serde(rename = "type")]
    pub claims_type: String,
    pub version: i64,
}

impl Default for UserPayload {
    fn default() -> Self {
        Self {
            publish: Permission::default(),
            subscribe: Permission::default(),
            resp: None,
            src: Vec::new(),
            times: Vec::new(),
            locale: String::new(),
            limits: NatsLimits::default(),
            bearer_token: false,
            issuer_account: String::new(),
            claims_type: "user".to_string(),
            version: CLAIMS_VERSION,
        }
    }
}

// ---------------------------------------------------------------------------
// Generic (account-server delete payloads)

/// Free-form payload used for operator-signed control requests such as
/// `$SYS.REQ.CLAIMS.DELETE`, whose body is `{"accounts": [...]}`.
pub type GenericPayload = BTreeMap<String, serde_json::Value>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nkey::KeyKind;

    #[test]
    fn encode_decode_round_trip() {
        let operator = KeyKind::Operator.create();
        let account = KeyKind::Account.create();

        let mut claims = Claims::<AccountPayload>::new(account.public_key());
        claims.name = "tenant-a".to_string();
        claims.nats.signing_keys = vec!["AXYZ".to_string()];

        let token = claims.encode(&operator).expect("encode");
        let decoded = decode::<AccountPayload>(&token).expect("decode");

        assert_eq!(decoded.sub, account.public_key());
        assert_eq!(decoded.iss, operator.public_key());
        assert_eq!(decoded.name, "tenant-a");
        assert_eq!(decoded.nats.signing_keys, vec!["AXYZ".to_string()]);
        assert!(!decoded.jti.is_empty());
        assert!(decoded.iat > 0);
    }

    #[test]
    fn equality_ignores_jti_and_iat_only() {
        let operator = KeyKind::Operator.create();
        let account = KeyKind::Account.create();

        let mut a = Claims::<AccountPayload>::new(account.public_key());
        a.name = "tenant-a".to_string();
        let mut b = a.clone();

        let token_a = a.encode(&operator).expect("encode a");
        let token_b = b.encode(&operator).expect("encode b");

        // distinct tokens, equal claims
        assert!(
            decode::<AccountPayload>(&token_a)
                .unwrap()
                .equal_ignoring_stamps(&decode::<AccountPayload>(&token_b).unwrap())
        );

        // a substantive change is visible
        b.nats.limits.nats.subs = 10;
        let token_c = b.encode(&operator).expect("encode c");
        assert!(
            !decode::<AccountPayload>(&token_a)
                .unwrap()
                .equal_ignoring_stamps(&decode::<AccountPayload>(&token_c).unwrap())
        );
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let operator = KeyKind::Operator.create();
        let mut claims = Claims::<OperatorPayload>::new(operator.public_key());
        let token = claims.encode(&operator).expect("encode");

        let mut parts: Vec<&str> = token.split('.').collect();
        let mut forged = Claims::<OperatorPayload>::new(operator.public_key());
        forged.nats.system_account = "AFORGED".to_string();
        let forged_payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged).unwrap());
        parts[1] = &forged_payload;

        let err = decode::<OperatorPayload>(&parts.join(".")).unwrap_err();
        assert!(matches!(err, JwtError::Signature(_)));
    }

    #[test]
    fn wrong_algorithm_is_rejected() {
        let header = URL_SAFE_NO_PAD.encode(br#"{"typ":"JWT","alg":"HS256"}"#);
        let payload = URL_SAFE_NO_PAD.encode(br#"{"sub":"X","nats":{}}"#);
        let err = decode::<GenericPayload>(&format!("{header}.{payload}.c2ln")).unwrap_err();
        assert!(matches!(err, JwtError::UnsupportedAlgorithm(_)));
    }

    #[test]
    fn account_limit_defaults_are_unrestricted() {
        let limits = OperatorLimits::default();
        assert_eq!(limits.nats.subs, NO_LIMIT);
        assert_eq!(limits.account.conn, NO_LIMIT);
        assert!(limits.account.wildcards);
        assert_eq!(limits.jetstream.mem_storage, 0);
    }
}
