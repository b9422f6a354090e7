//! Account-server session. Each push or delete opens its own short-lived
//! NATS connection authenticated as a freshly minted, never-persisted
//! system-account user, and closes it on all exit paths. Connections are
//! deliberately not shared so every operation authenticates freshly.

use std::io::Write;
use std::sync::Arc;

use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use crate::jwt::{Claims, GenericPayload, JwtError, UserPayload};
use crate::nkey::{self, KeyKind};

pub const SUBJECT_CLAIMS_UPDATE: &str = "$SYS.REQ.CLAIMS.UPDATE";
pub const SUBJECT_CLAIMS_DELETE: &str = "$SYS.REQ.CLAIMS.DELETE";
pub const CONNECTION_NAME: &str = "nats-accounts-operator";
pub const EPHEMERAL_USER_NAME: &str = "k8s-operator-tmp-user";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to create temporary system account user: {0}")]
    Credentials(String),
    #[error("failed to write CA bundle: {0}")]
    CaBundle(#[from] std::io::Error),
    #[error("failed to connect to account server: {0}")]
    Connect(#[from] async_nats::ConnectError),
    #[error("account server request failed: {0}")]
    Request(#[from] async_nats::RequestError),
    #[error("failed to decode account server reply: {0}")]
    Reply(#[from] serde_json::Error),
    #[error(transparent)]
    Jwt(#[from] JwtError),
    #[error("account server rejected request: {0}")]
    Rejected(String),
}

/// Subset of the nats-server `ServerInfo` block present in every reply.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "ver")]
    pub version: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorInfo {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub account: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplyData {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub account: String,
}

/// Reply envelope for `$SYS.REQ.CLAIMS.*` requests. `error` and `data` are
/// mutually exclusive; a present `error` is a failure regardless of
/// transport success.
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateReply {
    #[serde(default)]
    pub server: Option<ServerInfo>,
    #[serde(default)]
    pub error: Option<ErrorInfo>,
    #[serde(default)]
    pub data: Option<ReplyData>,
}

pub struct Session {
    client: async_nats::Client,
    operator: nkeys::KeyPair,
    operator_subject: String,
}

impl Session {
    /// Connects to the account server authenticating as an ephemeral
    /// system-account user. `operator` is the keypair used to sign delete
    /// payloads; `system_account_seed` signs the temporary user JWT.
    pub async fn connect(
        url: &str,
        operator: nkeys::KeyPair,
        system_account_seed: &str,
        ca_bundle: Option<&[u8]>,
    ) -> Result<Self, SessionError> {
        let (ujwt, user_kp) = ephemeral_system_user(system_account_seed)?;
        let user_kp = Arc::new(user_kp);

        let operator_subject = operator.public_key();

        let mut options = async_nats::ConnectOptions::with_jwt(ujwt, move |nonce| {
            let kp = user_kp.clone();
            async move { kp.sign(&nonce).map_err(async_nats::AuthError::new) }
        })
        .name(CONNECTION_NAME);

        // the bundle is written to a transient file handed to the TLS stack;
        // it is removed once the connection is established
        let mut ca_file = None;
        if let Some(ca) = ca_bundle {
            let mut file = tempfile::NamedTempFile::new()?;
            file.write_all(ca)?;
            file.flush()?;
            options = options
                .add_root_certificates(file.path().to_path_buf())
                .require_tls(true);
            ca_file = Some(file);
        }

        let client = options.connect(url).await?;
        drop(ca_file);

        Ok(Self {
            client,
            operator,
            operator_subject,
        })
    }

    /// Pushes an account JWT to `$SYS.REQ.CLAIMS.UPDATE`.
    pub async fn push(&self, ajwt: &str) -> Result<(), SessionError> {
        let reply = self
            .request(SUBJECT_CLAIMS_UPDATE, ajwt.as_bytes().to_vec())
            .await?;
        debug!(
            server = reply.server.as_ref().map(|s| s.name.as_str()).unwrap_or(""),
            message = reply.data.as_ref().map(|d| d.message.as_str()).unwrap_or(""),
            "account jwt pushed"
        );
        Ok(())
    }

    /// Revokes an account at the server by sending an operator-signed
    /// generic claim listing the account public key under `accounts`.
    pub async fn delete(&self, account_public_key: &str) -> Result<(), SessionError> {
        let payload = delete_claims_payload(&self.operator, &self.operator_subject, account_public_key)?;
        let reply = self
            .request(SUBJECT_CLAIMS_DELETE, payload.into_bytes())
            .await?;
        debug!(
            account = account_public_key,
            message = reply.data.as_ref().map(|d| d.message.as_str()).unwrap_or(""),
            "account jwt deleted"
        );
        Ok(())
    }

    /// Drains the connection. Errors are logged only; the connection is gone
    /// either way.
    pub async fn close(self) {
        if let Err(err) = self.client.drain().await {
            debug!(error = ?err, "failed to drain account server connection");
        }
    }

    async fn request(&self, subject: &str, payload: Vec<u8>) -> Result<UpdateReply, SessionError> {
        let msg = self
            .client
            .request(subject.to_string(), Bytes::from(payload))
            .await?;
        let reply: UpdateReply = serde_json::from_slice(&msg.payload)?;
        if let Some(err) = &reply.error {
            return Err(SessionError::Rejected(format!(
                "{} (code {})",
                err.description, err.code
            )));
        }
        Ok(reply)
    }
}

fn ephemeral_system_user(system_account_seed: &str) -> Result<(String, nkeys::KeyPair), SessionError> {
    let sys_kp = nkey::from_seed_expecting(system_account_seed, KeyKind::Account)
        .map_err(|e| SessionError::Credentials(e.to_string()))?;
    let user_kp = KeyKind::User.create();

    let mut claims = Claims::<UserPayload>::new(user_kp.public_key());
    claims.name = EPHEMERAL_USER_NAME.to_string();
    let ujwt = claims.encode(&sys_kp)?;

    Ok((ujwt, user_kp))
}

fn delete_claims_payload(
    operator: &nkeys::KeyPair,
    operator_subject: &str,
    account_public_key: &str,
) -> Result<String, SessionError> {
    let mut claims = Claims::<GenericPayload>::new(operator_subject);
    claims
        .nats
        .insert("accounts".to_string(), json!([account_public_key]));
    Ok(claims.encode(operator)?)
}

/// Renders the decorated credentials artifact NATS client libraries parse
/// directly: a user JWT block followed by the seed block.
pub fn format_user_config(jwt: &str, seed: &str) -> String {
    format!(
        "-----BEGIN NATS USER JWT-----\n{jwt}\n------END NATS USER JWT------\n\n\
         ************************* IMPORTANT *************************\n\
         NKEY Seed printed below can be used to sign and prove identity.\n\
         NKEYs are sensitive and should be treated as secrets.\n\n\
         -----BEGIN USER NKEY SEED-----\n{seed}\n------END USER NKEY SEED------\n\n\
         *************************************************************\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jwt;

    #[test]
    fn ephemeral_user_is_signed_by_system_account() {
        let sys = KeyKind::Account.create();
        let seed = sys.seed().unwrap();

        let (ujwt, user_kp) = ephemeral_system_user(&seed).unwrap();
        let claims = jwt::decode::<UserPayload>(&ujwt).unwrap();
        assert_eq!(claims.name, EPHEMERAL_USER_NAME);
        assert_eq!(claims.iss, sys.public_key());
        assert_eq!(claims.sub, user_kp.public_key());
    }

    #[test]
    fn ephemeral_user_rejects_non_account_seed() {
        let op = KeyKind::Operator.create();
        let err = ephemeral_system_user(&op.seed().unwrap()).unwrap_err();
        assert!(matches!(err, SessionError::Credentials(_)));
    }

    #[test]
    fn delete_payload_lists_account_under_accounts() {
        let operator = KeyKind::Operator.create();
        let subject = operator.public_key();
        let account_pk = KeyKind::Account.create().public_key();

        let token = delete_claims_payload(&operator, &subject, &account_pk).unwrap();
        let claims = jwt::decode::<GenericPayload>(&token).unwrap();

        assert_eq!(claims.iss, subject);
        assert_eq!(claims.sub, subject);
        assert_eq!(claims.nats["accounts"], json!([account_pk]));
    }

    #[test]
    fn reply_with_error_is_rejected() {
        let raw = r#"{"server":{"name":"nats-0"},"error":{"code":500,"description":"jwt update resulted in error","account":"A"}}"#;
        let reply: UpdateReply = serde_json::from_slice(raw.as_bytes()).unwrap();
        assert!(reply.error.is_some());
        assert_eq!(reply.server.unwrap().name, "nats-0");
    }

    #[test]
    fn creds_bundle_carries_jwt_and_seed_blocks() {
        let creds = format_user_config("eyJ0.eyJz.c2ln", "SUEXAMPLESEED");
        assert!(creds.contains("-----BEGIN NATS USER JWT-----\neyJ0.eyJz.c2ln\n"));
        assert!(creds.contains("-----BEGIN USER NKEY SEED-----\nSUEXAMPLESEED\n"));
        let jwt_at = creds.find("BEGIN NATS USER JWT").unwrap();
        let seed_at = creds.find("BEGIN USER NKEY SEED").unwrap();
        assert!(jwt_at < seed_at);
    }
}
