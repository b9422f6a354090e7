//! Secret construction for seeds, JWTs and credential bundles. Every secret
//! carries type annotations, searchable labels and a controller
//! owner-reference back to the resource that manages it.

use std::collections::BTreeMap;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

use crate::crds::common::{
    ANNOTATION_JWT_TYPE, ANNOTATION_SECRET_TYPE, ANNOTATION_SEED_TYPE, API_VERSION, LABEL_SUBJECT,
    ResourceKind, SECRET_CA_KEY, SECRET_CREDS_KEY, SECRET_JWT_KEY, SECRET_PUBLIC_KEY_KEY,
    SECRET_SEED_KEY, SECRET_TYPE_CREDENTIALS, SECRET_TYPE_JWT, SECRET_TYPE_SEED,
    SEED_PROTECTION_FINALIZER,
};

/// The resource a secret belongs to.
#[derive(Debug, Clone)]
pub struct SecretOwner {
    pub kind: ResourceKind,
    pub name: String,
    pub namespace: String,
    pub uid: String,
}

impl SecretOwner {
    pub fn controller_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: API_VERSION.to_string(),
            kind: self.kind.as_str().to_string(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SeedSecretOptions {
    /// Adds the `seed-protection` finalizer which no controller removes.
    pub deletion_prevention: bool,
}

pub fn build_seed_secret(
    owner: &SecretOwner,
    secret_name: &str,
    seed: &str,
    public_key: &str,
    opts: &SeedSecretOptions,
) -> Secret {
    let mut secret = Secret::default();
    populate_seed_secret(&mut secret, owner, secret_name, seed, public_key, opts);
    secret
}

/// Applies the desired seed-secret shape onto `secret`, which may be a fresh
/// value or a copy of the live secret (the metadata-repair path). Seed bytes
/// are written as-is; callers never rewrite them on an existing secret since
/// seed secrets are immutable.
pub fn populate_seed_secret(
    secret: &mut Secret,
    owner: &SecretOwner,
    secret_name: &str,
    seed: &str,
    public_key: &str,
    opts: &SeedSecretOptions,
) {
    secret.metadata.name = Some(secret_name.to_string());
    secret.metadata.namespace = Some(owner.namespace.clone());
    secret.metadata.owner_references = Some(vec![owner.controller_reference()]);

    let annotations = secret.metadata.annotations.get_or_insert_with(BTreeMap::new);
    annotations.insert(ANNOTATION_SECRET_TYPE.into(), SECRET_TYPE_SEED.into());
    annotations.insert(ANNOTATION_SEED_TYPE.into(), owner.kind.as_str().into());

    let labels = secret.metadata.labels.get_or_insert_with(BTreeMap::new);
    labels.insert(LABEL_SUBJECT.into(), public_key.to_string());
    labels.insert(owner.kind.name_label().into(), owner.name.clone());

    if opts.deletion_prevention {
        let finalizers = secret.metadata.finalizers.get_or_insert_with(Vec::new);
        if !finalizers.iter().any(|f| f == SEED_PROTECTION_FINALIZER) {
            finalizers.push(SEED_PROTECTION_FINALIZER.to_string());
        }
    }

    secret.immutable = Some(true);
    secret.data = Some(BTreeMap::from([
        (SECRET_SEED_KEY.to_string(), ByteString(seed.as_bytes().to_vec())),
        (
            SECRET_PUBLIC_KEY_KEY.to_string(),
            ByteString(public_key.as_bytes().to_vec()),
        ),
    ]));
}

pub fn build_jwt_secret(owner: &SecretOwner, secret_name: &str, jwt: &str) -> Secret {
    let mut secret = Secret::default();
    populate_jwt_secret(&mut secret, owner, secret_name, jwt);
    secret
}

pub fn populate_jwt_secret(secret: &mut Secret, owner: &SecretOwner, secret_name: &str, jwt: &str) {
    secret.metadata.name = Some(secret_name.to_string());
    secret.metadata.namespace = Some(owner.namespace.clone());
    secret.metadata.owner_references = Some(vec![owner.controller_reference()]);

    let annotations = secret.metadata.annotations.get_or_insert_with(BTreeMap::new);
    annotations.insert(ANNOTATION_SECRET_TYPE.into(), SECRET_TYPE_JWT.into());
    annotations.insert(ANNOTATION_JWT_TYPE.into(), owner.kind.as_str().into());

    let labels = secret.metadata.labels.get_or_insert_with(BTreeMap::new);
    labels.insert(owner.kind.name_label().into(), owner.name.clone());

    secret.data = Some(BTreeMap::from([(
        SECRET_JWT_KEY.to_string(),
        ByteString(jwt.as_bytes().to_vec()),
    )]));
}

pub fn build_credentials_secret(
    owner: &SecretOwner,
    secret_name: &str,
    creds: &str,
    public_key: &str,
    ca: Option<&[u8]>,
) -> Secret {
    let mut secret = Secret::default();
    populate_credentials_secret(&mut secret, owner, secret_name, creds, public_key, ca);
    secret
}

pub fn populate_credentials_secret(
    secret: &mut Secret,
    owner: &SecretOwner,
    secret_name: &str,
    creds: &str,
    public_key: &str,
    ca: Option<&[u8]>,
) {
    secret.metadata.name = Some(secret_name.to_string());
    secret.metadata.namespace = Some(owner.namespace.clone());
    secret.metadata.owner_references = Some(vec![owner.controller_reference()]);

    let annotations = secret.metadata.annotations.get_or_insert_with(BTreeMap::new);
    annotations.insert(ANNOTATION_SECRET_TYPE.into(), SECRET_TYPE_CREDENTIALS.into());
    annotations.insert(ANNOTATION_JWT_TYPE.into(), owner.kind.as_str().into());

    let labels = secret.metadata.labels.get_or_insert_with(BTreeMap::new);
    labels.insert(LABEL_SUBJECT.into(), public_key.to_string());
    labels.insert(owner.kind.name_label().into(), owner.name.clone());

    let mut data = BTreeMap::from([(
        SECRET_CREDS_KEY.to_string(),
        ByteString(creds.as_bytes().to_vec()),
    )]);
    if let Some(ca) = ca {
        data.insert(SECRET_CA_KEY.to_string(), ByteString(ca.to_vec()));
    }
    secret.data = Some(data);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::common::LABEL_ACCOUNT_NAME;

    fn owner() -> SecretOwner {
        SecretOwner {
            kind: ResourceKind::Account,
            name: "tenant-a".into(),
            namespace: "tenants".into(),
            uid: "uid-1".into(),
        }
    }

    #[test]
    fn seed_secret_shape() {
        let secret = build_seed_secret(
            &owner(),
            "tenant-a-seed",
            "SAEXAMPLESEED",
            "AEXAMPLEPUB",
            &SeedSecretOptions::default(),
        );

        assert_eq!(secret.metadata.name.as_deref(), Some("tenant-a-seed"));
        assert_eq!(secret.metadata.namespace.as_deref(), Some("tenants"));
        assert_eq!(secret.immutable, Some(true));
        assert!(secret.metadata.finalizers.is_none());

        let data = secret.data.as_ref().unwrap();
        assert_eq!(data[SECRET_SEED_KEY].0, b"SAEXAMPLESEED");
        assert_eq!(data[SECRET_PUBLIC_KEY_KEY].0, b"AEXAMPLEPUB");

        let labels = secret.metadata.labels.as_ref().unwrap();
        assert_eq!(labels[LABEL_SUBJECT], "AEXAMPLEPUB");
        assert_eq!(labels[LABEL_ACCOUNT_NAME], "tenant-a");

        let annotations = secret.metadata.annotations.as_ref().unwrap();
        assert_eq!(annotations[ANNOTATION_SECRET_TYPE], SECRET_TYPE_SEED);
        assert_eq!(annotations[ANNOTATION_SEED_TYPE], "Account");

        let owner_ref = &secret.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner_ref.kind, "Account");
        assert_eq!(owner_ref.controller, Some(true));
    }

    #[test]
    fn deletion_prevention_adds_marker_finalizer_once() {
        let mut secret = build_seed_secret(
            &SecretOwner {
                kind: ResourceKind::Operator,
                name: "main".into(),
                namespace: "nats".into(),
                uid: "uid-op".into(),
            },
            "main-seed",
            "SOEXAMPLE",
            "OEXAMPLE",
            &SeedSecretOptions {
                deletion_prevention: true,
            },
        );
        assert_eq!(
            secret.metadata.finalizers.as_deref(),
            Some(&[SEED_PROTECTION_FINALIZER.to_string()][..])
        );

        // repopulating must not duplicate the marker
        let owner = SecretOwner {
            kind: ResourceKind::Operator,
            name: "main".into(),
            namespace: "nats".into(),
            uid: "uid-op".into(),
        };
        populate_seed_secret(
            &mut secret,
            &owner,
            "main-seed",
            "SOEXAMPLE",
            "OEXAMPLE",
            &SeedSecretOptions {
                deletion_prevention: true,
            },
        );
        assert_eq!(secret.metadata.finalizers.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn credentials_secret_includes_ca_only_when_present() {
        let with_ca = build_credentials_secret(
            &owner(),
            "svc-creds",
            "creds text",
            "UEXAMPLE",
            Some(b"---cert---"),
        );
        assert!(with_ca.data.as_ref().unwrap().contains_key(SECRET_CA_KEY));

        let without_ca =
            build_credentials_secret(&owner(), "svc-creds", "creds text", "UEXAMPLE", None);
        assert!(!without_ca.data.as_ref().unwrap().contains_key(SECRET_CA_KEY));
    }
}
