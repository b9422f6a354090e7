use kube::core::CustomResourceExt;
use nats_accounts_operator::crds::{
    account::Account, operator::Operator, signing_key::SigningKey, user::User,
};

fn main() {
    let crds = vec![Operator::crd(), SigningKey::crd(), Account::crd(), User::crd()];
    for (i, crd) in crds.into_iter().enumerate() {
        if i > 0 {
            println!("---");
        }
        println!("{}", serde_yaml::to_string(&crd).expect("serialize crd"));
    }
}
