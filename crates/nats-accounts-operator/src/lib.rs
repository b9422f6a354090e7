pub mod account_controller;
pub mod base;
pub mod claims;
pub mod cli;
pub mod conditions;
pub mod crds;
pub mod error;
pub mod events;
pub mod helpers;
pub mod http;
pub mod jwt;
pub mod nkey;
pub mod nsc;
pub mod operator_controller;
pub mod resources;
pub mod signing_key_controller;
pub mod user_controller;
