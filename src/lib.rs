//! Hydrates AWS profiles with MFA tokens and access keys from the 1Password CLI.
//!
//! The [`hook::Hook`] fills in what the AWS profiles lack right before
//! credentials are exchanged; [`exchange::CredentialExchange`] then talks to
//! STS with whatever it obtained.

pub mod cache;
pub mod cli;
pub mod config;
pub mod console;
pub mod credentials;
pub mod exchange;
pub mod hook;
pub mod op;
pub mod profiles;
