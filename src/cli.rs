//! Command-line interface definitions.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use crate::hook::Invocation;

/// Assume an AWS profile, taking MFA tokens and access keys from 1Password.
///
/// Prints shell exports for the resulting credentials on stdout, e.g.
/// `eval "$(awsume-op production)"`.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Args {
    /// Profile to assume [default: default]
    pub profile: Option<String>,

    /// MFA token, skipping 1Password
    ///
    /// 1Password is only asked for a token when the base profile of the role
    /// chain (or its source profile) carries `mfa_serial`. When the device is
    /// configured on a role profile instead, pass the token here.
    #[arg(short, long)]
    pub mfa_token: Option<String>,

    /// Ignore cached sessions
    #[arg(short = 'r', long)]
    pub force_refresh: bool,

    /// Path to the awsume config file [default: ~/.awsume/config.yaml]
    #[arg(long, env = "AWSUME_CONFIG")]
    pub config_path: Option<PathBuf>,

    /// Path to the AWS config file [default: ~/.aws/config]
    #[arg(long, env = "AWS_CONFIG_FILE")]
    pub aws_config_file: Option<PathBuf>,

    /// Path to AWS credentials file [default: ~/.aws/credentials]
    #[arg(short, long, env = "AWS_SHARED_CREDENTIALS_FILE")]
    pub credentials_path: Option<PathBuf>,

    /// Session cache directory [default: ~/.awsume/cache]
    #[arg(long, env = "AWSUME_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// 1Password CLI executable
    #[arg(long, env = "AWSUME_OP_PATH", default_value = "op")]
    pub op_path: PathBuf,

    /// 1Password account to use
    #[arg(long, env = "AWSUME_OP_ACCOUNT")]
    pub op_account: Option<String>,

    /// Session duration in seconds (900-129600)
    #[arg(short, long, env = "AWS_SESSION_DURATION", default_value = "3600")]
    pub duration: u32,

    /// Role session name
    #[arg(long, default_value = "awsume-op")]
    pub session_name: String,

    /// Region to export, overriding the profile's
    #[arg(long)]
    pub region: Option<String>,
}

impl Args {
    pub fn invocation(&self) -> Invocation {
        Invocation {
            target_profile_name: self.profile.clone(),
            mfa_token: self.mfa_token.clone(),
            force_refresh: self.force_refresh,
        }
    }
}

/// `explicit`, or `relative` under the home directory.
pub fn home_path(explicit: Option<PathBuf>, relative: &[&str]) -> Result<PathBuf> {
    explicit
        .or_else(|| dirs::home_dir().map(|home| relative.iter().fold(home, |path, part| path.join(part))))
        .context("Could not determine home directory")
}
