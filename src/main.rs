//! awsume-op
//!
//! Assumes an AWS profile without interactive prompts:
//! 1. Parses command-line arguments
//! 2. Loads the awsume config and the AWS config/credentials files
//! 3. Lets the hook pull missing access keys and the MFA token from 1Password
//! 4. Exchanges the credentials with STS along the role chain
//! 5. Prints shell exports for the result

use anyhow::Result;
use clap::Parser;

use awsume_op::{
    cli::{self, Args},
    config::Config,
    credentials::Exports,
    exchange::{CredentialExchange, ExchangeOptions},
    hook::Hook,
    op::OpCli,
    profiles,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Users can override with RUST_LOG.
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let args = Args::parse();
    let mut invocation = args.invocation();

    let config = Config::load(&cli::home_path(args.config_path, &[".awsume", "config.yaml"])?)?;
    let mut profiles = profiles::load(
        &cli::home_path(args.aws_config_file, &[".aws", "config"])?,
        &cli::home_path(args.credentials_path, &[".aws", "credentials"])?,
    )?;
    let cache_dir = cli::home_path(args.cache_dir, &[".awsume", "cache"])?;

    let mut op = OpCli::new(args.op_path);
    if let Some(account) = &args.op_account {
        op = op.account(account);
    }

    Hook::new(op, cache_dir.clone()).pre_get_credentials(&config, &mut invocation, &mut profiles);

    let options = ExchangeOptions {
        cache_dir,
        duration: args.duration,
        session_name: args.session_name,
        region: args.region,
    };
    let assumed = CredentialExchange::new(&profiles, options)
        .exchange(&invocation)
        .await?;

    print!(
        "{}",
        Exports {
            profile_name: &assumed.profile_name,
            credentials: &assumed.credentials,
            region: assumed.region.as_deref(),
        }
    );
    Ok(())
}
