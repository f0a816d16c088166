//! Credential exchange with STS.
//!
//! Walks the role chain produced by the hook:
//! - the base profile supplies long-term keys; with an MFA device they are
//!   traded for a session token, which is cached under the access key id so
//!   later runs can skip the token while the session lasts,
//! - every following profile with a `role_arn` is assumed in turn, using the
//!   credentials obtained so far.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use log::{debug, info, warn};

use crate::{
    cache,
    credentials::{AwsCredentials, RoleRequest},
    hook::Invocation,
    profiles::{self, Profiles, value},
};

/// Settings of the exchange that do not come from the profiles.
#[derive(Debug, Clone)]
pub struct ExchangeOptions {
    pub cache_dir: PathBuf,
    pub duration: u32,
    pub session_name: String,
    pub region: Option<String>,
}

/// Credentials for the target profile, plus where to use them.
pub struct Assumed {
    pub profile_name: String,
    pub credentials: AwsCredentials,
    pub region: Option<String>,
}

pub struct CredentialExchange<'a> {
    profiles: &'a Profiles,
    options: ExchangeOptions,
}

impl<'a> CredentialExchange<'a> {
    pub fn new(profiles: &'a Profiles, options: ExchangeOptions) -> Self {
        Self { profiles, options }
    }

    /// Exchanges the hydrated profiles for credentials of the target profile.
    ///
    /// # Arguments
    /// * `invocation` - Target profile, MFA token and refresh flag, as left by
    ///   the hook
    ///
    /// # Returns
    /// * `Ok(Assumed)` - Credentials for the last profile of the role chain
    /// * `Err(anyhow::Error)` - The exchange failed
    ///
    /// # Errors
    /// This function will return an error if:
    /// * The role chain is cyclical or its base profile does not exist
    /// * The base profile has no static keys
    /// * An MFA device is configured (on the base profile or the first role)
    ///   but neither a valid cached session nor a token is available
    /// * STS rejects a `GetSessionToken` or `AssumeRole` call
    /// * The session cache cannot be written
    pub async fn exchange(&self, invocation: &Invocation) -> Result<Assumed> {
        let target = profiles::profile_name(invocation.target_profile_name.as_deref());
        let chain = profiles::role_chain(self.profiles, &target)?;
        let base_name = &chain[0];
        let base = self
            .profiles
            .get(base_name)
            .with_context(|| format!("Profile {base_name} not found"))?;

        let region = self
            .options
            .region
            .clone()
            .or_else(|| self.profiles.get(&target).and_then(|p| value(p, "region")).map(str::to_owned))
            .or_else(|| value(base, "region").map(str::to_owned));

        let source = profiles::to_credentials(base);
        let (Some(access_key_id), Some(secret_access_key)) = (source.access_key_id, source.secret_access_key)
        else {
            bail!("Profile {base_name} has no aws_access_key_id / aws_secret_access_key");
        };
        let mut credentials = AwsCredentials::new(access_key_id, secret_access_key, source.session_token);

        let mfa_serial = profiles::mfa_serial(self.profiles, base_name)
            .or_else(|| chain.get(1).and_then(|role| profiles::mfa_serial(self.profiles, role)));
        if let Some(mfa_serial) = mfa_serial {
            credentials = self
                .mfa_session(&credentials, mfa_serial, invocation, region.as_deref())
                .await?;
        }

        for name in &chain[1..] {
            let Some(profile) = self.profiles.get(name) else {
                continue;
            };
            let Some(role_arn) = value(profile, "role_arn") else {
                debug!("Profile {name} has no role_arn, nothing to assume");
                continue;
            };
            info!("Assuming {role_arn}");
            let request = RoleRequest {
                role_arn,
                session_name: &self.options.session_name,
                external_id: value(profile, "external_id"),
                duration: self.options.duration,
            };
            let session = credentials.assume_role(request, region.as_deref()).await?;
            credentials = AwsCredentials::from_session(&session)?;
        }

        Ok(Assumed {
            profile_name: target,
            credentials,
            region,
        })
    }

    /// Session credentials for an MFA-protected base profile, from the cache
    /// when still valid.
    async fn mfa_session(
        &self,
        credentials: &AwsCredentials,
        mfa_serial: &str,
        invocation: &Invocation,
        region: Option<&str>,
    ) -> Result<AwsCredentials> {
        let cache_name = cache::file_name(credentials.access_key_id());
        if !invocation.force_refresh {
            match cache::read(&self.options.cache_dir, &cache_name) {
                Ok(Some(session)) if session.is_valid(Utc::now()) => {
                    debug!("Using cached session {cache_name}");
                    return AwsCredentials::from_session(&session);
                }
                Ok(_) => {}
                Err(e) => warn!("{e:#}"),
            }
        }

        let token = invocation
            .mfa_token
            .as_deref()
            .filter(|token| !token.is_empty())
            .with_context(|| {
                format!(
                    "MFA token required for {mfa_serial}; pass it with --mfa-token \
                     (1Password is only asked when the base profile carries mfa_serial)"
                )
            })?;
        info!("Fetching session token - Duration: {}s", self.options.duration);
        let session = credentials
            .get_session_token(mfa_serial, token, self.options.duration, region)
            .await?;
        cache::write(&self.options.cache_dir, &cache_name, &session)?;
        AwsCredentials::from_session(&session)
    }
}
