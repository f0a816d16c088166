use std::fmt;

use anyhow::{Context, Result};
use aws_sdk_sts::{
    Client,
    config::{Credentials, Region},
    types,
};
use aws_smithy_types::date_time::Format;
use chrono::DateTime;
use log::info;

use crate::cache::Session;

#[derive(Clone)]
pub struct AwsCredentials {
    credentials: Credentials,
}

/// Parameters of an `AssumeRole` call.
#[derive(Debug, Clone, Copy)]
pub struct RoleRequest<'a> {
    pub role_arn: &'a str,
    pub session_name: &'a str,
    pub external_id: Option<&'a str>,
    pub duration: u32,
}

impl AwsCredentials {
    pub fn new(access_key_id: String, secret_access_key: String, session_token: Option<String>) -> Self {
        Self {
            credentials: Credentials::new(access_key_id, secret_access_key, session_token, None, "awsume-op"),
        }
    }

    pub fn from_session(session: &Session) -> Result<Self> {
        Ok(Self::new(
            session.access_key_id.clone().context("Session without AccessKeyId")?,
            session.secret_access_key.clone().context("Session without SecretAccessKey")?,
            session.session_token.clone(),
        ))
    }

    pub fn access_key_id(&self) -> &str {
        self.credentials.access_key_id()
    }

    async fn client(&self, region: Option<&str>) -> Client {
        let mut loader = aws_config::from_env().credentials_provider(self.credentials.clone());
        if let Some(region) = region {
            loader = loader.region(Region::new(region.to_owned()));
        }
        Client::new(&loader.load().await)
    }

    pub async fn get_session_token(
        &self,
        mfa_serial: &str,
        token: &str,
        duration: u32,
        region: Option<&str>,
    ) -> Result<Session> {
        let credentials = self
            .client(region)
            .await
            .get_session_token()
            .duration_seconds(duration as i32)
            .serial_number(mfa_serial)
            .token_code(token)
            .send()
            .await?
            .credentials()
            .cloned()
            .context("No credentials returned")?;
        to_session(&credentials, region)
    }

    pub async fn assume_role(&self, request: RoleRequest<'_>, region: Option<&str>) -> Result<Session> {
        let credentials = self
            .client(region)
            .await
            .assume_role()
            .role_arn(request.role_arn)
            .role_session_name(request.session_name)
            .duration_seconds(request.duration as i32)
            .set_external_id(request.external_id.map(str::to_owned))
            .send()
            .await
            .with_context(|| format!("Failed to assume {}", request.role_arn))?
            .credentials()
            .cloned()
            .context("No credentials returned")?;
        to_session(&credentials, region)
    }
}

fn to_session(credentials: &types::Credentials, region: Option<&str>) -> Result<Session> {
    let expiration = credentials.expiration();
    info!("Credentials expire at: {}", expiration.fmt(Format::DateTime)?);

    let mut session = Session {
        access_key_id: Some(credentials.access_key_id().to_owned()),
        secret_access_key: Some(credentials.secret_access_key().to_owned()),
        session_token: Some(credentials.session_token().to_owned()),
        region: region.map(str::to_owned),
        expiration: None,
    };
    let expires_at = DateTime::from_timestamp(expiration.secs(), 0).context("Expiration out of range")?;
    session.set_expires_at(expires_at);
    Ok(session)
}

/// Shell exports for a set of credentials, ready for `eval`.
pub struct Exports<'a> {
    pub profile_name: &'a str,
    pub credentials: &'a AwsCredentials,
    pub region: Option<&'a str>,
}

impl fmt::Display for Exports<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let credentials = &self.credentials.credentials;
        writeln!(f, "export AWS_ACCESS_KEY_ID={}", credentials.access_key_id())?;
        writeln!(f, "export AWS_SECRET_ACCESS_KEY={}", credentials.secret_access_key())?;
        match credentials.session_token() {
            Some(token) => writeln!(f, "export AWS_SESSION_TOKEN={token}")?,
            None => writeln!(f, "unset AWS_SESSION_TOKEN")?,
        }
        if let Some(region) = self.region {
            writeln!(f, "export AWS_REGION={region}")?;
            writeln!(f, "export AWS_DEFAULT_REGION={region}")?;
        }
        writeln!(f, "export AWSUME_PROFILE={}", self.profile_name)
    }
}
