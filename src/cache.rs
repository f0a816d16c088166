//! Session cache shared with awsume.
//!
//! Sessions obtained with an MFA token are stored as JSON in
//! `~/.awsume/cache/aws-credentials-<AccessKeyId>` so the next run can skip
//! the token altogether while the session is still valid.

use std::{fs, io, path::Path};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Format of `Expiration`, always in UTC.
pub const EXPIRATION_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Session {
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    #[serde(default)]
    pub session_token: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub expiration: Option<String>,
}

impl Session {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let expiration = self.expiration.as_deref()?;
        NaiveDateTime::parse_from_str(expiration, EXPIRATION_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    }

    pub fn set_expires_at(&mut self, at: DateTime<Utc>) {
        self.expiration = Some(at.format(EXPIRATION_FORMAT).to_string());
    }

    /// A session is valid when it carries keys and has not expired yet.
    /// A session without expiration never expires; an unreadable one has.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        if self.access_key_id.is_none() || self.secret_access_key.is_none() {
            return false;
        }
        match &self.expiration {
            None => true,
            Some(_) => self.expires_at().is_some_and(|at| at > now),
        }
    }
}

pub fn file_name(access_key_id: &str) -> String {
    format!("aws-credentials-{access_key_id}")
}

/// Reads a cached session; a missing file is `None`.
pub fn read(dir: &Path, name: &str) -> Result<Option<Session>> {
    let path = dir.join(name);
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };
    serde_json::from_str(&content)
        .map(Some)
        .with_context(|| format!("Malformed session cache {}", path.display()))
}

pub fn write(dir: &Path, name: &str, session: &Session) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let path = dir.join(name);
    fs::write(&path, serde_json::to_string(session)?)
        .with_context(|| format!("Failed to write {}", path.display()))
}
