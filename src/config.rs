//! Awsume-style YAML configuration and the `1password` section.
//!
//! The section comes in three shapes, all of which are still found in the wild:
//!
//! ```yaml
//! # one vault item for every MFA device
//! 1password: "AWS MFA"
//!
//! # MFA device serial -> vault item, plus per-profile items
//! 1password:
//!   arn:aws:iam::123456789012:mfa/alice: "AWS Production"
//!   profiles:
//!     production-keys:
//!       item: "AWS Production"
//! ```
//!
//! The shape is decoded once into an [`ItemMapping`] so the hook never has to
//! inspect raw values again.

use std::{collections::BTreeMap, path::Path};

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Format, Yaml},
};
use log::debug;
use serde::Deserialize;
use serde_json::Value;

/// Name of the configuration section owned by this crate.
pub const SECTION: &str = "1password";

/// Settings attached to a single AWS profile under `1password.profiles`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileSettings {
    /// Title of the vault item holding this profile's keys and OTP.
    pub item: Option<String>,
}

/// Decoded form of the `1password` section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ItemMapping {
    /// No section, or one of an unsupported type.
    #[default]
    Absent,
    /// A single vault item used for every MFA serial.
    Single(String),
    /// A mapping of MFA serial to vault item, with optional per-profile settings.
    Keyed {
        serials: BTreeMap<String, String>,
        profiles: BTreeMap<String, ProfileSettings>,
    },
}

impl ItemMapping {
    /// Decodes the raw section value.
    ///
    /// Malformed nested entries are skipped rather than rejected.
    pub fn decode(value: Option<&Value>) -> Self {
        match value {
            None | Some(Value::Null) => {
                debug!("No {SECTION} config subsection");
                Self::Absent
            }
            Some(Value::String(title)) => Self::Single(title.clone()),
            Some(Value::Object(map)) => {
                let mut serials = BTreeMap::new();
                let mut profiles = BTreeMap::new();
                for (key, value) in map {
                    match (key.as_str(), value) {
                        ("profiles", Value::Object(entries)) => {
                            for (name, settings) in entries {
                                let Value::Object(settings) = settings else {
                                    debug!("Skipping malformed settings for profile {name}");
                                    continue;
                                };
                                let item = settings
                                    .get("item")
                                    .and_then(Value::as_str)
                                    .map(str::to_owned);
                                profiles.insert(name.clone(), ProfileSettings { item });
                            }
                        }
                        ("profiles", _) => debug!("Skipping malformed profiles mapping"),
                        (serial, Value::String(title)) => {
                            serials.insert(serial.to_owned(), title.clone());
                        }
                        (serial, _) => debug!("Skipping malformed entry for {serial}"),
                    }
                }
                Self::Keyed { serials, profiles }
            }
            Some(_) => {
                debug!("Malformed {SECTION} config subsection");
                Self::Absent
            }
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    /// Vault item title to request a one-time password from, for an MFA serial.
    pub fn item_for_serial(&self, mfa_serial: &str) -> Option<&str> {
        let item = match self {
            Self::Absent => None,
            Self::Single(title) => Some(title.as_str()),
            Self::Keyed { serials, .. } => serials.get(mfa_serial).map(String::as_str),
        }
        .filter(|title| !title.is_empty());
        if item.is_none() {
            debug!("No vault item specified for this mfa_serial");
        }
        item
    }

    /// Vault item title configured for an AWS profile.
    pub fn profile_item(&self, profile_name: &str) -> Option<&str> {
        match self {
            Self::Keyed { profiles, .. } => profiles
                .get(profile_name)?
                .item
                .as_deref()
                .filter(|title| !title.is_empty()),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(rename = "1password", default)]
    one_password: Option<Value>,
}

/// Configuration relevant to this crate, loaded once per invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub one_password: ItemMapping,
}

impl Config {
    /// Loads the YAML file at `path`. A missing file yields an empty config.
    pub fn load(path: &Path) -> Result<Self> {
        Self::from_figment(&Figment::new().merge(Yaml::file(path)))
            .with_context(|| format!("Failed to load config from {}", path.display()))
    }

    pub fn from_figment(figment: &Figment) -> Result<Self> {
        let raw: RawConfig = figment.extract()?;
        Ok(Self {
            one_password: ItemMapping::decode(raw.one_password.as_ref()),
        })
    }
}
