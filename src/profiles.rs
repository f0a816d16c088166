//! AWS shared config profiles and the lookups performed on them.
//!
//! Profiles are read from both `~/.aws/config` (sections named
//! `[profile <name>]`, plus `[default]`) and `~/.aws/credentials` (sections
//! named after the profile). Values from the credentials file win.

use std::{collections::BTreeMap, path::Path};

use anyhow::{Result, anyhow, bail};
use configparser::ini::Ini;
use log::debug;

/// Settings of a single profile, e.g. `source_profile` or `aws_access_key_id`.
pub type Profile = BTreeMap<String, String>;

/// Every known profile, by name.
pub type Profiles = BTreeMap<String, Profile>;

pub const DEFAULT_PROFILE: &str = "default";

/// Non-empty value of `key` in `profile`.
pub fn value<'a>(profile: &'a Profile, key: &str) -> Option<&'a str> {
    profile
        .get(key)
        .map(String::as_str)
        .filter(|value| !value.is_empty())
}

/// Loads and merges the AWS config and credentials files. Missing files are skipped.
pub fn load(config_file: &Path, credentials_file: &Path) -> Result<Profiles> {
    let mut profiles = Profiles::new();
    merge_ini(&mut profiles, config_file, true)?;
    merge_ini(&mut profiles, credentials_file, false)?;
    Ok(profiles)
}

fn merge_ini(profiles: &mut Profiles, path: &Path, config_style: bool) -> Result<()> {
    if !path.exists() {
        debug!("Skipping missing file {}", path.display());
        return Ok(());
    }

    // Case-sensitive: profile names and keys are used verbatim.
    let mut ini = Ini::new_cs();
    let sections = ini
        .load(path)
        .map_err(|e| anyhow!("Failed to load {}: {e}", path.display()))?;

    for (section, entries) in sections {
        let name = if !config_style || section == DEFAULT_PROFILE {
            section.as_str()
        } else if let Some(name) = section.strip_prefix("profile ") {
            name.trim()
        } else {
            // sso-session, services and friends
            continue;
        };

        let profile = profiles.entry(name.to_owned()).or_default();
        for (key, value) in entries {
            if let Some(value) = value {
                profile.insert(key, value);
            }
        }
    }
    Ok(())
}

/// Name of the profile to work on: the explicit target, else `default`.
pub fn profile_name(target: Option<&str>) -> String {
    target
        .filter(|name| !name.is_empty())
        .unwrap_or(DEFAULT_PROFILE)
        .to_owned()
}

/// Profiles traversed via `source_profile` links, base profile first and
/// `target` last.
pub fn role_chain(profiles: &Profiles, target: &str) -> Result<Vec<String>> {
    let mut chain: Vec<String> = Vec::new();
    let mut next = Some(target);
    while let Some(name) = next {
        if chain.iter().any(|seen| seen == name) {
            bail!("You cannot have a cyclical role chain ({name})");
        }
        chain.push(name.to_owned());
        next = profiles
            .get(name)
            .and_then(|profile| value(profile, "source_profile"));
    }
    chain.reverse();
    Ok(chain)
}

/// MFA device of a profile, falling back to its `source_profile`'s.
pub fn mfa_serial<'a>(profiles: &'a Profiles, name: &str) -> Option<&'a str> {
    let profile = profiles.get(name)?;
    value(profile, "mfa_serial").or_else(|| {
        let source = value(profile, "source_profile")?;
        value(profiles.get(source)?, "mfa_serial")
    })
}

/// Static credentials found directly in a profile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceCredentials {
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    pub region: Option<String>,
}

pub fn to_credentials(profile: &Profile) -> SourceCredentials {
    let get = |key| value(profile, key).map(str::to_owned);
    SourceCredentials {
        access_key_id: get("aws_access_key_id"),
        secret_access_key: get("aws_secret_access_key"),
        session_token: get("aws_session_token").or_else(|| get("aws_security_token")),
        region: get("region"),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use pretty_assertions::assert_eq;

    fn profile(entries: &[(&str, &str)]) -> Profile {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn test_load_merges_config_and_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("config");
        let credentials = dir.path().join("credentials");
        fs::write(
            &config,
            "[default]\nregion = eu-west-1\n\n\
             [profile Prod]\nrole_arn = arn:aws:iam::123456789012:role/admin\nsource_profile = prod-keys\n\n\
             [sso-session corp]\nsso_region = us-east-1\n",
        )
        .unwrap();
        fs::write(
            &credentials,
            "[prod-keys]\naws_access_key_id = AKIAEXAMPLE\naws_secret_access_key = secret\n\n\
             [default]\nregion = us-east-2\n",
        )
        .unwrap();

        let profiles = load(&config, &credentials).unwrap();

        assert_eq!(profiles.keys().collect::<Vec<_>>(), vec!["Prod", "default", "prod-keys"]);
        assert_eq!(profiles["default"], profile(&[("region", "us-east-2")]));
        assert_eq!(
            profiles["Prod"]["role_arn"],
            "arn:aws:iam::123456789012:role/admin"
        );
        assert_eq!(profiles["prod-keys"]["aws_access_key_id"], "AKIAEXAMPLE");
    }

    #[test]
    fn test_load_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let profiles = load(&dir.path().join("config"), &dir.path().join("credentials")).unwrap();
        assert!(profiles.is_empty());
    }

    #[test]
    fn test_profile_name() {
        assert_eq!(profile_name(Some("dev")), "dev");
        assert_eq!(profile_name(Some("")), "default");
        assert_eq!(profile_name(None), "default");
    }

    #[test]
    fn test_role_chain() {
        let mut profiles = Profiles::new();
        profiles.insert("admin".into(), profile(&[("source_profile", "dev")]));
        profiles.insert("dev".into(), profile(&[("source_profile", "keys")]));
        profiles.insert("keys".into(), Profile::new());

        assert_eq!(role_chain(&profiles, "admin").unwrap(), vec!["keys", "dev", "admin"]);
        assert_eq!(role_chain(&profiles, "keys").unwrap(), vec!["keys"]);
    }

    #[test]
    fn test_role_chain_stops_at_unknown_profile() {
        let mut profiles = Profiles::new();
        profiles.insert("dev".into(), profile(&[("source_profile", "missing")]));

        assert_eq!(role_chain(&profiles, "dev").unwrap(), vec!["missing", "dev"]);
    }

    #[test]
    fn test_cyclical_role_chain() {
        let mut profiles = Profiles::new();
        profiles.insert("a".into(), profile(&[("source_profile", "b")]));
        profiles.insert("b".into(), profile(&[("source_profile", "a")]));

        let err = role_chain(&profiles, "a").unwrap_err();
        assert!(err.to_string().contains("cyclical"));
    }

    #[test]
    fn test_mfa_serial_falls_back_to_source_profile() {
        let mut profiles = Profiles::new();
        profiles.insert("role".into(), profile(&[("source_profile", "keys")]));
        profiles.insert("keys".into(), profile(&[("mfa_serial", "arn:mfa/keys")]));
        profiles.insert(
            "own".into(),
            profile(&[("source_profile", "keys"), ("mfa_serial", "arn:mfa/own")]),
        );

        assert_eq!(mfa_serial(&profiles, "role"), Some("arn:mfa/keys"));
        assert_eq!(mfa_serial(&profiles, "own"), Some("arn:mfa/own"));
        assert_eq!(mfa_serial(&profiles, "keys"), Some("arn:mfa/keys"));
        assert_eq!(mfa_serial(&profiles, "missing"), None);
    }

    #[test]
    fn test_to_credentials() {
        let credentials = to_credentials(&profile(&[
            ("aws_access_key_id", "AKIA"),
            ("aws_secret_access_key", "secret"),
            ("aws_security_token", "legacy"),
            ("region", ""),
        ]));

        assert_eq!(
            credentials,
            SourceCredentials {
                access_key_id: Some("AKIA".into()),
                secret_access_key: Some("secret".into()),
                session_token: Some("legacy".into()),
                region: None,
            }
        );
    }
}
