//! Credential hydration hook.
//!
//! Runs right before credentials are exchanged. It fills in whatever the AWS
//! profiles lack from 1Password:
//! 1. links a placeholder source profile to profiles that have none,
//! 2. copies `aws_access_key_id` / `aws_secret_access_key` from a vault item
//!    into the base profile of the role chain,
//! 3. fetches an MFA token when one is needed and not already known.
//!
//! The hook never fails: anything that goes wrong is reported on the console
//! and the caller carries on with whatever was obtained.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use log::{debug, error, warn};

use crate::{
    cache,
    config::Config,
    console,
    op::{ItemCache, OTP_LABEL, OpCli},
    profiles::{self, Profile, Profiles, value},
};

pub const BUG_REPORT_URL: &str = "https://github.com/xeger/awsume-1password-plugin/issues/new/choose";

/// Keys hydrated from the vault item, in order.
const KEYS: [&str; 2] = ["aws_access_key_id", "aws_secret_access_key"];

/// Options of the current credential request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    pub target_profile_name: Option<String>,
    pub mfa_token: Option<String>,
    pub force_refresh: bool,
}

impl Invocation {
    fn has_mfa_token(&self) -> bool {
        self.mfa_token.as_deref().is_some_and(|token| !token.is_empty())
    }
}

/// Labels a vault field may use for a profile key, most specific first.
fn key_conventions(key: &str) -> [String; 4] {
    let short = key.strip_prefix("aws_").unwrap_or(key);
    [
        key.to_owned(),
        key.replace('_', " "),
        short.to_owned(),
        short.replace('_', " "),
    ]
}

#[derive(Debug, Clone)]
pub struct Hook {
    op: OpCli,
    cache_dir: PathBuf,
}

impl Hook {
    pub fn new(op: OpCli, cache_dir: PathBuf) -> Self {
        Self { op, cache_dir }
    }

    /// Hydrates `profiles` and `invocation` in place.
    ///
    /// # Arguments
    /// * `config` - Decoded configuration; without a `1password` section
    ///   nothing is touched
    /// * `invocation` - Receives the MFA token in `mfa_token`, when one is
    ///   needed and 1Password has it
    /// * `profiles` - Borrowed for the call only; may gain a placeholder
    ///   source profile and, on the base profile of the role chain,
    ///   `aws_access_key_id` / `aws_secret_access_key`
    ///
    /// # Error Handling
    /// Never fails. Lookups that come back empty are logged and skipped;
    /// anything else (e.g. a cyclical role chain) is reported on the console
    /// with a bug-report link, and the caller continues with whatever was
    /// obtained so far.
    pub fn pre_get_credentials(
        &self,
        config: &Config,
        invocation: &mut Invocation,
        profiles: &mut Profiles,
    ) {
        if let Err(e) = self.run(config, invocation, profiles) {
            handle_crash(&e);
        }
    }

    fn run(&self, config: &Config, invocation: &mut Invocation, profiles: &mut Profiles) -> Result<()> {
        if config.one_password.is_absent() {
            debug!("No 1password config, skip plugin flow");
            return Ok(());
        }

        let target = profiles::profile_name(invocation.target_profile_name.as_deref());
        if !profiles.contains_key(&target) {
            debug!("No profile {target} found, skip plugin flow");
            return Ok(());
        }
        link_source_profile(config, &target, profiles);

        let chain = profiles::role_chain(profiles, &target)?;
        let base_name = chain.first().context("Empty role chain")?.clone();
        let mut items = ItemCache::new(&self.op);

        let Some(base) = profiles.get_mut(&base_name) else {
            debug!("No profile {base_name} found, skip plugin flow");
            return Ok(());
        };
        match config.one_password.profile_item(&base_name) {
            Some(title) => {
                for key in KEYS {
                    hydrate_key(&mut items, base, &base_name, title, key);
                }
            }
            None => debug!("No 1password item for profile {base_name}, skip aws_credentials check"),
        }

        let source = profiles::to_credentials(base);
        let valid_cache_session = match source.access_key_id.as_deref() {
            Some(access_key_id) => self.valid_cache_session(access_key_id),
            None => {
                debug!("No aws_access_key_id for {base_name}, no cached session to look up");
                false
            }
        };

        let Some(mfa_serial) = profiles::mfa_serial(profiles, &base_name) else {
            debug!("No MFA required");
            return Ok(());
        };
        if valid_cache_session && !invocation.force_refresh {
            debug!("Cached session is still valid, no MFA token needed");
            return Ok(());
        }
        if invocation.has_mfa_token() {
            debug!("MFA token given on the command line");
            return Ok(());
        }

        // The serial mapping predates per-profile items and takes precedence.
        let token = match config.one_password.item_for_serial(mfa_serial) {
            Some(title) => self.op.otp(title),
            None => item_totp(config, &mut items, &base_name),
        };
        if let Some(token) = token {
            invocation.mfa_token = Some(token);
            console::say("Obtained MFA token from 1Password item.");
        }
        Ok(())
    }

    fn valid_cache_session(&self, access_key_id: &str) -> bool {
        match cache::read(&self.cache_dir, &cache::file_name(access_key_id)) {
            Ok(session) => session.is_some_and(|session| session.is_valid(Utc::now())),
            Err(e) => {
                warn!("{e:#}");
                false
            }
        }
    }
}

/// Gives the target profile a source profile it can be hydrated through.
fn link_source_profile(config: &Config, target: &str, profiles: &mut Profiles) {
    let Some(profile) = profiles.get(target) else {
        return;
    };
    let linked = ["source_profile", "credential_source", "credential_process"]
        .iter()
        .any(|key| value(profile, key).is_some());

    if !linked {
        let placeholder = format!("{target}_source_profile");
        profiles.entry(placeholder.clone()).or_default();
        if let Some(profile) = profiles.get_mut(target) {
            profile.insert("source_profile".to_owned(), placeholder);
        }
        return;
    }

    if value(profile, "credential_source").is_some_and(|source| profiles.contains_key(source)) {
        return;
    }
    let Some(source) = value(profile, "source_profile") else {
        return;
    };
    if config.one_password.profile_item(source).is_some() && !profiles.contains_key(source) {
        debug!("Creating profile {source} to hold keys from 1Password");
        let source = source.to_owned();
        profiles.insert(source, Profile::new());
    }
}

fn hydrate_key(items: &mut ItemCache<'_>, profile: &mut Profile, profile_name: &str, title: &str, key: &str) {
    if value(profile, key).is_some() {
        return;
    }
    debug!("No {key} set for {profile_name}, trying 1Password");
    let Some(item) = items.get(title) else {
        return;
    };

    let conventions = key_conventions(key);
    let labels = conventions.each_ref().map(String::as_str);
    match item.field(&labels).and_then(|field| field.value.as_deref()) {
        Some(secret) => {
            profile.insert(key.to_owned(), secret.to_owned());
            console::say(&format!("Obtained {key} from 1Password item: {title}"));
        }
        None => error!("No {key} found in 1Password item {title}"),
    }
}

fn item_totp(config: &Config, items: &mut ItemCache<'_>, profile_name: &str) -> Option<String> {
    let title = config.one_password.profile_item(profile_name)?;
    let item = items.get(title)?;
    let totp = item.field(&[OTP_LABEL]).and_then(|field| field.totp.clone());
    if totp.is_none() {
        debug!("No {OTP_LABEL} found in 1Password item {title}");
    }
    totp
}

fn handle_crash(e: &anyhow::Error) {
    console::alert(&format!(
        "Error invoking 1Password plugin; please file a bug report:\n  {BUG_REPORT_URL}"
    ));
    eprintln!("{e:?}");
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::Path;

    use chrono::TimeDelta;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::{
        cache::Session,
        config::ItemMapping,
        op::testing::{calls, fake_op},
    };

    const SERIAL: &str = "arn:aws:iam::123456789012:mfa/alice";

    const ITEM_JSON: &str = r#"echo '{"title":"AWS Dev","fields":[
        {"label":"access key id","value":"AKIAFROMVAULT"},
        {"label":"secret_access_key","value":"vault-secret"},
        {"label":"one-time password","totp":"987654"}]}'"#;

    fn profile(entries: &[(&str, &str)]) -> Profile {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    fn config(section: serde_json::Value) -> Config {
        Config {
            one_password: ItemMapping::decode(Some(&section)),
        }
    }

    fn invocation(target: &str) -> Invocation {
        Invocation {
            target_profile_name: Some(target.to_owned()),
            ..Invocation::default()
        }
    }

    /// A role profile sourcing from `dev-keys`, which holds the MFA serial.
    fn role_profiles(keys: &[(&str, &str)]) -> Profiles {
        let mut profiles = Profiles::new();
        profiles.insert(
            "dev".into(),
            profile(&[
                ("role_arn", "arn:aws:iam::123456789012:role/dev"),
                ("source_profile", "dev-keys"),
            ]),
        );
        let mut base = profile(&[("mfa_serial", SERIAL)]);
        base.extend(profile(keys));
        profiles.insert("dev-keys".into(), base);
        profiles
    }

    fn hook(dir: &Path, script: &str) -> Hook {
        Hook::new(fake_op(dir, script), dir.join("cache"))
    }

    #[test]
    fn test_without_section_nothing_changes() {
        let dir = tempfile::tempdir().unwrap();
        let hook = hook(dir.path(), "echo 123456");
        let mut profiles = Profiles::new();
        profiles.insert("dev".into(), profile(&[("mfa_serial", SERIAL)]));
        let before = profiles.clone();
        let mut args = invocation("dev");

        hook.pre_get_credentials(&Config::default(), &mut args, &mut profiles);

        assert_eq!(profiles, before);
        assert_eq!(args, invocation("dev"));
        assert!(calls(dir.path()).is_empty());
    }

    #[test]
    fn test_unknown_profile_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let hook = hook(dir.path(), "echo 123456");
        let mut profiles = role_profiles(&[]);
        let before = profiles.clone();
        let mut args = invocation("missing");

        hook.pre_get_credentials(&config(json!("AWS MFA")), &mut args, &mut profiles);

        assert_eq!(profiles, before);
        assert_eq!(args.mfa_token, None);
        assert!(calls(dir.path()).is_empty());
    }

    #[test]
    fn test_placeholder_source_profile() {
        let dir = tempfile::tempdir().unwrap();
        let hook = hook(dir.path(), "exit 1");
        let mut profiles = Profiles::new();
        profiles.insert("solo".into(), profile(&[("region", "eu-west-1")]));

        hook.pre_get_credentials(&config(json!("AWS MFA")), &mut invocation("solo"), &mut profiles);

        assert_eq!(profiles["solo"]["source_profile"], "solo_source_profile");
        assert_eq!(profiles["solo_source_profile"], Profile::new());
    }

    #[test]
    fn test_missing_source_profile_created_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let hook = hook(dir.path(), ITEM_JSON);
        let mut profiles = Profiles::new();
        profiles.insert(
            "dev".into(),
            profile(&[("role_arn", "arn:aws:iam::1:role/dev"), ("source_profile", "dev-keys")]),
        );
        let config = config(json!({ "profiles": { "dev-keys": { "item": "AWS Dev" } } }));

        hook.pre_get_credentials(&config, &mut invocation("dev"), &mut profiles);

        assert_eq!(
            profiles["dev-keys"],
            profile(&[
                ("aws_access_key_id", "AKIAFROMVAULT"),
                ("aws_secret_access_key", "vault-secret"),
            ])
        );
        assert_eq!(calls(dir.path()), vec!["item get AWS Dev --format json"]);
    }

    #[test]
    fn test_unconfigured_missing_source_profile_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let hook = hook(dir.path(), ITEM_JSON);
        let mut profiles = Profiles::new();
        profiles.insert("dev".into(), profile(&[("source_profile", "elsewhere")]));
        let before = profiles.clone();

        hook.pre_get_credentials(&config(json!({ "profiles": "oops" })), &mut invocation("dev"), &mut profiles);

        assert_eq!(profiles, before);
        assert!(calls(dir.path()).is_empty());
    }

    #[test]
    fn test_source_profile_without_item_is_not_created() {
        let dir = tempfile::tempdir().unwrap();
        let hook = hook(dir.path(), ITEM_JSON);
        let mut profiles = Profiles::new();
        profiles.insert("dev".into(), profile(&[("source_profile", "dev-keys")]));
        let before = profiles.clone();

        hook.pre_get_credentials(
            &config(json!({ "profiles": { "dev-keys": {} } })),
            &mut invocation("dev"),
            &mut profiles,
        );

        assert_eq!(profiles, before);
        assert!(!profiles.contains_key("dev-keys"));
        assert!(calls(dir.path()).is_empty());
    }

    #[test]
    fn test_keys_hydrated_from_item_fields() {
        let dir = tempfile::tempdir().unwrap();
        let hook = hook(dir.path(), ITEM_JSON);
        let mut profiles = role_profiles(&[]);
        let config = config(json!({ "profiles": { "dev-keys": { "item": "AWS Dev" } } }));
        let mut args = invocation("dev");

        hook.pre_get_credentials(&config, &mut args, &mut profiles);

        assert_eq!(profiles["dev-keys"]["aws_access_key_id"], "AKIAFROMVAULT");
        assert_eq!(profiles["dev-keys"]["aws_secret_access_key"], "vault-secret");
        // The item-field OTP comes from the same, cached, fetch.
        assert_eq!(args.mfa_token.as_deref(), Some("987654"));
        assert_eq!(calls(dir.path()).len(), 1);
    }

    #[test]
    fn test_present_keys_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let hook = hook(dir.path(), ITEM_JSON);
        let mut profiles = role_profiles(&[
            ("aws_access_key_id", "AKIALOCAL"),
            ("aws_secret_access_key", "local-secret"),
        ]);
        let config = config(json!({ "profiles": { "dev-keys": { "item": "AWS Dev" } } }));
        let mut args = invocation("dev");
        args.mfa_token = Some("000000".into());

        hook.pre_get_credentials(&config, &mut args, &mut profiles);

        assert_eq!(profiles["dev-keys"]["aws_access_key_id"], "AKIALOCAL");
        assert_eq!(args.mfa_token.as_deref(), Some("000000"));
        assert!(calls(dir.path()).is_empty());
    }

    #[test]
    fn test_unmatched_key_left_unset() {
        let dir = tempfile::tempdir().unwrap();
        let hook = hook(
            dir.path(),
            r#"echo '{"fields":[{"label":"access key id","value":"AKIAFROMVAULT"}]}'"#,
        );
        let mut profiles = role_profiles(&[]);
        let config = config(json!({ "profiles": { "dev-keys": { "item": "AWS Dev" } } }));

        hook.pre_get_credentials(&config, &mut invocation("dev"), &mut profiles);

        assert_eq!(profiles["dev-keys"]["aws_access_key_id"], "AKIAFROMVAULT");
        assert!(!profiles["dev-keys"].contains_key("aws_secret_access_key"));
    }

    #[test]
    fn test_direct_otp() {
        let dir = tempfile::tempdir().unwrap();
        let hook = hook(dir.path(), "echo 123456");
        let mut profiles = role_profiles(&[("aws_access_key_id", "AKIALOCAL")]);
        let mut args = invocation("dev");

        hook.pre_get_credentials(&config(json!({ SERIAL: "AWS MFA" })), &mut args, &mut profiles);

        assert_eq!(args.mfa_token.as_deref(), Some("123456"));
        assert_eq!(calls(dir.path()), vec!["item get --otp AWS MFA"]);
    }

    #[test]
    fn test_direct_otp_failure_leaves_token_unset() {
        let dir = tempfile::tempdir().unwrap();
        let hook = hook(dir.path(), "echo 'not signed in' >&2\nexit 1");
        let mut profiles = role_profiles(&[]);
        let mut args = invocation("dev");

        hook.pre_get_credentials(&config(json!("AWS MFA")), &mut args, &mut profiles);

        assert_eq!(args.mfa_token, None);
        assert_eq!(calls(dir.path()).len(), 1);
    }

    #[test]
    fn test_given_token_suppresses_otp() {
        let dir = tempfile::tempdir().unwrap();
        let hook = hook(dir.path(), "echo 123456");
        let mut profiles = role_profiles(&[]);
        let mut args = invocation("dev");
        args.mfa_token = Some("111111".into());

        hook.pre_get_credentials(&config(json!("AWS MFA")), &mut args, &mut profiles);

        assert_eq!(args.mfa_token.as_deref(), Some("111111"));
        assert!(calls(dir.path()).is_empty());
    }

    #[test]
    fn test_valid_cache_session_suppresses_otp_unless_forced() {
        let dir = tempfile::tempdir().unwrap();
        let hook = hook(dir.path(), "echo 123456");
        let mut session = Session {
            access_key_id: Some("ASIASESSION".into()),
            secret_access_key: Some("session-secret".into()),
            session_token: Some("token".into()),
            ..Session::default()
        };
        session.set_expires_at(Utc::now() + TimeDelta::hours(1));
        cache::write(&dir.path().join("cache"), &cache::file_name("AKIALOCAL"), &session).unwrap();
        let config = config(json!("AWS MFA"));

        let mut profiles = role_profiles(&[("aws_access_key_id", "AKIALOCAL")]);
        let mut args = invocation("dev");
        hook.pre_get_credentials(&config, &mut args, &mut profiles);
        assert_eq!(args.mfa_token, None);
        assert!(calls(dir.path()).is_empty());

        args.force_refresh = true;
        hook.pre_get_credentials(&config, &mut args, &mut profiles);
        assert_eq!(args.mfa_token.as_deref(), Some("123456"));
        assert_eq!(calls(dir.path()).len(), 1);
    }

    #[test]
    fn test_expired_cache_session_needs_otp() {
        let dir = tempfile::tempdir().unwrap();
        let hook = hook(dir.path(), "echo 123456");
        let mut session = Session {
            access_key_id: Some("ASIASESSION".into()),
            secret_access_key: Some("session-secret".into()),
            ..Session::default()
        };
        session.set_expires_at(Utc::now() - TimeDelta::hours(1));
        cache::write(&dir.path().join("cache"), &cache::file_name("AKIALOCAL"), &session).unwrap();

        let mut profiles = role_profiles(&[("aws_access_key_id", "AKIALOCAL")]);
        let mut args = invocation("dev");
        hook.pre_get_credentials(&config(json!("AWS MFA")), &mut args, &mut profiles);

        assert_eq!(args.mfa_token.as_deref(), Some("123456"));
    }

    #[test]
    fn test_malformed_item_fetched_once() {
        let dir = tempfile::tempdir().unwrap();
        let hook = hook(dir.path(), "echo '<html>'");
        let mut profiles = role_profiles(&[]);
        let config = config(json!({ "profiles": { "dev-keys": { "item": "AWS Dev" } } }));
        let mut args = invocation("dev");

        hook.pre_get_credentials(&config, &mut args, &mut profiles);

        // Both keys and the OTP ask for the same item.
        assert_eq!(calls(dir.path()).len(), 1);
        assert_eq!(args.mfa_token, None);
        assert!(!profiles["dev-keys"].contains_key("aws_access_key_id"));
    }

    #[test]
    fn test_missing_op_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let hook = Hook::new(OpCli::new(dir.path().join("no-such-op")), dir.path().join("cache"));
        let mut profiles = role_profiles(&[]);
        let config = config(json!({ "profiles": { "dev-keys": { "item": "AWS Dev" } } }));
        let mut args = invocation("dev");

        hook.pre_get_credentials(&config, &mut args, &mut profiles);

        assert_eq!(args.mfa_token, None);
        assert!(!profiles["dev-keys"].contains_key("aws_access_key_id"));
    }

    #[test]
    fn test_cyclical_chain_is_contained() {
        let dir = tempfile::tempdir().unwrap();
        let hook = hook(dir.path(), "echo 123456");
        let mut profiles = Profiles::new();
        profiles.insert("a".into(), profile(&[("source_profile", "b"), ("mfa_serial", SERIAL)]));
        profiles.insert("b".into(), profile(&[("source_profile", "a")]));
        let mut args = invocation("a");

        hook.pre_get_credentials(&config(json!("AWS MFA")), &mut args, &mut profiles);

        assert_eq!(args.mfa_token, None);
        assert!(calls(dir.path()).is_empty());
    }

    #[test]
    fn test_key_conventions() {
        assert_eq!(
            key_conventions("aws_access_key_id"),
            [
                "aws_access_key_id".to_owned(),
                "aws access key id".to_owned(),
                "access_key_id".to_owned(),
                "access key id".to_owned(),
            ]
        );
    }
}
