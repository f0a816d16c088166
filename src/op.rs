//! 1Password CLI (`op`) integration.
//!
//! Two invocations are used:
//! - `op item get --otp <title>` prints the current one-time password.
//! - `op item get <title> --format json` prints the whole item.
//!
//! Authentication is left entirely to `op` itself.

use std::{
    collections::HashMap,
    ffi::OsString,
    io::{self, BufRead, BufReader, Read},
    path::PathBuf,
    process::{Command, ExitStatus, Stdio},
};

use log::{debug, error};
use serde::Deserialize;
use termcolor::{ColorChoice, StandardStream, WriteColor};

use crate::console;

/// Number of `op` diagnostic lines echoed to the console; the rest go to the log.
pub const MAX_OUTPUT_LINES: usize = 2;

/// Label of the OTP field in a 1Password login item.
pub const OTP_LABEL: &str = "one-time password";

#[derive(Debug, thiserror::Error)]
pub enum OpError {
    #[error("missing `{0}` command")]
    NotFound(String),

    #[error("failed to run op: {0}")]
    Io(#[from] io::Error),

    #[error("op exited with {0}")]
    Failed(ExitStatus),

    #[error("op command output is not in JSON format: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// A vault item as printed by `op item get --format json`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Item {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub fields: Vec<Field>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Field {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub totp: Option<String>,
}

impl Item {
    /// First field whose label is one of `labels`.
    pub fn field(&self, labels: &[&str]) -> Option<&Field> {
        self.fields.iter().find(|field| {
            field
                .label
                .as_deref()
                .is_some_and(|label| labels.contains(&label))
        })
    }
}

/// Shortens an `op` error line before it is shown to the user.
fn beautify(line: &str) -> &str {
    let line = if line.starts_with("[ERROR]") {
        // "[ERROR] 2023/02/04 16:29:52"
        line.get(28..).unwrap_or_default()
    } else if let Some(rest) = line.strip_prefix("error initializing client:") {
        rest
    } else {
        line
    };
    line.trim()
}

/// Copies `op` diagnostics from `reader` to `out`.
///
/// Only the first [`MAX_OUTPUT_LINES`] non-empty lines, shortened by
/// [`beautify`] and prefixed with `1Password: `, reach `out`; everything
/// else goes to the debug log.
///
/// # Returns
/// * `Ok(usize)` - Number of lines written to `out`
///
/// # Errors
/// Fails when `reader` cannot be read. Write errors on `out` are ignored.
fn proxy_diagnostics<R: BufRead, W: WriteColor>(reader: R, out: &mut W) -> io::Result<usize> {
    let mut shown = 0;
    for line in reader.split(b'\n') {
        let line = line?;
        let line = String::from_utf8_lossy(&line);
        let msg = beautify(&line);
        if shown < MAX_OUTPUT_LINES && !msg.is_empty() {
            let _ = console::say_to(out, &format!("1Password: {msg}"));
            shown += 1;
        } else {
            debug!("{}", line.trim_end());
        }
    }
    Ok(shown)
}

/// Client that shells out to the `op` binary.
#[derive(Debug, Clone)]
pub struct OpCli {
    program: PathBuf,
    leading_args: Vec<OsString>,
}

impl Default for OpCli {
    fn default() -> Self {
        Self::new("op")
    }
}

impl OpCli {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    /// Adds an argument placed before every `op` subcommand.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.leading_args.push(arg.into());
        self
    }

    /// Selects the 1Password account used for every call.
    pub fn account(self, account: &str) -> Self {
        self.arg("--account").arg(account)
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.leading_args)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }

    fn spawn_error(&self, e: io::Error) -> OpError {
        if e.kind() == io::ErrorKind::NotFound {
            OpError::NotFound(self.program.display().to_string())
        } else {
            OpError::Io(e)
        }
    }

    /// Fetches the current one-time password for a vault item.
    ///
    /// Runs `op item get --otp <title>`, proxying its diagnostics to the
    /// console (see [`proxy_diagnostics`]) while it runs.
    ///
    /// # Arguments
    /// * `title` - Title of the vault item holding the TOTP secret
    ///
    /// # Returns
    /// * `Some(String)` - First line of `op`'s output, without the newline
    /// * `None` - `op` is missing, exited non-zero or printed nothing
    ///
    /// Every failure is logged rather than returned: a missing token only
    /// means the credential exchange will ask for one.
    pub fn otp(&self, title: &str) -> Option<String> {
        match self.try_otp(title) {
            Ok(token) => token,
            Err(e @ OpError::NotFound(_)) => {
                error!("Failed: {e}");
                None
            }
            Err(e) => {
                debug!("No OTP for {title}: {e}");
                None
            }
        }
    }

    fn try_otp(&self, title: &str) -> Result<Option<String>, OpError> {
        let mut child = self
            .command(&["item", "get", "--otp", title])
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        // Reap the child even when its stderr cannot be read.
        let proxied = match child.stderr.take() {
            Some(stderr) => {
                let mut terminal = StandardStream::stderr(ColorChoice::Auto);
                proxy_diagnostics(BufReader::new(stderr), &mut terminal).map(drop)
            }
            None => Ok(()),
        };
        let status = child.wait();
        proxied?;
        let status = status?;
        if !status.success() {
            return Err(OpError::Failed(status));
        }

        let mut stdout = String::new();
        if let Some(mut out) = child.stdout.take() {
            out.read_to_string(&mut stdout)?;
        }
        Ok(stdout
            .lines()
            .next()
            .map(str::to_owned)
            .filter(|token| !token.is_empty()))
    }

    /// Fetches a whole vault item with `op item get <title> --format json`.
    ///
    /// The exit status is not checked: whatever `op` printed must parse as an
    /// item, so a failed call surfaces as [`OpError::Malformed`].
    ///
    /// # Errors
    /// * [`OpError::NotFound`] - the `op` program is not installed
    /// * [`OpError::Io`] - the process could not be run
    /// * [`OpError::Malformed`] - the output is not an item in JSON
    pub fn item(&self, title: &str) -> Result<Item, OpError> {
        let output = self
            .command(&["item", "get", title, "--format", "json"])
            .output()
            .map_err(|e| self.spawn_error(e))?;

        if !output.stderr.is_empty() {
            debug!("op: {}", String::from_utf8_lossy(&output.stderr).trim_end());
        }
        Ok(serde_json::from_slice(&output.stdout)?)
    }
}

#[derive(Debug)]
enum Cached {
    Fetched(Item),
    Malformed,
}

/// Vault items fetched during one hook invocation, keyed by title.
///
/// Items whose output could not be parsed are remembered as failures and
/// never requested again.
#[derive(Debug)]
pub struct ItemCache<'a> {
    op: &'a OpCli,
    items: HashMap<String, Cached>,
}

impl<'a> ItemCache<'a> {
    pub fn new(op: &'a OpCli) -> Self {
        Self {
            op,
            items: HashMap::new(),
        }
    }

    pub fn get(&mut self, title: &str) -> Option<&Item> {
        if !self.items.contains_key(title) {
            let cached = match self.op.item(title) {
                Ok(item) => Cached::Fetched(item),
                Err(e @ OpError::Malformed(_)) => {
                    error!("{e}");
                    Cached::Malformed
                }
                Err(e) => {
                    error!("Failed: {e}");
                    return None;
                }
            };
            self.items.insert(title.to_owned(), cached);
        }

        match self.items.get(title)? {
            Cached::Fetched(item) => Some(item),
            Cached::Malformed => None,
        }
    }
}
