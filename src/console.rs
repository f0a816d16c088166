//! User-facing console output.
//!
//! Everything goes to stderr so stdout stays free for the shell exports.
//! Write failures are ignored: a broken terminal must not abort credential
//! resolution.

use std::io::{self, Write};

use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

fn write_colored<W: WriteColor>(out: &mut W, message: &str, color: Color) -> io::Result<()> {
    out.set_color(ColorSpec::new().set_fg(Some(color)))?;
    writeln!(out, "{message}")?;
    out.reset()
}

/// Informational message, in cyan, on any colour-capable writer.
pub fn say_to<W: WriteColor>(out: &mut W, message: &str) -> io::Result<()> {
    write_colored(out, message, Color::Cyan)
}

/// Informational message, in cyan.
pub fn say(message: &str) {
    let _ = say_to(&mut StandardStream::stderr(ColorChoice::Auto), message);
}

/// Failure message, in red.
pub fn alert(message: &str) {
    let _ = write_colored(&mut StandardStream::stderr(ColorChoice::Auto), message, Color::Red);
}
