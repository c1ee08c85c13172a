//! Typed accessors over a parsed [`clap`] flag set.
//!
//! Every `get_*` function returns a [`FlagError`] when the flag is unknown, holds a value of
//! another type, or has no value. The matching `must_get_*` function hands that error to
//! [`fatal`](crate::fatal::fatal) instead: asking for a flag under the wrong name or type is a
//! programmer error, not something to recover from at runtime.
//!
//! ```
//! use clap::{Arg, ArgAction};
//! use trillium_x::flags;
//!
//! let matches = flags::new_flag_set("serve")
//!     .arg(Arg::new("dev").long("dev").action(ArgAction::SetTrue))
//!     .arg(Arg::new("timeout").long("timeout").value_parser(flags::parse_duration))
//!     .try_get_matches_from(["--dev", "--timeout", "1m30s"])
//!     .unwrap();
//!
//! assert!(flags::must_get_bool(&matches, "dev"));
//! assert_eq!(
//!     flags::must_get_duration(&matches, "timeout"),
//!     std::time::Duration::from_secs(90)
//! );
//! ```

use crate::fatal::fatal;
use clap::{
    builder::Str,
    parser::MatchesError,
    ArgMatches, Command,
};
use std::{any::Any, time::Duration};

/// Why a flag could not be read.
#[derive(Debug, thiserror::Error)]
pub enum FlagError {
    /// the flag is not defined, or was defined with another value type
    #[error("unable to read flag {name}: {source}")]
    Lookup {
        /// the requested flag
        name: String,
        /// clap's reason
        #[source]
        source: MatchesError,
    },

    /// the flag is defined but neither given nor defaulted
    #[error("flag {0} has no value")]
    Missing(String),
}

/// Constructs an empty flag set.
///
/// The returned command parses a plain argument list (no binary name in front), and its
/// `try_get_matches_from` reports parse errors to the caller rather than exiting.
pub fn new_flag_set(name: impl Into<Str>) -> Command {
    Command::new(name).no_binary_name(true)
}

/// A clap value parser for duration flags such as `1h30m` or `250ms`.
pub fn parse_duration(value: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(value)
}

fn get_one<T>(matches: &ArgMatches, name: &str) -> Result<T, FlagError>
where
    T: Any + Clone + Send + Sync + 'static,
{
    matches
        .try_get_one::<T>(name)
        .map_err(|source| FlagError::Lookup {
            name: name.to_string(),
            source,
        })?
        .cloned()
        .ok_or_else(|| FlagError::Missing(name.to_string()))
}

/// Reads a boolean flag.
pub fn get_bool(matches: &ArgMatches, name: &str) -> Result<bool, FlagError> {
    get_one(matches, name)
}

/// Reads a string flag.
pub fn get_string(matches: &ArgMatches, name: &str) -> Result<String, FlagError> {
    get_one(matches, name)
}

/// Reads a duration flag parsed with [`parse_duration`].
pub fn get_duration(matches: &ArgMatches, name: &str) -> Result<Duration, FlagError> {
    get_one(matches, name)
}

/// Reads every value of a string list flag. A defined flag that was not given yields an empty
/// list.
pub fn get_string_slice(matches: &ArgMatches, name: &str) -> Result<Vec<String>, FlagError> {
    let values = matches
        .try_get_many::<String>(name)
        .map_err(|source| FlagError::Lookup {
            name: name.to_string(),
            source,
        })?;

    Ok(values.into_iter().flatten().cloned().collect())
}

/// Reads a signed integer flag.
pub fn get_int(matches: &ArgMatches, name: &str) -> Result<i64, FlagError> {
    get_one(matches, name)
}

/// Reads a `u8` flag.
pub fn get_u8(matches: &ArgMatches, name: &str) -> Result<u8, FlagError> {
    get_one(matches, name)
}

/// Reads a `u32` flag.
pub fn get_u32(matches: &ArgMatches, name: &str) -> Result<u32, FlagError> {
    get_one(matches, name)
}

fn must<T>(result: Result<T, FlagError>) -> T {
    result.unwrap_or_else(|error| fatal(error))
}

/// Returns a boolean flag or fatals.
pub fn must_get_bool(matches: &ArgMatches, name: &str) -> bool {
    must(get_bool(matches, name))
}

/// Returns a string flag or fatals.
pub fn must_get_string(matches: &ArgMatches, name: &str) -> String {
    must(get_string(matches, name))
}

/// Returns a duration flag or fatals.
pub fn must_get_duration(matches: &ArgMatches, name: &str) -> Duration {
    must(get_duration(matches, name))
}

/// Returns a string list flag or fatals.
pub fn must_get_string_slice(matches: &ArgMatches, name: &str) -> Vec<String> {
    must(get_string_slice(matches, name))
}

/// Returns a signed integer flag or fatals.
pub fn must_get_int(matches: &ArgMatches, name: &str) -> i64 {
    must(get_int(matches, name))
}

/// Returns a `u8` flag or fatals.
pub fn must_get_u8(matches: &ArgMatches, name: &str) -> u8 {
    must(get_u8(matches, name))
}

/// Returns a `u32` flag or fatals.
pub fn must_get_u32(matches: &ArgMatches, name: &str) -> u32 {
    must(get_u32(matches, name))
}
