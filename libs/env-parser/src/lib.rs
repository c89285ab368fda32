//! convenience fns for reading settings from env vars
#![warn(
    missing_debug_implementations,
    missing_docs,
    missing_copy_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
use anyhow::Context;

use std::{env, str};

/// Returns the trimmed value of the environment variable `name`, or `None` if
/// it is unset, not unicode, or blank.
pub fn non_blank_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

/// Parses the environment variable `name` as `T`. Unset or blank vars parse
/// `default` instead.
pub fn parse_var<T, S>(name: &str, default: S) -> Result<T, <T as str::FromStr>::Err>
where
    T: str::FromStr,
    S: ToString,
{
    non_blank_var(name)
        .unwrap_or_else(|| default.to_string())
        .parse::<T>()
}

/// Calls [`parse_var`] but names the environment variable in the error
///
/// [`parse_var`]: crate::parse_var
pub fn parse_var_with_err<T, S>(name: &str, default: S) -> anyhow::Result<T>
where
    T: str::FromStr,
    <T as str::FromStr>::Err: std::error::Error + Send + Sync + 'static,
    S: ToString + Send,
{
    parse_var::<T, S>(name, default).with_context(|| format!("error parsing env var {name}"))
}
