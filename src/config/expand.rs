// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 U.S. Federal Government (in countries where recognized)

//! Variable expansion for configuration values.
//!
//! Strings and paths in the configuration may reference `${NAME}`. A few
//! names are resolved even when the environment does not define them:
//!
//! - `${HOSTNAME}` - full host name
//! - `${SHORT_HOSTNAME}` - host name up to the first dot
//! - `${DOMAIN}` - DNS domain taken from the host name
//! - `${USER}` - current user
//! - `${HOME}` - home directory
//!
//! Any other name is looked up in the environment. Unknown variables are
//! left unchanged so validation can point at them.

use crate::error::Result;

/// Expand `${VAR}` references in `input`.
///
/// # Examples
///
/// ```
/// use usg_cert_agent::config::expand_variables;
///
/// let result = expand_variables("${HOSTNAME}.example.com").unwrap();
/// assert!(result.ends_with(".example.com"));
/// ```
pub fn expand_variables(input: &str) -> Result<String> {
    let mut result = input.to_string();
    let mut start = 0;

    while let Some(var_start) = result[start..].find("${") {
        let absolute_start = start + var_start;

        let Some(var_end) = result[absolute_start..].find('}') else {
            break;
        };
        let absolute_end = absolute_start + var_end;
        let var_name = &result[absolute_start + 2..absolute_end];

        match variable_value(var_name) {
            Some(value) => {
                result.replace_range(absolute_start..=absolute_end, &value);
                start = absolute_start + value.len();
            }
            None => start = absolute_end + 1,
        }
    }

    Ok(result)
}

/// Whether `input` still holds an unexpanded `${...}` reference.
pub fn has_unexpanded(input: &str) -> bool {
    input
        .find("${")
        .is_some_and(|pos| input[pos..].contains('}'))
}

fn variable_value(name: &str) -> Option<String> {
    match name {
        "HOSTNAME" => std::env::var("HOSTNAME").ok().or_else(host_name),
        "SHORT_HOSTNAME" => host_name().map(|h| h.split('.').next().unwrap_or(&h).to_string()),
        "DOMAIN" => domain(),
        "USER" => std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .ok(),
        "HOME" => dirs::home_dir().map(|p| p.to_string_lossy().into_owned()),
        _ => std::env::var(name).ok(),
    }
}

fn host_name() -> Option<String> {
    hostname::get().ok().and_then(|h| h.into_string().ok())
}

fn domain() -> Option<String> {
    let fqdn = host_name()?;
    let dot = fqdn.find('.')?;
    Some(fqdn[dot + 1..].to_string())
}
