//! Parses the query parameters recognized on initial navigation, per §6. The host
//! environment (the page's `location.search`) is out of scope for this crate; callers
//! hand in the raw query string however their platform surfaces it.

use std::collections::HashMap;

const OAUTH_CODE_MIN_LEN: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigationAction {
    ActivateDemoMode,
    StartSpotifyOAuth,
    CompleteOAuth { code: String },
    OAuthCancelled,
    /// A `mode` value other than `demo`/`spotify`; logged by the caller and stripped.
    UnrecognizedMode { mode: String },
}

/// A valid OAuth `code` matches `^[A-Za-z0-9_-]{10,}$`.
fn is_valid_oauth_code(code: &str) -> bool {
    code.len() >= OAUTH_CODE_MIN_LEN
        && code.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Parses a query string (without the leading `?`) into recognized actions. Query
/// parameters are always considered "handled" by the caller afterward; stripping the
/// URL bar is a host-environment concern this function does not perform.
pub fn parse_query_params(query: &str) -> Vec<NavigationAction> {
    let params = decode_params(query);
    let mut actions = Vec::new();

    if let Some(mode) = params.get("mode") {
        match mode.as_str() {
            "demo" => actions.push(NavigationAction::ActivateDemoMode),
            "spotify" => actions.push(NavigationAction::StartSpotifyOAuth),
            other => actions.push(NavigationAction::UnrecognizedMode { mode: other.to_string() }),
        }
    }

    if let Some(code) = params.get("code") {
        if is_valid_oauth_code(code) {
            actions.push(NavigationAction::CompleteOAuth { code: code.clone() });
        } else {
            log::warn!("discarding malformed oauth code parameter");
        }
    }

    if params.contains_key("error") {
        actions.push(NavigationAction::OAuthCancelled);
    }

    actions
}

fn decode_params(query: &str) -> HashMap<String, String> {
    query
        .trim_start_matches('?')
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?;
            let value = parts.next().unwrap_or("");
            Some((percent_decode(key), percent_decode(value)))
        })
        .collect()
}

/// Minimal percent-decoding (`%XX` and `+` as space) sufficient for the small parameter
/// set this crate cares about; not a general-purpose URL library.
fn percent_decode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars();
    while let Some(c) = chars.next() {
        match c {
            '+' => out.push(' '),
            '%' => {
                let hi = chars.next();
                let lo = chars.next();
                match (hi.and_then(|c| c.to_digit(16)), lo.and_then(|c| c.to_digit(16))) {
                    (Some(hi), Some(lo)) => out.push(((hi << 4) | lo) as u8 as char),
                    _ => out.push('%'),
                }
            }
            other => out.push(other),
        }
    }
    out
}
