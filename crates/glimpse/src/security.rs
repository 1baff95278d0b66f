//! Token generation and input validation.
//!
//! Access tokens gate the preview URLs; repository identifiers and git refs
//! are validated before anything reaches a git subprocess or the filesystem.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use subtle::ConstantTimeEq;

/// Entropy of generated access tokens, in bytes.
const TOKEN_BYTES: usize = 32;

/// Recognizable prefix on every access token.
pub const TOKEN_PREFIX: &str = "glp_";

/// Placeholder substituted for credentials in error output.
pub const REDACTED: &str = "[REDACTED]";

/// Generate a URL-safe access token with the `glp_` prefix.
pub fn generate_access_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    format!("{}{}", TOKEN_PREFIX, URL_SAFE_NO_PAD.encode(bytes))
}

/// Validate the shape of an access token.
///
/// Format only; whether the token matches a session is checked against the
/// record store separately.
pub fn validate_access_token(token: &str) -> bool {
    let Some(body) = token.strip_prefix(TOKEN_PREFIX) else {
        return false;
    };
    if body.len() < 20 {
        return false;
    }
    body.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Compare two strings in constant time.
///
/// Length is folded into the comparison so that the timing does not reveal
/// where a mismatch occurs.
pub fn constant_time_compare(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        // Still burn a comparison of equal cost before rejecting.
        let _ = a.ct_eq(a);
        return false;
    }
    a.ct_eq(b).into()
}

/// Validate a repository owner (user or organization name).
///
/// Alphanumerics and single hyphens, no leading/trailing hyphen, max 39.
fn is_valid_owner(s: &str) -> bool {
    if s.is_empty() || s.len() > 39 {
        return false;
    }
    if s.starts_with('-') || s.ends_with('-') || s.contains("--") {
        return false;
    }
    s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// Validate a repository name.
fn is_valid_repo_name(s: &str) -> bool {
    if s.is_empty() || s.len() > 100 || s.starts_with('.') {
        return false;
    }
    s.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

/// Sanitize a repository identifier. Returns `(owner, name)` or `None`.
pub fn sanitize_repo_identifier(owner: &str, name: &str) -> Option<(String, String)> {
    let owner = owner.trim();
    let name = name.trim();
    if !is_valid_owner(owner) || !is_valid_repo_name(name) {
        return None;
    }
    Some((owner.to_string(), name.to_string()))
}

/// Sanitize a git reference (branch, tag, or commit).
///
/// Enforces the subset of git ref rules that matters for passing the ref to
/// a child process: no shell-hostile or ref-invalid characters, no leading
/// `/` or `.`, no trailing `/` or `.lock`, no `//`.
pub fn sanitize_git_ref(r: &str) -> Option<String> {
    let r = r.trim();
    if r.is_empty() || r.len() > 256 {
        return None;
    }
    if r.chars()
        .any(|c| c.is_control() || " ~^:?*[\\".contains(c))
    {
        return None;
    }
    if r.starts_with('/') || r.starts_with('.') {
        return None;
    }
    if r.ends_with('/') || r.ends_with(".lock") {
        return None;
    }
    if r.contains("//") {
        return None;
    }
    Some(r.to_string())
}

/// Check that a session id is safe to use as a path component.
///
/// Only alphanumerics, `-`, and `_` are allowed; this makes the id → path
/// mapping injective and traversal-free.
pub fn is_safe_session_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Replace every occurrence of `secret` in `text` with the redaction marker.
pub fn redact_secret(text: &str, secret: &str) -> String {
    if secret.is_empty() {
        return text.to_string();
    }
    text.replace(secret, REDACTED)
}
