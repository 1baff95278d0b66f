//! HTML rewriting for path-mode previews.
//!
//! Dev servers emit root-relative URLs (`/src/main.tsx`). Behind the
//! `/preview/{id}` prefix those resolve against the public origin and miss
//! the session, so HTML responses get their URL attributes prefixed and a
//! `<base>` element injected as a fallback for truly relative URLs.
//!
//! JavaScript module import specifiers cannot be fixed this way; path mode
//! is best-effort and subdomain mode is the preferred deployment.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

/// `src="/path"`, `href='/path'`, and friends. Whether the match is kept
/// root-relative is decided in the replacement, since `//` and
/// already-prefixed URLs must pass through untouched.
static ATTR_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(src|href|action|data|poster)=(["'])(/[^"']*)"#)
        .expect("attribute URL pattern compiles")
});

/// `srcset="..."` attribute bodies; individual URL tokens are rewritten
/// inside the replacement.
static SRCSET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\bsrcset=(["'])([^"']+)"#).expect("srcset pattern compiles"));

/// URL tokens inside a srcset value, with their optional descriptor.
static SRCSET_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(/[^\s,]+)(\s+[^,]*)?").expect("srcset URL pattern compiles"));

static BASE_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<base\s+[^>]*>").expect("base tag pattern compiles"));

static HEAD_OPEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<head[^>]*>").expect("head pattern compiles"));

static HTML_OPEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<html[^>]*>").expect("html pattern compiles"));

/// Rewrite root-relative URLs in an HTML document to carry the preview
/// prefix, and inject a `<base>` element when none is present.
pub fn rewrite_html(html: &str, prefix: &str, session_id: &str) -> String {
    let base_path = format!("{}/{}", prefix, session_id);
    let skip_prefix = format!("{}/", prefix);

    let rewritten = ATTR_URL.replace_all(html, |caps: &Captures| {
        let attr = &caps[1];
        let quote = &caps[2];
        let path = &caps[3];

        // Protocol-relative and already-prefixed URLs stay as they are.
        if path.starts_with("//") || path.starts_with(&skip_prefix) {
            return caps[0].to_string();
        }
        format!("{}={}{}{}", attr, quote, base_path, path)
    });

    let rewritten = SRCSET.replace_all(&rewritten, |caps: &Captures| {
        let quote = &caps[1];
        let value = SRCSET_URL.replace_all(&caps[2], |url_caps: &Captures| {
            let path = &url_caps[1];
            let descriptor = url_caps.get(2).map_or("", |m| m.as_str());
            if path.starts_with("//") || path.starts_with(&skip_prefix) {
                return url_caps[0].to_string();
            }
            format!("{}{}{}", base_path, path, descriptor)
        });
        format!("srcset={}{}", quote, value)
    });

    inject_base_tag(&rewritten, &base_path)
}

/// Insert `<base href="{base_path}/">` into `<head>` unless the document
/// already carries a base element.
fn inject_base_tag(html: &str, base_path: &str) -> String {
    if BASE_TAG.is_match(html) {
        return html.to_string();
    }

    let base_tag = format!(r#"<base href="{}/">"#, base_path);

    if let Some(m) = HEAD_OPEN.find(html) {
        let mut out = String::with_capacity(html.len() + base_tag.len() + 8);
        out.push_str(&html[..m.end()]);
        out.push_str("\n    ");
        out.push_str(&base_tag);
        out.push_str(&html[m.end()..]);
        return out;
    }

    if let Some(m) = HTML_OPEN.find(html) {
        let mut out = String::with_capacity(html.len() + base_tag.len() + 24);
        out.push_str(&html[..m.end()]);
        out.push_str("\n<head>\n    ");
        out.push_str(&base_tag);
        out.push_str("\n</head>");
        out.push_str(&html[m.end()..]);
        return out;
    }

    format!("{}\n{}", base_tag, html)
}
