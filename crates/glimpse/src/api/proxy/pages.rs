//! Static HTML pages served while a preview is not proxyable.
//!
//! Status messages come from a fixed table and error pages render no
//! session-supplied text at all, so nothing user-controlled ever reaches
//! the markup.

use crate::session::SessionStatus;

/// Self-refreshing page shown while setup is in progress.
pub fn loading_page(status: SessionStatus) -> String {
    let message = match status {
        SessionStatus::Pending => "Initializing...",
        SessionStatus::Cloning => "Cloning repository...",
        SessionStatus::Installing => "Installing dependencies...",
        SessionStatus::Starting => "Starting dev server...",
        _ => "Setting up...",
    };

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <meta http-equiv="refresh" content="3">
    <title>Loading Preview</title>
    <style>
        * {{ margin: 0; padding: 0; box-sizing: border-box; }}
        body {{
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            background: linear-gradient(135deg, #667eea 0%, #764ba2 100%);
            min-height: 100vh;
            display: flex;
            align-items: center;
            justify-content: center;
            color: white;
        }}
        .container {{ text-align: center; padding: 2rem; }}
        .spinner {{
            width: 60px;
            height: 60px;
            border: 4px solid rgba(255,255,255,0.3);
            border-top-color: white;
            border-radius: 50%;
            animation: spin 1s linear infinite;
            margin: 0 auto 1.5rem;
        }}
        @keyframes spin {{ to {{ transform: rotate(360deg); }} }}
        h1 {{ font-size: 1.5rem; font-weight: 500; margin-bottom: 0.5rem; }}
        p {{ opacity: 0.8; font-size: 0.9rem; }}
    </style>
</head>
<body>
    <div class="container">
        <div class="spinner"></div>
        <h1>Setting up your preview</h1>
        <p>{message}</p>
    </div>
</body>
</html>"#
    )
}

/// Static page for failed or stopped sessions.
pub fn error_page() -> &'static str {
    r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Preview Unavailable</title>
    <style>
        * { margin: 0; padding: 0; box-sizing: border-box; }
        body {
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            background: linear-gradient(135deg, #ff6b6b 0%, #ee5a5a 100%);
            min-height: 100vh;
            display: flex;
            align-items: center;
            justify-content: center;
            color: white;
        }
        .container { text-align: center; padding: 2rem; max-width: 500px; }
        .icon { font-size: 4rem; margin-bottom: 1rem; }
        h1 { font-size: 1.5rem; font-weight: 500; margin-bottom: 0.75rem; }
        p { opacity: 0.9; font-size: 0.95rem; line-height: 1.5; }
    </style>
</head>
<body>
    <div class="container">
        <div class="icon">&#9888;&#65039;</div>
        <h1>Preview Unavailable</h1>
        <p>This preview session is no longer available. Please start a new session.</p>
    </div>
</body>
</html>"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loading_page_carries_refresh_and_status_message() {
        let page = loading_page(SessionStatus::Cloning);
        assert!(page.contains(r#"http-equiv="refresh""#));
        assert!(page.contains("Cloning repository..."));

        let page = loading_page(SessionStatus::Installing);
        assert!(page.contains("Installing dependencies..."));
    }

    #[test]
    fn error_page_is_static() {
        assert!(error_page().contains("Preview Unavailable"));
    }
}
