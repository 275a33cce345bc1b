//! The static document shown in place of a blocked site.

const TEMPLATE_HEAD: &str = r#"<!doctype html>
<html>
  <head>
    <meta charset="utf-8">
    <title>Site Blocked - FocusFlow</title>
    <style>
      body {
        font-family: system-ui, -apple-system, sans-serif;
        display: flex;
        align-items: center;
        justify-content: center;
        min-height: 100vh;
        margin: 0;
        background: linear-gradient(135deg, #667eea 0%, #764ba2 100%);
        color: white;
      }
      .container {
        text-align: center;
        padding: 3rem;
        background: rgba(0, 0, 0, 0.2);
        border-radius: 12px;
        max-width: 500px;
      }
      .domain {
        background: rgba(255, 255, 255, 0.2);
        padding: 0.5rem 1rem;
        border-radius: 6px;
        margin-top: 1.5rem;
        font-family: monospace;
        word-break: break-all;
      }
    </style>
  </head>
  <body>
    <div class="container">
      <h2>Site Blocked</h2>
      <p>This website is currently blocked by FocusFlow.</p>
      <p>Stay focused and keep working on your goals!</p>
      <div class="domain" id="blocked-domain">"#;

const TEMPLATE_TAIL: &str = r#"</div>
    </div>
  </body>
</html>
"#;

/// Render the blocked page for `domain`. The domain is HTML-escaped.
pub fn render(domain: &str) -> String {
    let mut html = String::with_capacity(TEMPLATE_HEAD.len() + TEMPLATE_TAIL.len() + domain.len() + 16);
    html.push_str(TEMPLATE_HEAD);
    push_escaped(&mut html, domain);
    html.push_str(TEMPLATE_TAIL);
    html
}

/// URL of the packaged blocked page for a pre-navigation redirect.
pub fn redirect_url(base: &str, domain: &str) -> String {
    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{base}{separator}domain={}", encode_component(domain))
}

fn push_escaped(out: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
}

fn encode_component(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for b in text.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}
