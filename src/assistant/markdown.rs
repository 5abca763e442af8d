//! Minimal markdown → HTML for reply bodies.
//!
//! Line-oriented: list items, headings, blank lines and
//! paragraphs, plus bold/italic/code inline. Anything else (tables, links,
//! nested lists, quotes) comes out as escaped paragraph text.

use std::sync::LazyLock;

use regex::Regex;

static LIST_ITEM: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*-\s+").unwrap());
static HEADING: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(#{1,6})\s").unwrap());
static HEADING_PREFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^#{1,6}\s*").unwrap());
static BOLD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*\*([^*]+)\*\*").unwrap());
static ITALIC: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*([^*]+)\*").unwrap());
static CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"`([^`]+)`").unwrap());

const STYLE: &str = "body{font-family:-apple-system,BlinkMacSystemFont,Segoe UI,Roboto,Helvetica,Arial,sans-serif;line-height:1.6;color:#222} \
h1,h2,h3{margin:0.6em 0} p{margin:0.5em 0} ul{padding-left:1.2em} \
code{background:#f5f5f7;padding:0 3px;border-radius:3px}";

/// Render markdown into a complete, self-contained HTML document.
pub fn render_document(markdown: &str) -> String {
    let normalized = markdown.replace("\r\n", "\n").replace('\r', "\n");
    let mut out: Vec<String> = Vec::new();
    let mut in_list = false;

    for line in normalized.split('\n') {
        if let Some(m) = LIST_ITEM.find(line) {
            if !in_list {
                out.push("<ul>".to_string());
                in_list = true;
            }
            out.push(format!("<li>{}</li>", inline(&line[m.end()..])));
            continue;
        }
        if in_list {
            out.push("</ul>".to_string());
            in_list = false;
        }

        if let Some(caps) = HEADING.captures(line) {
            let level = caps[1].len();
            let text = HEADING_PREFIX.replace(line, "");
            out.push(format!("<h{level}>{}</h{level}>", inline(&text)));
            continue;
        }

        if line.trim().is_empty() {
            out.push(String::new());
            continue;
        }

        out.push(format!("<p>{}</p>", inline(line)));
    }
    if in_list {
        out.push("</ul>".to_string());
    }

    format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\">\
         <meta name=\"viewport\" content=\"width=device-width,initial-scale=1\">\
         <style>{STYLE}</style></head><body>{}</body></html>",
        out.join("\n")
    )
}

/// Escape, then bold, italic, code. Order matters: escaping first keeps the
/// generated tags intact.
fn inline(text: &str) -> String {
    let escaped = escape_html(text);
    let bold = BOLD.replace_all(&escaped, "<strong>$1</strong>");
    let italic = ITALIC.replace_all(&bold, "<em>$1</em>");
    CODE.replace_all(&italic, "<code>$1</code>").into_owned()
}

/// Escape the five HTML-significant characters.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}
