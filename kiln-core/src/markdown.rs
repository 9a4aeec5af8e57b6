use std::sync::LazyLock;

use pulldown_cmark::{CodeBlockKind, Event, Options, Parser, Tag, TagEnd, html};
use syntect::highlighting::ThemeSet;
use syntect::html::highlighted_html_for_string;
use syntect::parsing::SyntaxSet;

// Loading these is slow; do it once
static SYNTAX_SET: LazyLock<SyntaxSet> = LazyLock::new(SyntaxSet::load_defaults_newlines);
static THEME_SET: LazyLock<ThemeSet> = LazyLock::new(ThemeSet::load_defaults);

pub const DEFAULT_SYNTAX_THEME: &str = "base16-ocean.dark";

/// Convert markdown to HTML. Fenced code blocks with a known language are
/// highlighted with the syntect theme `theme`.
pub fn markdown_to_html(source: &str, theme: &str) -> String {
    let mut events = Vec::new();
    let mut code: Option<(String, String)> = None;

    for event in Parser::new_ext(source, Options::all()) {
        match event {
            Event::Start(Tag::CodeBlock(CodeBlockKind::Fenced(lang))) if code.is_none() => {
                code = Some((lang.to_string(), String::new()));
            }
            Event::Text(t) if code.is_some() => {
                if let Some((_, text)) = code.as_mut() {
                    text.push_str(&t);
                }
            }
            Event::End(TagEnd::CodeBlock) if code.is_some() => {
                if let Some((lang, text)) = code.take() {
                    events.push(Event::Html(highlight(&text, &lang, theme).into()));
                }
            }
            _ if code.is_some() => {}
            event => events.push(event),
        }
    }

    let mut out = String::new();
    html::push_html(&mut out, events.into_iter());
    out
}

fn highlight(code: &str, lang: &str, theme: &str) -> String {
    let syntax = SYNTAX_SET.find_syntax_by_token(lang).or_else(|| match lang {
        // Close enough
        "toml" => SYNTAX_SET.find_syntax_by_name("YAML"),
        _ => None,
    });

    syntax
        .zip(THEME_SET.themes.get(theme))
        .and_then(|(syntax, theme)| {
            highlighted_html_for_string(code, &SYNTAX_SET, syntax, theme).ok()
        })
        .unwrap_or_else(|| format!("<pre><code>{}</code></pre>", html_escape::encode_text(code)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_markdown() {
        let html = markdown_to_html("# Hello\n\nSome *text*.", DEFAULT_SYNTAX_THEME);
        assert!(html.contains("<h1>Hello</h1>"));
        assert!(html.contains("<em>text</em>"));
    }

    #[test]
    fn test_highlighted_code_block() {
        let html = markdown_to_html("```rust\nfn main() {}\n```\n", DEFAULT_SYNTAX_THEME);
        assert!(html.contains("<pre style="), "{html}");
        assert!(!html.contains("```"));
    }

    #[test]
    fn test_unknown_language_is_escaped() {
        let html = markdown_to_html("```nosuchlang\n<a> & b\n```\n", DEFAULT_SYNTAX_THEME);
        assert!(html.contains("<pre><code>&lt;a&gt; &amp; b\n</code></pre>"), "{html}");
    }

    #[test]
    fn test_unknown_theme_falls_back() {
        let html = markdown_to_html("```rust\nlet x = 1;\n```\n", "no-such-theme");
        assert!(html.contains("<pre><code>let x = 1;\n</code></pre>"), "{html}");
    }
}
