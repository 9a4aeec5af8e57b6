//! Front matter key/value parsing.
//!
//! A front matter block is a sequence of `key: value` entries. A value runs
//! until the next line that starts with a key, so values may span lines:
//!
//! ```text
//! title: Hello
//! tags: ["a", "b"]
//! summary: A longer text
//!   continued here
//! ```

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Number, Value};
use thiserror::Error;

use crate::template::parse_literal;

pub type FrontMatter = Map<String, Value>;

static KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^([A-Za-z0-9_.\-$]+):").expect("valid key regex"));

#[derive(Debug, Error)]
pub enum FrontMatterError {
    #[error("invalid front matter value for key {key}: {message}")]
    Syntax { key: String, message: String },
}

/// Parse the text between the `---` delimiters of a page header.
pub fn parse_front_matter(source: &str) -> Result<FrontMatter, FrontMatterError> {
    let mut fm = FrontMatter::new();
    let keys: Vec<_> = KEY.captures_iter(source).collect();

    for (i, caps) in keys.iter().enumerate() {
        let (Some(whole), Some(key)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let end = match keys.get(i + 1).and_then(|next| next.get(0)) {
            Some(next) => next.start(),
            None => source.len(),
        };
        let raw = source[whole.end()..end].trim();
        fm.insert(key.as_str().to_string(), interpret(key.as_str(), raw)?);
    }

    Ok(fm)
}

fn interpret(key: &str, raw: &str) -> Result<Value, FrontMatterError> {
    if raw.starts_with(['"', '\'', '[', '{']) {
        return parse_literal(raw).map_err(|err| FrontMatterError::Syntax {
            key: key.to_string(),
            message: err.message,
        });
    }
    Ok(parse_number(raw).unwrap_or_else(|| Value::String(raw.to_string())))
}

fn parse_number(raw: &str) -> Option<Value> {
    if raw.is_empty() {
        return None;
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Some(Value::from(i));
    }
    let f = raw.parse::<f64>().ok().filter(|f| f.is_finite())?;
    Number::from_f64(f).map(Value::Number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_simple_values() {
        let fm = parse_front_matter("title: Hello\ncount: 3").unwrap();
        assert_eq!(Value::Object(fm), json!({"title": "Hello", "count": 3}));
    }

    #[test]
    fn test_empty_input() {
        assert!(parse_front_matter("").unwrap().is_empty());
    }

    #[test]
    fn test_structured_values() {
        let fm = parse_front_matter(
            "tags: ['a', \"b\",]\nauthor: { name: 'Ann', age: 40 }\nquote: 'hi'",
        )
        .unwrap();
        assert_eq!(fm["tags"], json!(["a", "b"]));
        assert_eq!(fm["author"], json!({"name": "Ann", "age": 40}));
        assert_eq!(fm["quote"], json!("hi"));
    }

    #[test]
    fn test_multiline_and_empty_values() {
        let fm = parse_front_matter("summary: one\n  two\nlayout:\ndraft: yes").unwrap();
        assert_eq!(fm["summary"], json!("one\n  two"));
        assert_eq!(fm["layout"], json!(""));
        assert_eq!(fm["draft"], json!("yes"));
    }

    #[test]
    fn test_numbers() {
        let fm = parse_front_matter("a: 1.5\nb: -2\nc: 1e3\nd: 12abc\ne: inf").unwrap();
        assert_eq!(fm["a"], json!(1.5));
        assert_eq!(fm["b"], json!(-2));
        assert_eq!(fm["c"], json!(1000.0));
        assert_eq!(fm["d"], json!("12abc"));
        assert_eq!(fm["e"], json!("inf"));
    }

    #[test]
    fn test_later_duplicate_wins() {
        let fm = parse_front_matter("title: one\ntitle: two").unwrap();
        assert_eq!(fm["title"], json!("two"));
    }

    #[test]
    fn test_key_characters() {
        let fm = parse_front_matter("og.title: x\n$ref-id_2: y").unwrap();
        assert_eq!(fm["og.title"], json!("x"));
        assert_eq!(fm["$ref-id_2"], json!("y"));
    }

    #[test]
    fn test_invalid_structured_value_names_key() {
        let err = parse_front_matter("title: ok\ntags: [1, 2").unwrap_err();
        let FrontMatterError::Syntax { key, .. } = &err;
        assert_eq!(key, "tags");
        assert!(err.to_string().contains("tags"));
    }

    #[test]
    fn test_code_is_not_evaluated() {
        assert!(parse_front_matter("x: [process.exit(1)]").is_err());
    }
}
