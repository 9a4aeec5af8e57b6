//! Tokenizer for the code inside `<? ... ?>` spans.
//!
//! The same tokenizer backs the relaxed-JSON reader used for front matter
//! values, which is why it knows about single-quoted strings, hex numbers and
//! comments.

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Ident(String),
    Number(f64),
    Str(String),

    Let,
    If,
    Else,
    For,
    In,
    True,
    False,
    Null,

    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Semi,
    Dot,
    Question,
    Assign,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    AndAnd,
    OrOr,

    // Structural tokens inserted between code spans by the compiler.
    Text(String),
    Echo,
    SpanEnd,
    Eof,
}

impl Tok {
    pub fn describe(&self) -> String {
        match self {
            Tok::Ident(name) => format!("identifier `{name}`"),
            Tok::Number(n) => format!("number {n}"),
            Tok::Str(_) => "string".to_string(),
            Tok::Text(_) => "template text".to_string(),
            Tok::Echo => "`<?=`".to_string(),
            Tok::SpanEnd => "`?>`".to_string(),
            Tok::Eof => "end of template".to_string(),
            other => format!("`{}`", other.symbol()),
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            Tok::Let => "let",
            Tok::If => "if",
            Tok::Else => "else",
            Tok::For => "for",
            Tok::In => "in",
            Tok::True => "true",
            Tok::False => "false",
            Tok::Null => "null",
            Tok::LParen => "(",
            Tok::RParen => ")",
            Tok::LBracket => "[",
            Tok::RBracket => "]",
            Tok::LBrace => "{",
            Tok::RBrace => "}",
            Tok::Comma => ",",
            Tok::Colon => ":",
            Tok::Semi => ";",
            Tok::Dot => ".",
            Tok::Question => "?",
            Tok::Assign => "=",
            Tok::Eq => "==",
            Tok::Ne => "!=",
            Tok::Lt => "<",
            Tok::Le => "<=",
            Tok::Gt => ">",
            Tok::Ge => ">=",
            Tok::Plus => "+",
            Tok::Minus => "-",
            Tok::Star => "*",
            Tok::Slash => "/",
            Tok::Percent => "%",
            Tok::Bang => "!",
            Tok::AndAnd => "&&",
            Tok::OrOr => "||",
            _ => "?",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    /// Byte offset in the template source.
    pub pos: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub pos: usize,
    pub message: String,
}

/// Tokenize `src`, which starts at byte `base` of the enclosing source.
pub fn lex(src: &str, base: usize) -> Result<Vec<Token>, LexError> {
    let mut lexer = Lexer {
        src,
        bytes: src.as_bytes(),
        i: 0,
        base,
        out: Vec::new(),
    };
    lexer.run()?;
    Ok(lexer.out)
}

struct Lexer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    i: usize,
    base: usize,
    out: Vec<Token>,
}

impl Lexer<'_> {
    fn err<T>(&self, at: usize, message: impl Into<String>) -> Result<T, LexError> {
        Err(LexError {
            pos: self.base + at,
            message: message.into(),
        })
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.i + offset).copied()
    }

    fn push(&mut self, tok: Tok, start: usize) {
        self.out.push(Token {
            tok,
            pos: self.base + start,
        });
    }

    fn run(&mut self) -> Result<(), LexError> {
        while let Some(c) = self.peek_at(0) {
            let start = self.i;
            match c {
                b' ' | b'\t' | b'\r' | b'\n' => self.i += 1,
                b'/' if self.peek_at(1) == Some(b'/') => {
                    while let Some(c) = self.peek_at(0) {
                        if c == b'\n' {
                            break;
                        }
                        self.i += 1;
                    }
                }
                b'/' if self.peek_at(1) == Some(b'*') => {
                    match self.src[self.i + 2..].find("*/") {
                        Some(end) => self.i += 2 + end + 2,
                        None => return self.err(start, "unterminated comment"),
                    }
                }
                b'"' | b'\'' => {
                    let s = self.string(c)?;
                    self.push(Tok::Str(s), start);
                }
                b'0'..=b'9' => {
                    let n = self.number()?;
                    self.push(Tok::Number(n), start);
                }
                b'.' if matches!(self.peek_at(1), Some(b'0'..=b'9')) => {
                    let n = self.number()?;
                    self.push(Tok::Number(n), start);
                }
                c if c == b'_' || c == b'$' || c.is_ascii_alphabetic() => {
                    let word = self.word();
                    let tok = match word {
                        "let" | "const" | "var" => Tok::Let,
                        "if" => Tok::If,
                        "else" => Tok::Else,
                        "for" => Tok::For,
                        "in" | "of" => Tok::In,
                        "true" => Tok::True,
                        "false" => Tok::False,
                        "null" | "undefined" => Tok::Null,
                        _ => Tok::Ident(word.to_string()),
                    };
                    self.push(tok, start);
                }
                _ => {
                    let tok = self.punct(start)?;
                    self.push(tok, start);
                }
            }
        }
        Ok(())
    }

    fn word(&mut self) -> &str {
        let start = self.i;
        while let Some(c) = self.peek_at(0) {
            if c == b'_' || c == b'$' || c.is_ascii_alphanumeric() {
                self.i += 1;
            } else {
                break;
            }
        }
        &self.src[start..self.i]
    }

    fn number(&mut self) -> Result<f64, LexError> {
        let start = self.i;
        if self.peek_at(0) == Some(b'0') && matches!(self.peek_at(1), Some(b'x' | b'X')) {
            self.i += 2;
            let digits_start = self.i;
            while matches!(self.peek_at(0), Some(c) if c.is_ascii_hexdigit()) {
                self.i += 1;
            }
            return match u64::from_str_radix(&self.src[digits_start..self.i], 16) {
                Ok(n) => Ok(n as f64),
                Err(_) => self.err(start, "invalid hex number"),
            };
        }
        while matches!(self.peek_at(0), Some(b'0'..=b'9')) {
            self.i += 1;
        }
        if self.peek_at(0) == Some(b'.') && matches!(self.peek_at(1), Some(b'0'..=b'9')) {
            self.i += 1;
            while matches!(self.peek_at(0), Some(b'0'..=b'9')) {
                self.i += 1;
            }
        }
        if matches!(self.peek_at(0), Some(b'e' | b'E')) {
            let mark = self.i;
            self.i += 1;
            if matches!(self.peek_at(0), Some(b'+' | b'-')) {
                self.i += 1;
            }
            if matches!(self.peek_at(0), Some(b'0'..=b'9')) {
                while matches!(self.peek_at(0), Some(b'0'..=b'9')) {
                    self.i += 1;
                }
            } else {
                self.i = mark;
            }
        }
        if matches!(self.peek_at(0), Some(c) if c == b'_' || c.is_ascii_alphabetic()) {
            return self.err(self.i, "identifier directly after number");
        }
        match self.src[start..self.i].parse::<f64>() {
            Ok(n) => Ok(n),
            Err(_) => self.err(start, "invalid number"),
        }
    }

    fn string(&mut self, quote: u8) -> Result<String, LexError> {
        let start = self.i;
        self.i += 1;
        let mut out = String::new();
        loop {
            let Some(c) = self.src[self.i..].chars().next() else {
                return self.err(start, "unterminated string");
            };
            self.i += c.len_utf8();
            match c {
                '\\' => {
                    let Some(esc) = self.src[self.i..].chars().next() else {
                        return self.err(start, "unterminated string");
                    };
                    self.i += esc.len_utf8();
                    match esc {
                        'n' => out.push('\n'),
                        't' => out.push('\t'),
                        'r' => out.push('\r'),
                        'b' => out.push('\u{8}'),
                        'f' => out.push('\u{c}'),
                        '0' => out.push('\0'),
                        'u' => {
                            let hex = self.src.get(self.i..self.i + 4).unwrap_or("");
                            let code = u32::from_str_radix(hex, 16).ok().and_then(char::from_u32);
                            match code {
                                Some(ch) if hex.len() == 4 => {
                                    out.push(ch);
                                    self.i += 4;
                                }
                                _ => return self.err(self.i - 2, "invalid unicode escape"),
                            }
                        }
                        '\n' => {}
                        other => out.push(other),
                    }
                }
                '\n' => return self.err(start, "unterminated string"),
                c if c as u32 == quote as u32 => return Ok(out),
                c => out.push(c),
            }
        }
    }

    fn punct(&mut self, start: usize) -> Result<Tok, LexError> {
        let c = self.bytes[self.i];
        let next = self.peek_at(1);
        let (tok, len) = match (c, next) {
            (b'=', Some(b'=')) if self.peek_at(2) == Some(b'=') => (Tok::Eq, 3),
            (b'!', Some(b'=')) if self.peek_at(2) == Some(b'=') => (Tok::Ne, 3),
            (b'=', Some(b'=')) => (Tok::Eq, 2),
            (b'!', Some(b'=')) => (Tok::Ne, 2),
            (b'<', Some(b'=')) => (Tok::Le, 2),
            (b'>', Some(b'=')) => (Tok::Ge, 2),
            (b'&', Some(b'&')) => (Tok::AndAnd, 2),
            (b'|', Some(b'|')) => (Tok::OrOr, 2),
            (b'(', _) => (Tok::LParen, 1),
            (b')', _) => (Tok::RParen, 1),
            (b'[', _) => (Tok::LBracket, 1),
            (b']', _) => (Tok::RBracket, 1),
            (b'{', _) => (Tok::LBrace, 1),
            (b'}', _) => (Tok::RBrace, 1),
            (b',', _) => (Tok::Comma, 1),
            (b':', _) => (Tok::Colon, 1),
            (b';', _) => (Tok::Semi, 1),
            (b'.', _) => (Tok::Dot, 1),
            (b'?', _) => (Tok::Question, 1),
            (b'=', _) => (Tok::Assign, 1),
            (b'<', _) => (Tok::Lt, 1),
            (b'>', _) => (Tok::Gt, 1),
            (b'+', _) => (Tok::Plus, 1),
            (b'-', _) => (Tok::Minus, 1),
            (b'*', _) => (Tok::Star, 1),
            (b'/', _) => (Tok::Slash, 1),
            (b'%', _) => (Tok::Percent, 1),
            (b'!', _) => (Tok::Bang, 1),
            _ => {
                let ch = self.src[self.i..].chars().next().unwrap_or('?');
                return self.err(start, format!("unexpected character {ch:?}"));
            }
        };
        self.i += len;
        Ok(tok)
    }
}
