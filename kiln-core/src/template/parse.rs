//! Template compiler: splits source into literal and code spans, then parses
//! the resulting token stream into a [`Program`].
//!
//! Code spans are delimited by `<? ... ?>`. A span starting with `=` is an
//! echo (`<?= expr ?>`). A `-` right after `<?` trims the whitespace before
//! the marker; a `-` right before `?>` trims the whitespace after it.
//! Blocks opened in one span may be closed in a later one, with literal text
//! in between:
//!
//! ```text
//! <? for page in site.pages { ?>
//!   <li><?= page.title ?></li>
//! <? } ?>
//! ```

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use super::ast::{BinaryOp, Expr, ExprKind, Node, Program, UnaryOp};
use super::lexer::{LexError, Tok, Token, lex};
use super::value;

static MARKER: LazyLock<Regex> = LazyLock::new(|| {
    //                1        2        3      4        5        6      7
    Regex::new(r"(?s)(\s*)<\?-(.*?)(-?)\?>(\s*)|<\?(.*?)(-?)\?>(\s*)").expect("valid marker regex")
});

#[derive(Debug, Clone, PartialEq)]
pub struct CompileError {
    /// Byte offset in the source.
    pub pos: usize,
    pub message: String,
}

impl From<LexError> for CompileError {
    fn from(err: LexError) -> Self {
        CompileError {
            pos: err.pos,
            message: err.message,
        }
    }
}

type Result<T> = std::result::Result<T, CompileError>;

/// Compile template source into a program.
pub fn compile(source: &str) -> Result<Program> {
    let tokens = scan(source)?;
    let mut parser = Parser::new(source, tokens);
    let nodes = parser.block(None)?;
    Ok(Program { nodes })
}

/// Split `source` into text tokens and lexed code spans.
fn scan(source: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut i = 0;

    for caps in MARKER.captures_iter(source) {
        let Some(whole) = caps.get(0) else { continue };
        let (trim_before, code, trim_after, trailing) = match caps.get(2) {
            Some(code) => (true, code, caps.get(3), caps.get(4)),
            None => match caps.get(5) {
                Some(code) => (false, code, caps.get(6), caps.get(7)),
                None => continue,
            },
        };
        let marker_start = code.start() - if trim_before { 3 } else { 2 };

        let mut text = source.get(i..marker_start).unwrap_or("");
        if trim_before {
            text = text.trim_end();
        }
        if !text.is_empty() {
            tokens.push(Token {
                tok: Tok::Text(text.to_string()),
                pos: i,
            });
        }

        let src = code.as_str();
        if let Some(expr) = src.strip_prefix('=') {
            tokens.push(Token {
                tok: Tok::Echo,
                pos: code.start(),
            });
            tokens.extend(lex(expr, code.start() + 1)?);
        } else {
            tokens.extend(lex(src, code.start())?);
        }
        tokens.push(Token {
            tok: Tok::SpanEnd,
            pos: code.end(),
        });

        let trimmed = trim_after.is_some_and(|m| !m.as_str().is_empty());
        i = match trailing {
            Some(ws) if !trimmed => ws.start(),
            _ => whole.end(),
        };
    }

    if i < source.len() {
        tokens.push(Token {
            tok: Tok::Text(source[i..].to_string()),
            pos: i,
        });
    }
    tokens.push(Token {
        tok: Tok::Eof,
        pos: source.len(),
    });
    Ok(tokens)
}

/// Parse a relaxed-JSON literal: objects with bare or quoted keys, arrays,
/// single or double quoted strings, numbers, booleans, null, trailing commas
/// and comments. Nothing is evaluated; identifiers and operators are rejected.
pub fn parse_literal(src: &str) -> Result<Value> {
    let mut tokens = lex(src, 0)?;
    tokens.push(Token {
        tok: Tok::Eof,
        pos: src.len(),
    });
    let mut parser = Parser::new(src, tokens);
    let expr = parser.expr()?;
    if parser.peek() != &Tok::Eof {
        return parser.unexpected("end of value");
    }
    const_value(expr)
}

fn const_value(expr: Expr) -> Result<Value> {
    match expr.kind {
        ExprKind::Literal(v) => Ok(v),
        ExprKind::Array(items) => items
            .into_iter()
            .map(const_value)
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        ExprKind::Object(entries) => {
            let mut map = Map::new();
            for (key, value) in entries {
                map.insert(key, const_value(value)?);
            }
            Ok(Value::Object(map))
        }
        ExprKind::Unary(UnaryOp::Neg, inner) => {
            let pos = inner.pos;
            match const_value(*inner)? {
                Value::Number(n) => value::number(-n.as_f64().unwrap_or(f64::NAN))
                    .map_err(|message| CompileError { pos, message }),
                _ => Err(CompileError {
                    pos,
                    message: "`-` only applies to numbers".to_string(),
                }),
            }
        }
        ExprKind::Ident(name) => Err(CompileError {
            pos: expr.pos,
            message: format!("unexpected identifier `{name}`; only literal values are allowed"),
        }),
        _ => Err(CompileError {
            pos: expr.pos,
            message: "only literal values are allowed".to_string(),
        }),
    }
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    i: usize,
    /// Position of the last consumed token.
    prev: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str, tokens: Vec<Token>) -> Self {
        Self {
            source,
            tokens,
            i: 0,
            prev: 0,
        }
    }

    fn peek(&self) -> &Tok {
        self.peek_nth(0)
    }

    fn peek_nth(&self, n: usize) -> &Tok {
        self.tokens
            .get(self.i + n)
            .or(self.tokens.last())
            .map(|t| &t.tok)
            .unwrap_or(&Tok::Eof)
    }

    fn pos(&self) -> usize {
        self.tokens
            .get(self.i)
            .or(self.tokens.last())
            .map(|t| t.pos)
            .unwrap_or(0)
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens.get(self.i).cloned().unwrap_or(Token {
            tok: Tok::Eof,
            pos: self.source.len(),
        });
        if self.i < self.tokens.len() {
            self.i += 1;
        }
        self.prev = token.pos;
        token
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == tok {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: Tok) -> Result<Token> {
        if self.peek() == &tok {
            Ok(self.advance())
        } else {
            self.unexpected(&tok.describe())
        }
    }

    fn unexpected<T>(&self, wanted: &str) -> Result<T> {
        Err(CompileError {
            pos: self.pos(),
            message: format!("expected {wanted}, found {}", self.peek().describe()),
        })
    }

    fn ident(&mut self) -> Result<String> {
        match self.peek().clone() {
            Tok::Ident(name) => {
                self.advance();
                Ok(name)
            }
            _ => self.unexpected("identifier"),
        }
    }

    /// Parse statements until `}` (when `open` is the position of the opening
    /// brace) or the end of the template.
    fn block(&mut self, open: Option<usize>) -> Result<Vec<Node>> {
        let mut nodes = Vec::new();
        loop {
            match self.peek() {
                Tok::Semi | Tok::SpanEnd => {
                    self.advance();
                }
                Tok::Eof => {
                    if let Some(pos) = open {
                        return Err(CompileError {
                            pos,
                            message: "unclosed `{`".to_string(),
                        });
                    }
                    return Ok(nodes);
                }
                Tok::RBrace => {
                    if open.is_none() {
                        return self.unexpected("statement");
                    }
                    self.advance();
                    return Ok(nodes);
                }
                _ => nodes.push(self.statement()?),
            }
        }
    }

    fn statement(&mut self) -> Result<Node> {
        match self.peek().clone() {
            Tok::Text(text) => {
                self.advance();
                Ok(Node::Text(text))
            }
            Tok::Echo => {
                self.advance();
                let expr = self.expr()?;
                self.eat(&Tok::Semi);
                if self.peek() != &Tok::SpanEnd {
                    return self.unexpected("`?>` after echoed expression");
                }
                Ok(Node::Echo(expr))
            }
            Tok::Let => {
                self.advance();
                let name = self.ident()?;
                self.expect(Tok::Assign)?;
                let value = self.expr()?;
                self.end_statement()?;
                Ok(Node::Let { name, value })
            }
            Tok::If => self.if_statement(),
            Tok::For => self.for_statement(),
            Tok::Ident(name) if name == "include" && self.peek_nth(1) == &Tok::LParen => {
                let pos = self.advance().pos;
                self.advance();
                let mut args = self.arguments()?;
                if args.is_empty() || args.len() > 2 {
                    return Err(CompileError {
                        pos,
                        message: "include() takes a path and an optional environment".to_string(),
                    });
                }
                let env = if args.len() == 2 { args.pop() } else { None };
                let path = args.remove(0);
                self.end_statement()?;
                Ok(Node::Include { path, env, pos })
            }
            _ => {
                let expr = self.expr()?;
                if self.peek() == &Tok::Assign {
                    let ExprKind::Ident(name) = expr.kind else {
                        return Err(CompileError {
                            pos: self.pos(),
                            message: "only plain variables can be assigned".to_string(),
                        });
                    };
                    self.advance();
                    let value = self.expr()?;
                    self.end_statement()?;
                    return Ok(Node::Assign {
                        name,
                        value,
                        pos: expr.pos,
                    });
                }
                self.end_statement()?;
                Ok(Node::Expr(expr))
            }
        }
    }

    fn end_statement(&mut self) -> Result<()> {
        match self.peek() {
            Tok::Semi => {
                self.advance();
                Ok(())
            }
            Tok::SpanEnd | Tok::RBrace | Tok::Eof => Ok(()),
            _ => {
                let between = self.source.get(self.prev..self.pos()).unwrap_or("");
                if between.contains('\n') {
                    Ok(())
                } else {
                    self.unexpected("`;` or end of line")
                }
            }
        }
    }

    fn skip_span_ends(&self) -> usize {
        let mut n = 0;
        while self.peek_nth(n) == &Tok::SpanEnd {
            n += 1;
        }
        n
    }

    fn if_statement(&mut self) -> Result<Node> {
        self.advance();
        let mut branches = Vec::new();
        let mut otherwise = None;

        let cond = self.expr()?;
        let open = self.expect(Tok::LBrace)?.pos;
        branches.push((cond, self.block(Some(open))?));

        loop {
            let n = self.skip_span_ends();
            if self.peek_nth(n) != &Tok::Else {
                break;
            }
            for _ in 0..=n {
                self.advance();
            }
            if self.eat(&Tok::If) {
                let cond = self.expr()?;
                let open = self.expect(Tok::LBrace)?.pos;
                branches.push((cond, self.block(Some(open))?));
            } else {
                let open = self.expect(Tok::LBrace)?.pos;
                otherwise = Some(self.block(Some(open))?);
                break;
            }
        }

        Ok(Node::If {
            branches,
            otherwise,
        })
    }

    fn for_statement(&mut self) -> Result<Node> {
        self.advance();
        let parenthesized = self.eat(&Tok::LParen);
        self.eat(&Tok::Let);
        let first = self.ident()?;
        let second = if self.eat(&Tok::Comma) {
            Some(self.ident()?)
        } else {
            None
        };
        self.expect(Tok::In)?;
        let iterable = self.expr()?;
        if parenthesized {
            self.expect(Tok::RParen)?;
        }
        let open = self.expect(Tok::LBrace)?.pos;
        let body = self.block(Some(open))?;
        Ok(Node::For {
            first,
            second,
            iterable,
            body,
        })
    }

    fn arguments(&mut self) -> Result<Vec<Expr>> {
        let mut args = Vec::new();
        while !self.eat(&Tok::RParen) {
            args.push(self.expr()?);
            if !self.eat(&Tok::Comma) {
                self.expect(Tok::RParen)?;
                break;
            }
        }
        Ok(args)
    }

    pub fn expr(&mut self) -> Result<Expr> {
        let cond = self.binary(0)?;
        if self.peek() != &Tok::Question {
            return Ok(cond);
        }
        self.advance();
        let then = self.expr()?;
        self.expect(Tok::Colon)?;
        let otherwise = self.expr()?;
        let pos = cond.pos;
        Ok(Expr::new(
            ExprKind::Cond(Box::new(cond), Box::new(then), Box::new(otherwise)),
            pos,
        ))
    }

    fn binary_op(&self, level: usize) -> Option<BinaryOp> {
        let op = match self.peek() {
            Tok::OrOr => BinaryOp::Or,
            Tok::AndAnd => BinaryOp::And,
            Tok::Eq => BinaryOp::Eq,
            Tok::Ne => BinaryOp::Ne,
            Tok::Lt => BinaryOp::Lt,
            Tok::Le => BinaryOp::Le,
            Tok::Gt => BinaryOp::Gt,
            Tok::Ge => BinaryOp::Ge,
            Tok::Plus => BinaryOp::Add,
            Tok::Minus => BinaryOp::Sub,
            Tok::Star => BinaryOp::Mul,
            Tok::Slash => BinaryOp::Div,
            Tok::Percent => BinaryOp::Rem,
            _ => return None,
        };
        (precedence(op) == level).then_some(op)
    }

    fn binary(&mut self, level: usize) -> Result<Expr> {
        if level > MAX_PRECEDENCE {
            return self.unary();
        }
        let mut lhs = self.binary(level + 1)?;
        while let Some(op) = self.binary_op(level) {
            self.advance();
            let rhs = self.binary(level + 1)?;
            let pos = lhs.pos;
            lhs = Expr::new(ExprKind::Binary(op, Box::new(lhs), Box::new(rhs)), pos);
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr> {
        let op = match self.peek() {
            Tok::Bang => UnaryOp::Not,
            Tok::Minus => UnaryOp::Neg,
            _ => return self.postfix(),
        };
        let pos = self.advance().pos;
        let operand = self.unary()?;
        Ok(Expr::new(ExprKind::Unary(op, Box::new(operand)), pos))
    }

    fn postfix(&mut self) -> Result<Expr> {
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                Tok::Dot => {
                    self.advance();
                    let name = self.ident()?;
                    let pos = expr.pos;
                    expr = Expr::new(ExprKind::Member(Box::new(expr), name), pos);
                }
                Tok::LBracket => {
                    self.advance();
                    let index = self.expr()?;
                    self.expect(Tok::RBracket)?;
                    let pos = expr.pos;
                    expr = Expr::new(ExprKind::Index(Box::new(expr), Box::new(index)), pos);
                }
                Tok::LParen => {
                    return Err(CompileError {
                        pos: self.pos(),
                        message: "only named functions can be called".to_string(),
                    });
                }
                _ => return Ok(expr),
            }
        }
    }

    fn primary(&mut self) -> Result<Expr> {
        let pos = self.pos();
        let kind = match self.peek().clone() {
            Tok::Number(n) => {
                self.advance();
                let v = value::number(n).map_err(|message| CompileError { pos, message })?;
                ExprKind::Literal(v)
            }
            Tok::Str(s) => {
                self.advance();
                ExprKind::Literal(Value::String(s))
            }
            Tok::True => {
                self.advance();
                ExprKind::Literal(Value::Bool(true))
            }
            Tok::False => {
                self.advance();
                ExprKind::Literal(Value::Bool(false))
            }
            Tok::Null => {
                self.advance();
                ExprKind::Literal(Value::Null)
            }
            Tok::Ident(name) => {
                self.advance();
                if self.eat(&Tok::LParen) {
                    if name == "include" {
                        return Err(CompileError {
                            pos,
                            message: "include() must be used as a statement".to_string(),
                        });
                    }
                    ExprKind::Call(name, self.arguments()?)
                } else {
                    ExprKind::Ident(name)
                }
            }
            Tok::LParen => {
                self.advance();
                let inner = self.expr()?;
                self.expect(Tok::RParen)?;
                return Ok(inner);
            }
            Tok::LBracket => {
                self.advance();
                let mut items = Vec::new();
                while !self.eat(&Tok::RBracket) {
                    items.push(self.expr()?);
                    if !self.eat(&Tok::Comma) {
                        self.expect(Tok::RBracket)?;
                        break;
                    }
                }
                ExprKind::Array(items)
            }
            Tok::LBrace => {
                self.advance();
                let mut entries = Vec::new();
                while !self.eat(&Tok::RBrace) {
                    let key = match self.peek().clone() {
                        Tok::Ident(k) | Tok::Str(k) => k,
                        Tok::Number(n) => value::to_text(
                            &value::number(n).map_err(|message| CompileError { pos, message })?,
                        ),
                        _ => return self.unexpected("object key"),
                    };
                    self.advance();
                    self.expect(Tok::Colon)?;
                    entries.push((key, self.expr()?));
                    if !self.eat(&Tok::Comma) {
                        self.expect(Tok::RBrace)?;
                        break;
                    }
                }
                ExprKind::Object(entries)
            }
            _ => return self.unexpected("expression"),
        };
        Ok(Expr::new(kind, pos))
    }
}

const MAX_PRECEDENCE: usize = 5;

fn precedence(op: BinaryOp) -> usize {
    match op {
        BinaryOp::Or => 0,
        BinaryOp::And => 1,
        BinaryOp::Eq | BinaryOp::Ne => 2,
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => 3,
        BinaryOp::Add | BinaryOp::Sub => 4,
        BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => 5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn texts(nodes: &[Node]) -> Vec<String> {
        nodes
            .iter()
            .filter_map(|n| match n {
                Node::Text(t) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_literal_only() {
        let program = compile("hello `world` ${x}").unwrap();
        assert_eq!(texts(&program.nodes), vec!["hello `world` ${x}"]);
    }

    #[test]
    fn test_trim_before_marker() {
        let program = compile("a \n<?- x ?>b").unwrap();
        assert_eq!(texts(&program.nodes), vec!["a", "b"]);
    }

    #[test]
    fn test_trim_after_marker() {
        let program = compile("a <? x -?>\n  b").unwrap();
        assert_eq!(texts(&program.nodes), vec!["a ", "b"]);
    }

    #[test]
    fn test_whitespace_kept_without_hyphen() {
        let program = compile("a \n<? x ?>\n b").unwrap();
        assert_eq!(texts(&program.nodes), vec!["a \n", "\n b"]);
    }

    #[test]
    fn test_block_across_spans() {
        let program = compile("<? if x { ?>yes<? } else { ?>no<? } ?>").unwrap();
        let [Node::If { branches, otherwise }] = program.nodes.as_slice() else {
            panic!("expected a single if node: {:?}", program.nodes);
        };
        assert_eq!(texts(&branches[0].1), vec!["yes"]);
        assert_eq!(texts(otherwise.as_ref().unwrap()), vec!["no"]);
    }

    #[test]
    fn test_statements_on_separate_lines() {
        let program = compile("<?\nlet a = 1\nlet b = a + 1\nprint(b)\n?>").unwrap();
        assert_eq!(program.nodes.len(), 3);
    }

    #[test]
    fn test_missing_separator() {
        let err = compile("<? let a = 1 let b = 2 ?>").unwrap_err();
        assert!(err.message.contains("`;`"), "{}", err.message);
    }

    #[test]
    fn test_unclosed_block_reports_brace() {
        let err = compile("ab<? if x { ?>").unwrap_err();
        assert_eq!(err.pos, 10);
    }

    #[test]
    fn test_include_only_as_statement() {
        assert!(matches!(
            compile(r#"<? include("a.html", { x: 1 }) ?>"#).unwrap().nodes[0],
            Node::Include { env: Some(_), .. }
        ));
        assert!(compile(r#"<?= include("a.html") ?>"#).is_err());
    }

    #[test]
    fn test_parse_literal() {
        assert_eq!(
            parse_literal("{ a: 1, 'b': [true, null, -2.5,], \"c\": 'x', }").unwrap(),
            json!({"a": 1, "b": [true, null, -2.5], "c": "x"})
        );
    }

    #[test]
    fn test_parse_literal_rejects_code() {
        assert!(parse_literal("[process.exit(1)]").is_err());
        assert!(parse_literal("{a: 1 + 2}").is_err());
        assert!(parse_literal("[1] [2]").is_err());
    }
}
