//! Tree-walking evaluator for compiled templates.

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::{Map, Value};

use super::ast::{BinaryOp, Expr, ExprKind, Node, UnaryOp};
use super::builtins::SharedEnv;
use super::value::{self, escape_xml, to_text, truthy, type_name};
use super::{Props, Template, TemplateError, Writer};
use crate::fs;

/// Per-evaluation state: the template being run, the caller's properties and
/// the stack of local scopes introduced by `let`, blocks and loops.
pub(super) struct Frame<'a> {
    template: &'a Template,
    props: &'a Props,
    shared: &'a SharedEnv,
    scopes: Vec<Map<String, Value>>,
}

impl<'a> Frame<'a> {
    pub(super) fn new(template: &'a Template, props: &'a Props, shared: &'a SharedEnv) -> Self {
        Self {
            template,
            props,
            shared,
            scopes: vec![Map::new()],
        }
    }

    pub(super) fn exec<'s>(
        &'s mut self,
        nodes: &'s [Node],
        out: &'s mut dyn Writer,
    ) -> BoxFuture<'s, Result<(), TemplateError>> {
        async move {
            for node in nodes {
                match node {
                    Node::Text(text) => self.write(out, text)?,
                    Node::Echo(expr) => {
                        let v = self.eval(expr, out)?;
                        self.write(out, &escape_xml(&to_text(&v)))?;
                    }
                    Node::Expr(expr) => {
                        self.eval(expr, out)?;
                    }
                    Node::Let { name, value } => {
                        let v = self.eval(value, out)?;
                        if let Some(scope) = self.scopes.last_mut() {
                            scope.insert(name.clone(), v);
                        }
                    }
                    Node::Assign { name, value, pos } => {
                        let v = self.eval(value, out)?;
                        match self.scopes.iter_mut().rev().find_map(|s| s.get_mut(name)) {
                            Some(slot) => *slot = v,
                            None => {
                                return Err(self.error(
                                    *pos,
                                    format!("assignment to undeclared variable `{name}`"),
                                ));
                            }
                        }
                    }
                    Node::If {
                        branches,
                        otherwise,
                    } => {
                        let mut chosen = otherwise.as_deref();
                        for (cond, body) in branches {
                            if truthy(&self.eval(cond, out)?) {
                                chosen = Some(body.as_slice());
                                break;
                            }
                        }
                        if let Some(body) = chosen {
                            self.scoped(body, Map::new(), out).await?;
                        }
                    }
                    Node::For {
                        first,
                        second,
                        iterable,
                        body,
                    } => {
                        let items = self.eval(iterable, out)?;
                        for (key, item) in self.entries(items, iterable.pos)? {
                            let mut bindings = Map::new();
                            match second {
                                Some(second) => {
                                    bindings.insert(first.clone(), key);
                                    bindings.insert(second.clone(), item);
                                }
                                None => {
                                    bindings.insert(first.clone(), item);
                                }
                            }
                            self.scoped(body, bindings, out).await?;
                        }
                    }
                    Node::Include { path, env, pos } => {
                        let target = to_text(&self.eval(path, out)?);
                        let mut props = self.props.clone();
                        props.filename = None;
                        if let Some(env) = env {
                            match self.eval(env, out)? {
                                Value::Object(extra) => props.env.extend(extra),
                                Value::Null => {}
                                other => {
                                    return Err(self.error(
                                        *pos,
                                        format!(
                                            "include() environment must be an object, not {}",
                                            type_name(&other)
                                        ),
                                    ));
                                }
                            }
                        }
                        let Some(ctx) = self.template.context() else {
                            return Err(self.error(*pos, "template context no longer exists"));
                        };
                        let file = fs::resolve(self.template.dir(), &target);
                        ctx.eval_file_into(&file, &props, &mut *out).await?;
                    }
                }
            }
            Ok(())
        }
        .boxed()
    }

    async fn scoped(
        &mut self,
        body: &[Node],
        bindings: Map<String, Value>,
        out: &mut dyn Writer,
    ) -> Result<(), TemplateError> {
        self.scopes.push(bindings);
        let result = self.exec(body, out).await;
        self.scopes.pop();
        result
    }

    fn entries(&self, items: Value, pos: usize) -> Result<Vec<(Value, Value)>, TemplateError> {
        match items {
            Value::Array(items) => Ok(items
                .into_iter()
                .enumerate()
                .map(|(i, v)| (Value::from(i), v))
                .collect()),
            Value::Object(map) => Ok(map
                .into_iter()
                .map(|(k, v)| (Value::String(k), v))
                .collect()),
            Value::Null => Ok(Vec::new()),
            other => Err(self.error(pos, format!("cannot iterate over {}", type_name(&other)))),
        }
    }

    fn write(&self, out: &mut dyn Writer, s: &str) -> Result<(), TemplateError> {
        out.write_str(s).map_err(|source| TemplateError::Io {
            path: self.template.filename().into(),
            source,
        })
    }

    fn error(&self, pos: usize, message: impl Into<String>) -> TemplateError {
        self.template.runtime_error(pos, message.into())
    }

    fn lookup(&self, name: &str) -> Option<&Value> {
        self.scopes
            .iter()
            .rev()
            .find_map(|s| s.get(name))
            .or_else(|| self.props.env.get(name))
            .or_else(|| self.shared.value(name))
    }

    fn eval(&mut self, expr: &Expr, out: &mut dyn Writer) -> Result<Value, TemplateError> {
        match &expr.kind {
            ExprKind::Literal(v) => Ok(v.clone()),
            ExprKind::Ident(name) => self
                .lookup(name)
                .cloned()
                .ok_or_else(|| self.error(expr.pos, format!("`{name}` is not defined"))),
            ExprKind::Array(items) => items
                .iter()
                .map(|e| self.eval(e, out))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            ExprKind::Object(entries) => {
                let mut map = Map::new();
                for (key, e) in entries {
                    let v = self.eval(e, out)?;
                    map.insert(key.clone(), v);
                }
                Ok(Value::Object(map))
            }
            ExprKind::Member(target, name) => {
                let target = self.eval(target, out)?;
                match target {
                    Value::Object(mut map) => Ok(map.remove(name).unwrap_or(Value::Null)),
                    Value::Array(items) if name == "length" => Ok(Value::from(items.len())),
                    Value::String(s) if name == "length" => Ok(Value::from(s.chars().count())),
                    Value::Null => {
                        Err(self.error(expr.pos, format!("cannot read `{name}` of null")))
                    }
                    _ => Ok(Value::Null),
                }
            }
            ExprKind::Index(target, index) => {
                let target = self.eval(target, out)?;
                let index = self.eval(index, out)?;
                match (target, &index) {
                    (Value::Array(mut items), Value::Number(n)) => {
                        let i = n.as_u64().and_then(|i| usize::try_from(i).ok());
                        Ok(match i {
                            Some(i) if i < items.len() => items.swap_remove(i),
                            _ => Value::Null,
                        })
                    }
                    (Value::Object(mut map), Value::String(key)) => {
                        Ok(map.remove(key).unwrap_or(Value::Null))
                    }
                    (Value::String(s), Value::Number(n)) => Ok(n
                        .as_u64()
                        .and_then(|i| s.chars().nth(i as usize))
                        .map(|c| Value::String(c.to_string()))
                        .unwrap_or(Value::Null)),
                    (Value::Null, _) => Err(self.error(
                        expr.pos,
                        format!("cannot index null with {}", to_text(&index)),
                    )),
                    _ => Ok(Value::Null),
                }
            }
            ExprKind::Call(name, args) => {
                if self.lookup(name).is_some() {
                    return Err(self.error(expr.pos, format!("`{name}` is not a function")));
                }
                let args = args
                    .iter()
                    .map(|e| self.eval(e, out))
                    .collect::<Result<Vec<_>, _>>()?;
                match name.as_str() {
                    "print" => {
                        for arg in &args {
                            self.write(out, &to_text(arg))?;
                        }
                        Ok(Value::Null)
                    }
                    "printv" => {
                        for arg in &args {
                            self.write(out, &escape_xml(&to_text(arg)))?;
                        }
                        Ok(Value::Null)
                    }
                    _ => match self.shared.function(name) {
                        Some(f) => f(&args)
                            .map_err(|msg| self.error(expr.pos, format!("{name}(): {msg}"))),
                        None => Err(self.error(expr.pos, format!("`{name}` is not defined"))),
                    },
                }
            }
            ExprKind::Unary(op, operand) => {
                let v = self.eval(operand, out)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!truthy(&v))),
                    UnaryOp::Neg => match v.as_f64() {
                        Some(n) => value::number(-n).map_err(|msg| self.error(expr.pos, msg)),
                        None => Err(self.error(
                            expr.pos,
                            format!("cannot negate {}", type_name(&v)),
                        )),
                    },
                }
            }
            ExprKind::Binary(op, lhs, rhs) => {
                let l = self.eval(lhs, out)?;
                match op {
                    BinaryOp::And if !truthy(&l) => Ok(l),
                    BinaryOp::Or if truthy(&l) => Ok(l),
                    BinaryOp::And | BinaryOp::Or => self.eval(rhs, out),
                    _ => {
                        let r = self.eval(rhs, out)?;
                        value::binary(*op, &l, &r).map_err(|msg| self.error(expr.pos, msg))
                    }
                }
            }
            ExprKind::Cond(cond, then, otherwise) => {
                if truthy(&self.eval(cond, out)?) {
                    self.eval(then, out)
                } else {
                    self.eval(otherwise, out)
                }
            }
        }
    }
}
