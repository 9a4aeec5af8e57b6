//! Template engine.
//!
//! A template is plain text with embedded code spans (see [`parse`] for the
//! syntax). Templates are compiled once into a [`Program`](ast::Program) and
//! evaluated any number of times against a set of [`Props`]. File templates
//! are cached per [`TemplateContext`] and recompiled when the file on disk is
//! newer than the cached copy.

mod ast;
mod builtins;
mod eval;
mod lexer;
mod parse;
mod value;

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

pub use builtins::{Builtin, SharedEnv};
pub use parse::parse_literal;
pub use value::{escape_xml, to_text};

use eval::Frame;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("{file}:{line}:{column}: syntax error: {message}")]
    Compile {
        file: String,
        line: usize,
        column: usize,
        message: String,
    },
    #[error("{file}:{line}:{column}: {message}")]
    Runtime {
        file: String,
        line: usize,
        column: usize,
        message: String,
    },
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Sink for template output.
pub trait Writer: Send {
    fn write_str(&mut self, s: &str) -> io::Result<()>;
}

impl Writer for String {
    fn write_str(&mut self, s: &str) -> io::Result<()> {
        self.push_str(s);
        Ok(())
    }
}

impl Writer for Vec<u8> {
    fn write_str(&mut self, s: &str) -> io::Result<()> {
        self.extend_from_slice(s.as_bytes());
        Ok(())
    }
}

/// Adapts any [`io::Write`] into a template [`Writer`].
pub struct IoWriter<W>(pub W);

impl<W: io::Write + Send> Writer for IoWriter<W> {
    fn write_str(&mut self, s: &str) -> io::Result<()> {
        self.0.write_all(s.as_bytes())
    }
}

/// Per-evaluation properties.
#[derive(Debug, Clone, Default)]
pub struct Props {
    /// Variables visible to the template.
    pub env: Map<String, Value>,
    /// Name reported in errors instead of the file path.
    pub filename: Option<String>,
    /// Skip the modification time check and reuse any cached compilation.
    pub nostat: bool,
}

impl Props {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_env(env: Map<String, Value>) -> Self {
        Self {
            env,
            ..Self::default()
        }
    }

    /// Add a serializable value to the environment.
    pub fn insert<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), serde_json::Error> {
        self.env.insert(key.to_string(), serde_json::to_value(value)?);
        Ok(())
    }

    pub fn nostat(mut self, nostat: bool) -> Self {
        self.nostat = nostat;
        self
    }
}

/// Maps byte offsets to 1-based line and column numbers.
#[derive(Debug, Clone)]
struct LineIndex {
    starts: Vec<usize>,
}

impl LineIndex {
    fn new(source: &str) -> Self {
        let mut starts = vec![0];
        starts.extend(source.match_indices('\n').map(|(i, _)| i + 1));
        Self { starts }
    }

    fn locate(&self, pos: usize) -> (usize, usize) {
        let line = self.starts.partition_point(|&s| s <= pos).max(1);
        (line, pos - self.starts[line - 1] + 1)
    }
}

/// A compiled template.
#[derive(Debug)]
pub struct Template {
    ctx: Weak<ContextInner>,
    env: Arc<SharedEnv>,
    program: ast::Program,
    filename: String,
    path: PathBuf,
    lines: LineIndex,
    mtime: u128,
}

impl Template {
    /// Name used in error messages.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Modification time of the source file in nanoseconds since the epoch,
    /// `0` when it was not checked.
    pub fn mtime(&self) -> u128 {
        self.mtime
    }

    /// Evaluate the template into a string.
    pub async fn eval(&self, props: &Props) -> Result<String, TemplateError> {
        let mut out = String::new();
        self.eval_into(props, &mut out).await?;
        Ok(out)
    }

    /// Evaluate the template, streaming output into `out`.
    pub async fn eval_into(
        &self,
        props: &Props,
        out: &mut dyn Writer,
    ) -> Result<(), TemplateError> {
        let mut frame = Frame::new(self, props, &self.env);
        frame.exec(&self.program.nodes, out).await
    }

    fn context(&self) -> Option<TemplateContext> {
        self.ctx.upgrade().map(|inner| TemplateContext { inner })
    }

    /// Directory relative paths in `include()` resolve against.
    fn dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new(""))
    }

    fn runtime_error(&self, pos: usize, message: String) -> TemplateError {
        let (line, column) = self.lines.locate(pos);
        TemplateError::Runtime {
            file: self.filename.clone(),
            line,
            column,
            message,
        }
    }
}

#[derive(Debug)]
struct ContextInner {
    env: Arc<SharedEnv>,
    cache: Mutex<HashMap<PathBuf, Arc<Template>>>,
}

/// Compiles templates and caches file templates.
///
/// Cloning is cheap; clones share the cache.
#[derive(Debug, Clone)]
pub struct TemplateContext {
    inner: Arc<ContextInner>,
}

impl Default for TemplateContext {
    fn default() -> Self {
        Self::new(SharedEnv::new())
    }
}

impl TemplateContext {
    pub fn new(env: SharedEnv) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                env: Arc::new(env),
                cache: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Compile `source`, reporting errors against `filename`.
    pub fn compile(&self, source: &str, filename: &str) -> Result<Template, TemplateError> {
        let lines = LineIndex::new(source);
        let program = parse::compile(source).map_err(|err| {
            let (line, column) = lines.locate(err.pos);
            TemplateError::Compile {
                file: filename.to_string(),
                line,
                column,
                message: err.message,
            }
        })?;
        Ok(Template {
            ctx: Arc::downgrade(&self.inner),
            env: self.inner.env.clone(),
            program,
            filename: filename.to_string(),
            path: PathBuf::from(filename),
            lines,
            mtime: 0,
        })
    }

    /// Compile and evaluate a template given as a string.
    pub async fn eval(&self, source: &str, props: &Props) -> Result<String, TemplateError> {
        let filename = props.filename.as_deref().unwrap_or("<string>");
        self.compile(source, filename)?.eval(props).await
    }

    /// Return the compiled template for `path`, compiling it if it is not
    /// cached or the file changed since it was cached.
    pub async fn get_file(
        &self,
        path: &Path,
        props: &Props,
    ) -> Result<Arc<Template>, TemplateError> {
        let path = std::path::absolute(path).map_err(|source| TemplateError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mtime = if props.nostat {
            0
        } else {
            match tokio::fs::metadata(&path).await.and_then(|m| m.modified()) {
                Ok(time) => nanos(time),
                Err(_) => u128::MAX,
            }
        };

        let cached = self.cache().get(&path).cloned();
        if let Some(template) = cached {
            if template.mtime >= mtime {
                return Ok(template);
            }
        }

        let source = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| TemplateError::Io {
                path: path.clone(),
                source,
            })?;
        let filename = match &props.filename {
            Some(name) => name.clone(),
            None => path.display().to_string(),
        };
        let mut template = self.compile(&source, &filename)?;
        template.path = path.clone();
        template.mtime = mtime;

        debug!("Compiled template {}", path.display());
        let template = Arc::new(template);
        self.cache().insert(path, template.clone());
        Ok(template)
    }

    /// Evaluate the template file at `path` into a string.
    pub async fn eval_file(&self, path: &Path, props: &Props) -> Result<String, TemplateError> {
        let mut out = String::new();
        self.eval_file_into(path, props, &mut out).await?;
        Ok(out)
    }

    /// Evaluate the template file at `path`, streaming output into `out`.
    pub fn eval_file_into<'a>(
        &'a self,
        path: &'a Path,
        props: &'a Props,
        out: &'a mut dyn Writer,
    ) -> BoxFuture<'a, Result<(), TemplateError>> {
        async move {
            let template = self.get_file(path, props).await?;
            template.eval_into(props, out).await
        }
        .boxed()
    }

    /// Number of cached file templates.
    pub fn cached(&self) -> usize {
        self.cache().len()
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<PathBuf, Arc<Template>>> {
        self.inner.cache.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn nanos(time: SystemTime) -> u128 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn render(source: &str, env: Value) -> Result<String, TemplateError> {
        let Value::Object(env) = env else {
            panic!("env must be an object");
        };
        TemplateContext::default()
            .eval(source, &Props::with_env(env))
            .await
    }

    async fn render_ok(source: &str) -> String {
        render(source, json!({})).await.unwrap()
    }

    #[tokio::test]
    async fn test_plain_text_round_trips() {
        assert_eq!(render_ok("`").await, "`");
        assert_eq!(render_ok("${meow}").await, "${meow}");
        assert_eq!(render_ok("a\\nb").await, "a\\nb");
    }

    #[tokio::test]
    async fn test_comments_and_trimming() {
        assert_eq!(
            render_ok("<?/*1*/?>`world`\n <?-/*B*/?><?=2?>day").await,
            "`world`2day"
        );
        assert_eq!(render_ok("a \n<? 1 ?>b").await, "a \nb");
        assert_eq!(render_ok("a \n<?- 1 ?>b").await, "ab");
        assert_eq!(render_ok("a \n<?-= 1 ?>b").await, "a1b");
        assert_eq!(render_ok("a<?= 1 -?>\n\n b").await, "a1b");
    }

    #[tokio::test]
    async fn test_echo_escapes_and_print_does_not() {
        let out = render(r#"<?= x ?>|<? print(x) ?>|<? printv(x) ?>"#, json!({"x": "<b>&'\""}))
            .await
            .unwrap();
        assert_eq!(out, "&lt;b&gt;&amp;&#39;&#34;|<b>&'\"|&lt;b&gt;&amp;&#39;&#34;");
    }

    #[tokio::test]
    async fn test_expressions() {
        assert_eq!(render_ok("<?= 5 * 2 ?>").await, "10");
        assert_eq!(render_ok("<?= ['hello', 'world'] ?>").await, "hello,world");
        assert_eq!(render_ok("<?= 1 < 2 ? 'yes' : 'no' ?>").await, "yes");
        assert_eq!(render_ok("<?= '' || 'fallback' ?>").await, "fallback");
        assert_eq!(render_ok("<?= [1, 2, 3].length ?>").await, "3");
    }

    #[tokio::test]
    async fn test_control_flow() {
        let source = "<? for item in items { if item.show { ?>[<?= item.name ?>]<? } } ?>";
        let env = json!({"items": [
            {"name": "a", "show": true},
            {"name": "b", "show": false},
            {"name": "c", "show": true},
        ]});
        assert_eq!(render(source, env).await.unwrap(), "[a][c]");

        let source = "<? let n = 0\nfor (let x of xs) { n = n + x } ?><?= n ?>";
        assert_eq!(render(source, json!({"xs": [1, 2, 3]})).await.unwrap(), "6");

        let source = "<? for k, v in obj { ?><?= k ?>=<?= v ?>;<? } ?>";
        assert_eq!(render(source, json!({"obj": {"a": 1}})).await.unwrap(), "a=1;");
    }

    #[tokio::test]
    async fn test_else_if_chain() {
        let source = "<? if n == 1 { ?>one<? } else if n == 2 { ?>two<? } else { ?>many<? } ?>";
        assert_eq!(render(source, json!({"n": 2})).await.unwrap(), "two");
        assert_eq!(render(source, json!({"n": 7})).await.unwrap(), "many");
    }

    #[tokio::test]
    async fn test_shared_env_functions() {
        let mut env = SharedEnv::new();
        env.add_function("builtin1", |_| Ok(json!(["hello", "world"])));
        env.add_value("sitename", &"Kiln").unwrap();
        let ctx = TemplateContext::new(env);
        let out = ctx
            .eval("<?= builtin1() ?> <?= sitename ?>", &Props::new())
            .await
            .unwrap();
        assert_eq!(out, "hello,world Kiln");
    }

    #[tokio::test]
    async fn test_variable_shadows_function() {
        let mut props = Props::new();
        props.insert("escape", &"oops").unwrap();
        let err = TemplateContext::default()
            .eval("<?= escape('x') ?>", &props)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not a function"), "{err}");
    }

    #[tokio::test]
    async fn test_undefined_variable_location() {
        let err = render("line one\n  <?= nope ?>", json!({})).await.unwrap_err();
        match err {
            TemplateError::Runtime {
                file, line, column, ..
            } => {
                assert_eq!(file, "<string>");
                assert_eq!(line, 2);
                assert_eq!(column, 7);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_compile_error_location() {
        let ctx = TemplateContext::default();
        let err = ctx.compile("ab\n<? if x { ?>", "page.html").unwrap_err();
        match err {
            TemplateError::Compile {
                file, line, column, ..
            } => {
                assert_eq!(file, "page.html");
                assert_eq!((line, column), (2, 9));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_evaluation_is_repeatable() {
        let ctx = TemplateContext::default();
        let template = ctx.compile("<? let a = x + 1 ?><?= a ?>", "t").unwrap();
        let mut props = Props::new();
        props.insert("x", &1).unwrap();
        assert_eq!(template.eval(&props).await.unwrap(), "2");
        assert_eq!(template.eval(&props).await.unwrap(), "2");
    }

    #[tokio::test]
    async fn test_compiling_twice_gives_identical_output() {
        let ctx = TemplateContext::default();
        let source = "<? for i, x in xs { ?><?= i ?>:<?= x ?> <? } ?><?= len(xs) ?>";
        let first = ctx.compile(source, "t").unwrap();
        let second = ctx.compile(source, "t").unwrap();

        let mut props = Props::new();
        props.insert("xs", &["a", "b"]).unwrap();
        let a = first.eval(&props).await.unwrap();
        let b = second.eval(&props).await.unwrap();
        assert_eq!(a, "0:a 1:b 2");
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_concurrent_evals_are_independent() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("main.html"), "[<?= n ?><? include('part.html') ?><?= n ?>]")
            .unwrap();
        fs::write(dir.path().join("part.html"), "<? for x in xs { ?><?= n ?><? } ?>").unwrap();

        let ctx = TemplateContext::default();
        let template = ctx
            .get_file(&dir.path().join("main.html"), &Props::new())
            .await
            .unwrap();
        let props: Vec<Props> = (0..20)
            .map(|n| {
                let mut props = Props::new();
                props.insert("n", &n).unwrap();
                props.insert("xs", &[1, 2, 3]).unwrap();
                props
            })
            .collect();

        let outputs = futures::future::join_all(props.iter().map(|p| template.eval(p))).await;
        for (n, out) in outputs.into_iter().enumerate() {
            assert_eq!(out.unwrap(), format!("[{n}{n}{n}{n}{n}]"));
        }
        assert_eq!(ctx.cached(), 2);
    }

    #[tokio::test]
    async fn test_include_ordering_and_env() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("parts")).unwrap();
        fs::write(
            dir.path().join("main.html"),
            "A<? include('parts/x.html', { who: 'X' }) ?>B",
        )
        .unwrap();
        fs::write(dir.path().join("parts/x.html"), "<?= who ?><?= title ?>").unwrap();

        let mut props = Props::new();
        props.insert("title", &"!").unwrap();
        let ctx = TemplateContext::default();
        let out = ctx.eval_file(&dir.path().join("main.html"), &props).await.unwrap();
        assert_eq!(out, "AX!B");
        assert_eq!(ctx.cached(), 2);
    }

    #[tokio::test]
    async fn test_include_error_propagates() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("main.html"), "A<? include('bad.html') ?>B").unwrap();
        fs::write(dir.path().join("bad.html"), "\n<?= missing ?>").unwrap();

        let ctx = TemplateContext::default();
        let err = ctx
            .eval_file(&dir.path().join("main.html"), &Props::new())
            .await
            .unwrap_err();
        match err {
            TemplateError::Runtime { file, line, .. } => {
                assert!(file.ends_with("bad.html"), "{file}");
                assert_eq!(line, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_streaming_writer() {
        struct Chunks(Vec<String>);
        impl Writer for Chunks {
            fn write_str(&mut self, s: &str) -> io::Result<()> {
                self.0.push(s.to_string());
                Ok(())
            }
        }

        let ctx = TemplateContext::default();
        let template = ctx.compile("a<?= 1 ?>b", "t").unwrap();
        let mut chunks = Chunks(Vec::new());
        template.eval_into(&Props::new(), &mut chunks).await.unwrap();
        assert_eq!(chunks.0, vec!["a", "1", "b"]);
    }

    #[tokio::test]
    async fn test_byte_writers() {
        let ctx = TemplateContext::default();
        let template = ctx.compile("<p><?= x ?></p>", "t").unwrap();
        let mut props = Props::new();
        props.insert("x", &"a&b").unwrap();

        let mut bytes = Vec::new();
        template.eval_into(&props, &mut bytes).await.unwrap();
        assert_eq!(bytes, b"<p>a&amp;b</p>");

        let mut cursor = IoWriter(io::Cursor::new(Vec::new()));
        template.eval_into(&props, &mut cursor).await.unwrap();
        assert_eq!(cursor.0.into_inner(), bytes);
    }

    #[tokio::test]
    async fn test_cache_recompiles_changed_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.html");
        fs::write(&path, "one").unwrap();

        let ctx = TemplateContext::default();
        let first = ctx.get_file(&path, &Props::new()).await.unwrap();
        let again = ctx.get_file(&path, &Props::new()).await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        fs::write(&path, "two").unwrap();
        let later = SystemTime::now() + Duration::from_secs(3600);
        fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(later)
            .unwrap();

        let cached = ctx.get_file(&path, &Props::new().nostat(true)).await.unwrap();
        assert!(Arc::ptr_eq(&first, &cached));

        let fresh = ctx.get_file(&path, &Props::new()).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &fresh));
        assert_eq!(fresh.eval(&Props::new()).await.unwrap(), "two");
    }

    #[tokio::test]
    async fn test_missing_file() {
        let ctx = TemplateContext::default();
        let err = ctx
            .eval_file(Path::new("/nonexistent/kiln/t.html"), &Props::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TemplateError::Io { .. }));
    }
}
