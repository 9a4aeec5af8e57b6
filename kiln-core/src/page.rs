use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

use crate::config::{Config, PageFormat};
use crate::frontmatter::{FrontMatter, FrontMatterError, parse_front_matter};
use crate::header::{HeaderError, read_header};
use crate::template::to_text;

static SEPARATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[_.\-]+").expect("valid regex"));

#[derive(Debug, Error)]
pub enum PageError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read header: {0}")]
    Header(#[from] HeaderError),
    #[error("failed to parse header: {0}")]
    FrontMatter(#[from] FrontMatterError),
}

/// A source file that is turned into an HTML page.
#[derive(Debug, Clone)]
pub struct Page {
    pub title: String,
    /// Source file.
    pub sfile: PathBuf,
    /// Lowercase source extension, e.g. `.md`.
    pub sext: String,
    pub format: PageFormat,
    /// Output file, relative to the output directory.
    pub ofile: PathBuf,
    pub url: String,
    /// Front matter, `None` when the file has no header.
    pub meta: Option<FrontMatter>,
    /// Byte offset of the body in `sfile`.
    pub content_offset: u64,
    /// Index of the parent page in the site's page list.
    pub parent: Option<usize>,
    pub children: Vec<usize>,
}

impl Page {
    /// Read the header of `sfile` and work out where the page ends up.
    pub async fn read(
        config: &Config,
        srcdir: &Path,
        sfile: &Path,
        sext: &str,
        format: PageFormat,
    ) -> Result<Self, PageError> {
        let io_err = |source| PageError::Io {
            path: sfile.to_path_buf(),
            source,
        };
        let mut file = File::open(sfile).await.map_err(io_err)?;
        let header = read_header(&mut file).await?;

        let (meta, content_offset) = match header {
            Some(header) => (
                Some(parse_front_matter(&header.front_matter)?),
                header.content_offset,
            ),
            None => (None, 0),
        };

        let rel = sfile.strip_prefix(srcdir).unwrap_or(sfile).with_extension("");
        let name = rel
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let (ofile, url) = if name == "index" {
            let dir = rel.parent().unwrap_or_else(|| Path::new(""));
            let dir_url = url_path(dir);
            let url = if dir_url.is_empty() {
                config.base_url.clone()
            } else {
                format!("{}{}/", config.base_url, dir_url)
            };
            (dir.join("index.html"), url)
        } else {
            let ofile = rel.with_extension("html");
            let url = format!("{}{}", config.base_url, url_path(&ofile));
            (ofile, url)
        };

        let title = meta
            .as_ref()
            .and_then(|m| m.get("title"))
            .filter(|v| v.is_string() || v.is_number())
            .map(to_text)
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| title_from_file(srcdir, sfile, &name));

        debug!("Read page {} ({})", sfile.display(), url);

        Ok(Self {
            title,
            sfile: sfile.to_path_buf(),
            sext: sext.to_string(),
            format,
            ofile,
            url,
            meta,
            content_offset,
            parent: None,
            children: Vec::new(),
        })
    }

    /// Read the page source after the header.
    pub async fn read_body(&self) -> Result<Vec<u8>, PageError> {
        let io_err = |source| PageError::Io {
            path: self.sfile.clone(),
            source,
        };
        let mut file = File::open(&self.sfile).await.map_err(io_err)?;
        file.seek(SeekFrom::Start(self.content_offset))
            .await
            .map_err(io_err)?;
        let mut body = Vec::new();
        file.read_to_end(&mut body).await.map_err(io_err)?;
        Ok(body)
    }

    /// Name of the layout template wrapping this page, if any.
    ///
    /// Pages without a header get no layout; pages with one use their
    /// `layout` key or `default`. The layout name `none` disables wrapping.
    pub fn layout<'a>(&'a self, default: &'a str) -> Option<&'a str> {
        let meta = self.meta.as_ref()?;
        let layout = match meta.get("layout") {
            Some(Value::String(s)) if !s.is_empty() => s.as_str(),
            _ => default,
        };
        (layout != "none" && !layout.is_empty()).then_some(layout)
    }

    /// Page fields as seen by templates, without tree links.
    pub fn summary(&self) -> Value {
        json!({
            "title": self.title,
            "url": self.url,
            "sfile": self.sfile.to_string_lossy(),
            "sext": self.sext,
            "ofile": self.ofile.to_string_lossy(),
            "meta": self.meta,
        })
    }
}

/// Title derived from a page's file name: `foo-bar.baz` becomes
/// `Foo bar baz`. Index pages take the name of their directory, and the
/// top-level index is "Home".
pub fn title_from_file(srcdir: &Path, sfile: &Path, name: &str) -> String {
    let mut title = name.to_string();
    if name == "index" {
        let parent = sfile.parent().unwrap_or_else(|| Path::new(""));
        if parent == srcdir {
            return "Home".to_string();
        }
        if let Some(dir) = parent.file_name() {
            title = dir.to_string_lossy().into_owned();
        }
    }

    let title = SEPARATORS.replace_all(&title, " ");
    let mut chars = title.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Relative path joined with `/` regardless of platform.
fn url_path(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
