use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::io;
use std::path::{Path, PathBuf};

use futures::{StreamExt, stream};
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use walkdir::{DirEntry, WalkDir};

use crate::config::{Config, PageFormat};
use crate::fs;
use crate::header::HeaderError;
use crate::markdown::markdown_to_html;
use crate::page::{Page, PageError};
use crate::template::{Props, TemplateContext, TemplateError};

/// Files read, written or copied at once by each build stage.
const MAX_IN_FLIGHT: usize = 32;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("source directory {} does not exist", .0.display())]
    MissingSourceDir(PathBuf),
    #[error("failed to scan {}: {source}", path.display())]
    Scan {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Page(#[from] PageError),
    #[error(transparent)]
    Template(#[from] TemplateError),
}

impl BuildError {
    fn io(path: &Path) -> impl FnOnce(io::Error) -> BuildError + '_ {
        move |source| BuildError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// What a build did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BuildSummary {
    /// Pages written.
    pub pages: usize,
    /// Files copied verbatim.
    pub copied: usize,
    pub symlinks: usize,
    /// Pages that could not be built and were copied verbatim instead.
    pub fallbacks: usize,
    /// Files that could not be built, copied or linked.
    pub failed: usize,
}

pub struct SiteBuilder {
    config: Config,
    source_dir: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    templates: Option<TemplateContext>,
}

impl Default for SiteBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SiteBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            source_dir: None,
            output_dir: None,
            templates: None,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    // Override the directories named in the config
    pub fn source_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.source_dir = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn output_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.output_dir = Some(path.as_ref().to_path_buf());
        self
    }

    /// Use an existing template context. Rebuilding with the same context
    /// only recompiles layouts and includes that changed on disk.
    pub fn template_context(mut self, templates: TemplateContext) -> Self {
        self.templates = Some(templates);
        self
    }

    pub fn build(self) -> Result<Site, BuildError> {
        let source_dir = self.source_dir.unwrap_or_else(|| self.config.srcdir.clone());
        if !source_dir.is_dir() {
            return Err(BuildError::MissingSourceDir(source_dir));
        }
        let srcdir = std::fs::canonicalize(&source_dir).map_err(BuildError::io(&source_dir))?;

        let output_dir = self.output_dir.unwrap_or_else(|| self.config.outdir.clone());
        let outdir = fs::resolve(&srcdir, output_dir);
        let templatedir = fs::resolve(&srcdir, &self.config.templatedir);

        Ok(Site {
            config: self.config,
            srcdir,
            outdir,
            templatedir,
            templates: self.templates.unwrap_or_default(),
        })
    }
}

#[derive(Debug, Default)]
struct Scan {
    pages: Vec<(PathBuf, String, PageFormat)>,
    files: Vec<PathBuf>,
    symlinks: Vec<PathBuf>,
    failed: usize,
}

/// Outcome of handling one file.
enum Done {
    Written,
    Copied,
    Unchanged,
    Fallback,
    Failed,
}

pub struct Site {
    config: Config,
    srcdir: PathBuf,
    outdir: PathBuf,
    templatedir: PathBuf,
    templates: TemplateContext,
}

impl Site {
    pub fn source_dir(&self) -> &Path {
        &self.srcdir
    }

    pub fn output_dir(&self) -> &Path {
        &self.outdir
    }

    pub fn template_dir(&self) -> &Path {
        &self.templatedir
    }

    pub fn templates(&self) -> &TemplateContext {
        &self.templates
    }

    /// Build the whole site into the output directory.
    ///
    /// Failures of single files are logged and counted in the summary; only
    /// failing to scan the source directory aborts the build.
    pub async fn render_all(&self) -> Result<BuildSummary, BuildError> {
        let scan = self.scan()?;
        let mut summary = BuildSummary {
            failed: scan.failed,
            ..BuildSummary::default()
        };

        // Read page headers and copy everything else
        let reads = scan
            .pages
            .iter()
            .map(|(path, ext, format)| Page::read(&self.config, &self.srcdir, path, ext, *format));
        let copies = scan.files.iter().map(|path| self.copy_verbatim(path));
        let (reads, copies) = futures::join!(
            limited(reads, MAX_IN_FLIGHT),
            limited(copies, MAX_IN_FLIGHT)
        );
        tally(&mut summary, copies);

        let mut pages = Vec::with_capacity(reads.len());
        let mut fallbacks = Vec::new();
        for ((path, _, _), result) in scan.pages.iter().zip(reads) {
            match result {
                Ok(page) => pages.push(page),
                Err(PageError::Header(HeaderError::Malformed { .. })) => {
                    warn!(
                        "suspicious: {} starts with \"---\" but has no closing \"---\" line; \
                         treating it as a verbatim file",
                        self.relpath(path).display()
                    );
                    fallbacks.push(path);
                }
                Err(err) => {
                    error!(
                        "failed to build page {}: {err}; copying verbatim",
                        self.relpath(path).display()
                    );
                    fallbacks.push(path);
                }
            }
        }
        let copies = fallbacks.into_iter().map(|path| self.fallback(path));
        tally(&mut summary, limited(copies, MAX_IN_FLIGHT).await);

        let home = link_pages(&mut pages);
        if let Some(root) = home.or((!pages.is_empty()).then_some(0)) {
            debug!("page tree:\n{}", format_tree(&pages, root));
        }

        // Build pages
        info!("Building {} pages", pages.len());
        let summaries = page_values(&pages);
        let site = json!({
            "title": self.config.site_title,
            "home": home.map(|i| summaries[i].clone()),
            "pages": summaries.clone(),
        });
        let builds = pages.iter().zip(&summaries).map(|(page, summary)| {
            let env = page_env(summary, &site);
            async move {
                match self.build_page(page, env).await {
                    Ok(()) => Done::Written,
                    Err(err) => {
                        error!(
                            "failed to build page {}: {err}; copying verbatim",
                            self.relpath(&page.sfile).display()
                        );
                        self.fallback(&page.sfile).await
                    }
                }
            }
        });
        tally(&mut summary, limited(builds, MAX_IN_FLIGHT).await);

        // Symlinks last, their targets may be files copied above
        let links = scan.symlinks.iter().map(|path| self.copy_symlink(path));
        let links = limited(links, MAX_IN_FLIGHT).await;
        for linked in links {
            if linked {
                summary.symlinks += 1;
            } else {
                summary.failed += 1;
            }
        }

        info!(
            "Built {} pages, copied {} files into {}",
            summary.pages,
            summary.copied,
            self.outdir.display()
        );
        if summary.fallbacks > 0 {
            warn!("{} pages could not be built and were copied verbatim", summary.fallbacks);
        }
        Ok(summary)
    }

    fn scan(&self) -> Result<Scan, BuildError> {
        let mut scan = Scan::default();
        let walker = WalkDir::new(&self.srcdir)
            .follow_links(!self.config.verbatim_symlinks)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !self.skip(e));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) if err.depth() == 0 => {
                    return Err(BuildError::Scan {
                        path: self.srcdir.clone(),
                        source: err,
                    });
                }
                Err(err) => {
                    error!("skipping {}", err);
                    scan.failed += 1;
                    continue;
                }
            };

            let file_type = entry.file_type();
            let path = entry.into_path();
            if file_type.is_symlink() {
                scan.symlinks.push(path);
            } else if file_type.is_file() {
                match self.config.page_format(&path) {
                    Some((ext, format)) => scan.pages.push((path, ext, format)),
                    None => scan.files.push(path),
                }
            }
        }

        debug!(
            "Found {} pages, {} files and {} symlinks in {}",
            scan.pages.len(),
            scan.files.len(),
            scan.symlinks.len(),
            self.srcdir.display()
        );
        Ok(scan)
    }

    /// Dotfiles, the template directory and the output directory are never
    /// part of the site.
    fn skip(&self, entry: &DirEntry) -> bool {
        entry.file_name().to_string_lossy().starts_with('.')
            || entry.path() == self.templatedir
            || entry.path() == self.outdir
    }

    async fn build_page(&self, page: &Page, mut env: Map<String, Value>) -> Result<(), BuildError> {
        let body = page.read_body().await?;

        let content = match page.format {
            PageFormat::Md => {
                let source = String::from_utf8_lossy(&body);
                markdown_to_html(&source, &self.config.syntax_theme).into_bytes()
            }
            PageFormat::Xml if contains(&body, b"<?") && contains(&body, b"?>") => {
                let source = String::from_utf8_lossy(&body);
                let template = self
                    .templates
                    .compile(&source, &page.sfile.display().to_string())?;
                template.eval(&Props::with_env(env.clone())).await?.into_bytes()
            }
            PageFormat::Xml => body,
        };

        let output = match page.layout(&self.config.default_layout) {
            Some(layout) => {
                let content = String::from_utf8_lossy(&content).into_owned();
                env.insert("content".to_string(), Value::String(content));
                let path = self.templatedir.join(format!("{layout}.html"));
                self.templates
                    .eval_file(&path, &Props::with_env(env))
                    .await?
                    .into_bytes()
            }
            None => content,
        };

        let ofile = self.outdir.join(&page.ofile);
        info!("Write {} -> {}", self.relpath(&page.sfile).display(), page.ofile.display());
        fs::write_file(&ofile, &output).await.map_err(BuildError::io(&ofile))
    }

    /// Copy a file into the same place under the output directory, unless
    /// the copy there is already up to date.
    async fn copy_verbatim(&self, sfile: &Path) -> Done {
        let rel = self.relpath(sfile);
        let ofile = self.outdir.join(rel);
        let result = async {
            if !fs::is_stale(sfile, &ofile).await.map_err(BuildError::io(sfile))? {
                return Ok(false);
            }
            info!("Copy {} -> {}", rel.display(), ofile.display());
            fs::copy_file(sfile, &ofile).await.map_err(BuildError::io(&ofile))?;
            Ok::<_, BuildError>(true)
        };
        match result.await {
            Ok(true) => Done::Copied,
            Ok(false) => Done::Unchanged,
            Err(err) => {
                error!("failed to copy {}: {err}", rel.display());
                Done::Failed
            }
        }
    }

    /// Copy a page that could not be built.
    async fn fallback(&self, sfile: &Path) -> Done {
        match self.copy_verbatim(sfile).await {
            Done::Failed => Done::Failed,
            _ => Done::Fallback,
        }
    }

    async fn copy_symlink(&self, sfile: &Path) -> bool {
        let rel = self.relpath(sfile);
        match fs::copy_symlink(sfile, &self.outdir.join(rel)).await {
            Ok(target) => {
                info!("Link {} -> {}", rel.display(), target.display());
                true
            }
            Err(err) => {
                error!("failed to link {}: {err}", rel.display());
                false
            }
        }
    }

    fn relpath<'a>(&self, path: &'a Path) -> &'a Path {
        path.strip_prefix(&self.srcdir).unwrap_or(path)
    }
}

fn tally(summary: &mut BuildSummary, results: Vec<Done>) {
    for done in results {
        match done {
            Done::Written => summary.pages += 1,
            Done::Copied => summary.copied += 1,
            Done::Unchanged => {}
            Done::Fallback => summary.fallbacks += 1,
            Done::Failed => summary.failed += 1,
        }
    }
}

/// Run `futures` with at most `limit` of them pending at once. Outputs keep
/// the input order.
async fn limited<I>(futures: I, limit: usize) -> Vec<<I::Item as Future>::Output>
where
    I: IntoIterator,
    I::Item: Future,
{
    stream::iter(futures).buffered(limit).collect().await
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Sort pages by URL and connect each page to the nearest `index.html` above
/// it in the output tree. Returns the index of the home page.
fn link_pages(pages: &mut [Page]) -> Option<usize> {
    pages.sort_by(|a, b| a.url.cmp(&b.url));

    let mut by_ofile: HashMap<&Path, usize> = HashMap::new();
    for (i, page) in pages.iter().enumerate() {
        match by_ofile.entry(page.ofile.as_path()) {
            Entry::Occupied(existing) => warn!(
                "Conflict: output file {} generated by both {} and {}",
                page.ofile.display(),
                pages[*existing.get()].sfile.display(),
                page.sfile.display()
            ),
            Entry::Vacant(slot) => {
                slot.insert(i);
            }
        }
    }

    let mut home = None;
    let mut links = Vec::new();
    for (i, page) in pages.iter().enumerate() {
        if page.ofile == Path::new("index.html") {
            home = Some(i);
            continue;
        }
        let mut dir = page.ofile.parent();
        if page.ofile.file_name().is_some_and(|n| n == "index.html") {
            dir = dir.and_then(Path::parent);
        }
        while let Some(d) = dir {
            if let Some(&parent) = by_ofile.get(d.join("index.html").as_path()) {
                links.push((i, parent));
                break;
            }
            dir = d.parent();
        }
    }

    for (child, parent) in links {
        pages[child].parent = Some(parent);
        pages[parent].children.push(child);
    }
    home
}

/// Template-visible page values, with tree links expressed as URLs.
fn page_values(pages: &[Page]) -> Vec<Value> {
    pages
        .iter()
        .map(|page| {
            let mut value = page.summary();
            if let Value::Object(map) = &mut value {
                let parent = page.parent.map(|p| Value::String(pages[p].url.clone()));
                let children: Vec<Value> = page
                    .children
                    .iter()
                    .map(|&c| json!({"title": pages[c].title, "url": pages[c].url}))
                    .collect();
                map.insert("parent".to_string(), parent.unwrap_or(Value::Null));
                map.insert("children".to_string(), Value::Array(children));
            }
            value
        })
        .collect()
}

fn page_env(summary: &Value, site: &Value) -> Map<String, Value> {
    let mut env = match summary {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    env.insert("site".to_string(), site.clone());
    env
}

fn format_tree(pages: &[Page], root: usize) -> String {
    fn visit(pages: &[Page], i: usize, depth: usize, out: &mut String) {
        out.push_str(&format!("{}• {}\n", "  ".repeat(depth), pages[i].title));
        for &child in &pages[i].children {
            visit(pages, child, depth + 1, out);
        }
    }
    let mut out = String::new();
    visit(pages, root, 0, &mut out);
    out
}
