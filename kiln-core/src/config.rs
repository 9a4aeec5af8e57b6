use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::markdown::DEFAULT_SYNTAX_THEME;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("TOML parse error: {0}")]
    Parsing(#[from] toml::de::Error),
}

/// How a page source is turned into HTML.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PageFormat {
    /// Markdown, converted to HTML.
    Md,
    /// HTML or XML, evaluated as a template.
    Xml,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Directory to build.
    pub srcdir: PathBuf,
    /// Output directory, relative to `srcdir`.
    pub outdir: PathBuf,
    /// Layout and include templates, relative to `srcdir`.
    pub templatedir: PathBuf,
    /// Layout used by pages with a header that don't name one.
    pub default_layout: String,
    pub base_url: String,
    pub site_title: String,
    /// Recreate symlinks in the output instead of copying what they point to.
    pub verbatim_symlinks: bool,
    pub syntax_theme: String,
    /// Lowercase file extensions (with the leading dot) treated as pages.
    pub page_exts: BTreeMap<String, PageFormat>,
}

impl Default for Config {
    fn default() -> Self {
        let page_exts = [
            (".md", PageFormat::Md),
            (".mdown", PageFormat::Md),
            (".markdown", PageFormat::Md),
            (".html", PageFormat::Xml),
            (".htm", PageFormat::Xml),
            (".xml", PageFormat::Xml),
        ]
        .into_iter()
        .map(|(ext, format)| (ext.to_string(), format))
        .collect();

        Self {
            srcdir: PathBuf::from("."),
            outdir: PathBuf::from("_build"),
            templatedir: PathBuf::from("_templates"),
            default_layout: "default".to_string(),
            base_url: "/".to_string(),
            site_title: "Site title".to_string(),
            verbatim_symlinks: true,
            syntax_theme: DEFAULT_SYNTAX_THEME.to_string(),
            page_exts,
        }
    }
}

impl Config {
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&data)?;

        Ok(config)
    }

    /// Page format for a file, judged by its extension.
    pub fn page_format(&self, path: &Path) -> Option<(String, PageFormat)> {
        let ext = format!(".{}", path.extension()?.to_str()?.to_lowercase());
        let format = *self.page_exts.get(&ext)?;
        Some((ext, format))
    }
}
