use anyhow::{Context, Result};
use clap::ArgMatches;
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "kiln.toml";

/// Complete configuration that merges CLI args, env vars, config files, and defaults
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KilnConfig {
    /// Directory to build
    pub srcdir: String,
    /// Output directory, relative to `srcdir`
    pub outdir: String,
    /// Layout templates, relative to `srcdir`
    pub templatedir: String,
    pub default_layout: String,
    pub base_url: String,
    pub site_title: String,
    pub verbatim_symlinks: bool,
    pub syntax_theme: String,
    /// Configuration file path; `<srcdir>/kiln.toml` when empty
    pub config: String,
    /// Verbose logging
    pub dev: bool,
    /// Only log warnings and errors
    pub quiet: bool,
}

impl Default for KilnConfig {
    fn default() -> Self {
        let site = kiln_core::Config::default();
        Self {
            srcdir: site.srcdir.to_string_lossy().into_owned(),
            outdir: site.outdir.to_string_lossy().into_owned(),
            templatedir: site.templatedir.to_string_lossy().into_owned(),
            default_layout: site.default_layout,
            base_url: site.base_url,
            site_title: site.site_title,
            verbatim_symlinks: site.verbatim_symlinks,
            syntax_theme: site.syntax_theme,
            config: String::new(),
            dev: false,
            quiet: false,
        }
    }
}

impl KilnConfig {
    /// Load configuration with cascading precedence:
    /// 1. CLI arguments (highest priority)
    /// 2. Environment variables (KILN_*)
    /// 3. Configuration file
    /// 4. Defaults (lowest priority)
    pub fn load(args: &ArgMatches) -> Result<Self> {
        let srcdir = arg(args, "dir").unwrap_or_else(|| ".".to_string());
        let config_file = arg(args, "config")
            .map(PathBuf::from)
            .unwrap_or_else(|| Path::new(&srcdir).join(CONFIG_FILE));

        let mut builder = ConfigBuilder::builder();

        // 1. Start with defaults
        let defaults = Self::default();
        builder = builder.add_source(ConfigBuilder::try_from(&defaults)?);

        // 2. Add configuration file if it exists
        if config_file.exists() {
            builder =
                builder.add_source(File::from(config_file.as_path()).format(FileFormat::Toml));
        }

        // 3. Add environment variables with KILN_ prefix
        builder = builder.add_source(
            Environment::with_prefix("KILN")
                .prefix_separator("_")
                .separator("__"),
        );

        // 4. Override with CLI arguments (highest priority)
        let mut cli_overrides = HashMap::new();
        cli_overrides.insert("config".to_string(), config_file.to_string_lossy().into_owned());
        if let Some(dir) = arg(args, "dir") {
            cli_overrides.insert("srcdir".to_string(), dir);
        }
        // Relative to the working directory, unlike `outdir` from a file
        if let Some(output) = arg(args, "output") {
            let output = std::path::absolute(&output)
                .with_context(|| format!("invalid output directory {output}"))?;
            cli_overrides.insert("outdir".to_string(), output.to_string_lossy().into_owned());
        }
        if flag(args, "dev") {
            cli_overrides.insert("dev".to_string(), "true".to_string());
        }
        if flag(args, "quiet") {
            cli_overrides.insert("quiet".to_string(), "true".to_string());
        }
        builder = builder.add_source(ConfigBuilder::try_from(&cli_overrides)?);

        let config = builder.build()?;
        let kiln_config: KilnConfig = config.try_deserialize()?;

        Ok(kiln_config)
    }

    /// Site configuration for kiln-core.
    ///
    /// Settings that only make sense in a file, like the page extension
    /// table, come from the config file; everything else from the layered
    /// settings above.
    pub fn site_config(&self) -> Result<kiln_core::Config> {
        let path = Path::new(&self.config);
        let mut site = if !self.config.is_empty() && path.exists() {
            kiln_core::Config::read(path)
                .with_context(|| format!("failed to read {}", path.display()))?
        } else {
            kiln_core::Config::default()
        };

        site.srcdir = PathBuf::from(&self.srcdir);
        site.outdir = PathBuf::from(&self.outdir);
        site.templatedir = PathBuf::from(&self.templatedir);
        site.default_layout = self.default_layout.clone();
        site.base_url = self.base_url.clone();
        site.site_title = self.site_title.clone();
        site.verbatim_symlinks = self.verbatim_symlinks;
        site.syntax_theme = self.syntax_theme.clone();
        Ok(site)
    }
}

// Commands only define some of the arguments
fn arg(args: &ArgMatches, name: &str) -> Option<String> {
    args.try_get_one::<String>(name).ok().flatten().cloned()
}

fn flag(args: &ArgMatches, name: &str) -> bool {
    args.try_get_one::<bool>(name)
        .ok()
        .flatten()
        .copied()
        .unwrap_or(false)
}
