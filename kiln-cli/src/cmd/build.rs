use anyhow::{Result, bail};
use clap::{Arg, ArgAction, ArgMatches, Command};
use kiln_core::{Site, SiteBuilder, TemplateContext};

use crate::config::KilnConfig;

pub fn add_build_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("dir")
                .short('C')
                .long("directory")
                .value_name("DIR")
                .help("Source directory to build"),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("DIR")
                .help("Output directory for the generated site"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .help("Configuration file [default: <DIR>/kiln.toml]"),
        )
        .arg(
            Arg::new("dev")
                .short('g')
                .long("dev")
                .help("Log debug output")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("quiet")
                .long("quiet")
                .help("Only log warnings and errors")
                .action(ArgAction::SetTrue)
                .conflicts_with("dev"),
        )
}

pub fn make_subcommand() -> Command {
    add_build_args(Command::new("build")).about("Build the site once")
}

/// Set up a site from the layered configuration.
pub fn site(config: &KilnConfig, templates: TemplateContext) -> Result<Site> {
    let site = SiteBuilder::new()
        .config(config.site_config()?)
        .template_context(templates)
        .build()?;
    Ok(site)
}

pub async fn execute(args: &ArgMatches) -> Result<()> {
    let config = KilnConfig::load(args)?;
    let site = site(&config, TemplateContext::default())?;

    let summary = site.render_all().await?;
    if summary.failed > 0 || summary.fallbacks > 0 {
        bail!(
            "{} pages were copied verbatim and {} files could not be written",
            summary.fallbacks,
            summary.failed
        );
    }
    Ok(())
}
