use anyhow::Result;
use clap::{ArgMatches, Command};
use kiln_core::{Site, TemplateContext};
use notify_debouncer_mini::{DebounceEventResult, new_debouncer};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::build::{self, add_build_args};
use crate::config::KilnConfig;

pub fn make_subcommand() -> Command {
    add_build_args(Command::new("watch")).about("Build the site and rebuild it when sources change")
}

pub async fn execute(args: &ArgMatches) -> Result<()> {
    let config = KilnConfig::load(args)?;
    // Layouts and includes stay compiled between builds
    let templates = TemplateContext::default();
    let mut site = build::site(&config, templates.clone())?;
    rebuild(&site).await;

    let config_file = std::path::absolute(&config.config)?;
    let config_file = config_file.canonicalize().unwrap_or(config_file);
    let (tx, mut rx) = mpsc::channel(100);

    let mut debouncer = new_debouncer(Duration::from_millis(500), move |res: DebounceEventResult| {
        match res {
            Ok(events) => {
                for event in events {
                    let _ = tx.blocking_send(event.path);
                }
            }
            Err(err) => error!("watch error: {err}"),
        }
    })?;

    debouncer
        .watcher()
        .watch(site.source_dir(), notify::RecursiveMode::Recursive)?;
    info!("Watching {}", site.source_dir().display());

    if config_file.exists() && !config_file.starts_with(site.source_dir()) {
        debouncer
            .watcher()
            .watch(&config_file, notify::RecursiveMode::NonRecursive)?;
        info!("Watching config file {}", config_file.display());
    }

    while let Some(path) = rx.recv().await {
        // Collect the rest of the batch
        let mut changed = vec![path];
        while let Ok(path) = rx.try_recv() {
            changed.push(path);
        }
        changed.retain(|path| is_source_change(&site, path));
        if changed.is_empty() {
            continue;
        }
        for path in &changed {
            debug!("Changed: {}", path.display());
        }

        if changed.contains(&config_file) {
            info!("Reloading {}", config_file.display());
            match KilnConfig::load(args).and_then(|c| build::site(&c, templates.clone())) {
                Ok(new_site) => site = new_site,
                Err(err) => {
                    error!("failed to reload configuration: {err:#}");
                    continue;
                }
            }
        }

        rebuild(&site).await;
    }

    Ok(())
}

async fn rebuild(site: &Site) {
    match site.render_all().await {
        Ok(summary) if summary.failed > 0 || summary.fallbacks > 0 => error!(
            "{} pages were copied verbatim and {} files could not be written",
            summary.fallbacks, summary.failed
        ),
        Ok(_) => {}
        Err(err) => error!("build failed: {err}"),
    }
}

/// Changes under the output directory are our own writes.
fn is_source_change(site: &Site, path: &Path) -> bool {
    let path: PathBuf = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    !path.starts_with(site.output_dir())
}
