use std::fs;
use std::path::Path;

use kiln_core::{Config, SiteBuilder, TemplateContext};
use tempfile::TempDir;

fn write(root: &Path, rel: &str, contents: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

fn fixture() -> TempDir {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    write(
        root,
        "_templates/default.html",
        "<html><title><?= title ?> | <?= site.title ?></title>\n\
         <? include('nav.html') -?>\n<main><? print(content) ?></main></html>\n",
    );
    write(
        root,
        "_templates/nav.html",
        "<nav><? for p in site.pages { ?><a href=\"<?= p.url ?>\"><?= p.title ?></a><? } ?></nav>",
    );
    write(root, "index.md", "---\ntitle: Welcome\n---\n# Hello\n");
    write(root, "docs/index.md", "---\n---\nDocs home\n");
    write(root, "docs/page.html", "---\nlayout: none\n---\n<p><?= 1 + 1 ?></p>");
    write(root, "style.css", "body {}");
    write(root, ".hidden", "secret");
    write(root, "broken.md", "---\ntags: [1,\n---\nbody");
    write(root, "bad.html", "---\nlayout: none\n---\n<?= nope ?>");
    write(root, "large.md", &format!("---\n{}", "line\n".repeat(500)));
    dir
}

#[tokio::test]
async fn builds_pages_layouts_and_copies() {
    let dir = fixture();
    let site = SiteBuilder::new().source_dir(dir.path()).build().unwrap();
    let summary = site.render_all().await.unwrap();
    let out = site.output_dir();

    let index = fs::read_to_string(out.join("index.html")).unwrap();
    assert!(index.contains("<title>Welcome | Site title</title>"), "{index}");
    assert!(index.contains("<h1>Hello</h1>"), "{index}");
    assert!(index.contains("<a href=\"/\">Welcome</a>"), "{index}");
    assert!(index.contains("<a href=\"/docs/\">Docs</a>"), "{index}");

    let docs = fs::read_to_string(out.join("docs/index.html")).unwrap();
    assert!(docs.contains("<title>Docs | Site title</title>"), "{docs}");
    assert!(docs.contains("<p>Docs home</p>"), "{docs}");

    assert_eq!(fs::read_to_string(out.join("docs/page.html")).unwrap(), "<p>2</p>");
    assert_eq!(fs::read_to_string(out.join("style.css")).unwrap(), "body {}");
    assert!(!out.join(".hidden").exists());
    assert!(!out.join("_templates").exists());

    // Pages that fail to build are copied as they are
    assert_eq!(
        fs::read_to_string(out.join("broken.md")).unwrap(),
        "---\ntags: [1,\n---\nbody"
    );
    assert_eq!(
        fs::read_to_string(out.join("bad.html")).unwrap(),
        "---\nlayout: none\n---\n<?= nope ?>"
    );
    assert!(out.join("large.md").exists());
    assert!(!out.join("large.html").exists());

    assert_eq!(summary.pages, 3);
    assert_eq!(summary.copied, 1);
    assert_eq!(summary.fallbacks, 3);
    assert_eq!(summary.failed, 0);
}

#[tokio::test]
async fn rebuild_skips_unchanged_files_and_reuses_templates() {
    let dir = fixture();
    let templates = TemplateContext::default();

    let site = SiteBuilder::new()
        .source_dir(dir.path())
        .template_context(templates.clone())
        .build()
        .unwrap();
    site.render_all().await.unwrap();
    assert_eq!(templates.cached(), 2);

    let again = site.render_all().await.unwrap();
    assert_eq!(again.pages, 3);
    assert_eq!(again.copied, 0);
    // Pages that failed still fail, even when their copy is up to date
    assert_eq!(again.fallbacks, 3);
    assert_eq!(templates.cached(), 2);
}

#[tokio::test]
async fn custom_output_dir_and_config() {
    let dir = fixture();
    let out = TempDir::new().unwrap();
    let config = Config {
        site_title: "Handbook".to_string(),
        base_url: "/book/".to_string(),
        ..Config::default()
    };

    let site = SiteBuilder::new()
        .config(config)
        .source_dir(dir.path())
        .output_dir(out.path())
        .build()
        .unwrap();
    site.render_all().await.unwrap();

    let index = fs::read_to_string(out.path().join("index.html")).unwrap();
    assert!(index.contains("<title>Welcome | Handbook</title>"), "{index}");
    assert!(index.contains("<a href=\"/book/docs/\">Docs</a>"), "{index}");
    assert!(!dir.path().join("_build").exists());
}

#[tokio::test]
async fn builds_many_pages() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    write(root, "_templates/default.html", "<main><? print(content) ?></main>");
    for i in 0..600 {
        write(root, &format!("s{}/p{i}.md", i % 10), &format!("---\ntitle: P{i}\n---\nPage {i}\n"));
        write(root, &format!("s{}/p{i}.css", i % 10), "p {}");
    }

    let site = SiteBuilder::new().source_dir(root).build().unwrap();
    let summary = site.render_all().await.unwrap();
    assert_eq!(summary.pages, 600);
    assert_eq!(summary.copied, 600);
    assert_eq!(summary.fallbacks, 0);
    assert_eq!(summary.failed, 0);

    let page = fs::read_to_string(site.output_dir().join("s3/p123.html")).unwrap();
    assert_eq!(page, "<main><p>Page 123</p>\n</main>");
}

#[tokio::test]
async fn missing_source_dir() {
    let dir = TempDir::new().unwrap();
    let result = SiteBuilder::new().source_dir(dir.path().join("nope")).build();
    assert!(result.is_err());
}

#[cfg(unix)]
#[tokio::test]
async fn symlinks_are_recreated() {
    let dir = fixture();
    std::os::unix::fs::symlink("style.css", dir.path().join("alias.css")).unwrap();

    let site = SiteBuilder::new().source_dir(dir.path()).build().unwrap();
    let summary = site.render_all().await.unwrap();

    let link = site.output_dir().join("alias.css");
    assert_eq!(fs::read_link(&link).unwrap(), Path::new("style.css"));
    assert_eq!(fs::read_to_string(&link).unwrap(), "body {}");
    assert_eq!(summary.symlinks, 1);
}
