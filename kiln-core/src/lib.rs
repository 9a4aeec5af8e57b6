pub mod builder;
pub mod config;
pub mod frontmatter;
pub mod fs;
pub mod header;
pub mod markdown;
pub mod page;
pub mod template;

// Re-export main types
pub use builder::{BuildError, BuildSummary, Site, SiteBuilder};
pub use config::{Config, PageFormat};
pub use frontmatter::{FrontMatter, FrontMatterError, parse_front_matter};
pub use markdown::markdown_to_html;
pub use page::{Page, PageError};
pub use template::{
    IoWriter, Props, SharedEnv, Template, TemplateContext, TemplateError, Writer,
};
