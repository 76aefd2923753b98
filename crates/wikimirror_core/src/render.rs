//! Deterministic HTML for pages, category indexes and the front page.
//!
//! Index entries are emitted one per line as `<li id="<slug>">` so that a
//! single entry can be swapped without touching its siblings.

use std::fmt::Write as _;

use html_escape::{encode_double_quoted_attribute, encode_text};

use crate::category::{CategoryIndex, CategoryStrategy, IndexEntry};
use crate::config::MirrorConfig;
use crate::frontpage::FrontPage;
use crate::materialize::Page;

pub const MOVED_NOTICE_CLASS: &str = "moved-notice";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavLink {
    pub label: String,
    pub href: String,
}

/// One link per category that gets an index page.
pub fn nav_links(config: &MirrorConfig) -> Vec<NavLink> {
    config
        .category_infos()
        .into_iter()
        .filter(|info| info.index)
        .map(|info| NavLink {
            href: format!("/{}.html", info.label_slug),
            label: info.label,
        })
        .collect()
}

pub trait Renderer: Send + Sync {
    fn render_page(&self, page: &Page) -> String;
    /// The `<li>` snippet for one index member; must be what
    /// `render_category_index` emits for the same entry.
    fn render_index_entry(&self, entry: &IndexEntry) -> String;
    fn render_category_index(&self, index: &CategoryIndex) -> String;
    fn render_front_page(&self, front: &FrontPage) -> String;
    fn render_moved_notice(&self, target_title: &str, target_url: &str) -> String;
}

#[derive(Debug, Clone, Default)]
pub struct HtmlRenderer {
    nav: Vec<NavLink>,
}

impl HtmlRenderer {
    pub fn new(nav: Vec<NavLink>) -> Self {
        Self { nav }
    }

    pub fn from_config(config: &MirrorConfig) -> Self {
        Self::new(nav_links(config))
    }

    fn layout(&self, title: &str, body: &str) -> String {
        let mut nav = String::from("<nav>\n<a href=\"/\">Home</a>\n");
        for link in &self.nav {
            let _ = writeln!(
                nav,
                "<a href=\"{}\">{}</a>",
                encode_double_quoted_attribute(&link.href),
                encode_text(&link.label)
            );
        }
        nav.push_str("</nav>");

        format!(
            "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n<title>{}</title>\n</head>\n<body>\n{nav}\n<main>\n{body}</main>\n</body>\n</html>\n",
            encode_text(title)
        )
    }
}

impl Renderer for HtmlRenderer {
    fn render_page(&self, page: &Page) -> String {
        let mut body = String::new();
        let _ = writeln!(body, "<h1>{}</h1>", encode_text(&page.title));
        let _ = writeln!(body, "<article class=\"content\">\n{}\n</article>", page.html.trim_end());

        let metadata = &page.metadata;
        if !metadata.info.is_empty() {
            body.push_str("<dl class=\"info\">\n");
            for (key, value) in &metadata.info {
                let _ = writeln!(body, "<dt>{}</dt><dd>{}</dd>", encode_text(key), encode_text(value));
            }
            body.push_str("</dl>\n");
        }
        if let Some(tool) = &metadata.tool {
            let _ = writeln!(
                body,
                "<p class=\"repository\"><a href=\"{}\">{}/{}</a> ({}, {})</p>",
                encode_double_quoted_attribute(&tool.url()),
                encode_text(&tool.user),
                encode_text(&tool.repo),
                encode_text(&tool.branch),
                encode_text(&tool.file)
            );
        }
        if !metadata.backlinks.is_empty() {
            body.push_str("<section class=\"backlinks\">\n<h2>What links here</h2>\n<ul>\n");
            for backlink in &metadata.backlinks {
                let _ = writeln!(
                    body,
                    "<li><a href=\"/{}\">{}</a></li>",
                    encode_double_quoted_attribute(&backlink.slug),
                    encode_text(&backlink.title)
                );
            }
            body.push_str("</ul>\n</section>\n");
        }

        let mut footer = Vec::new();
        if let Some(created) = &metadata.created_at {
            footer.push(format!("Created <time>{}</time>", encode_text(created)));
        }
        if let Some(modified) = &metadata.modified_at {
            footer.push(format!("Last modified <time>{}</time>", encode_text(modified)));
        }
        if !footer.is_empty() {
            let _ = writeln!(body, "<footer class=\"meta\">{}</footer>", footer.join(" · "));
        }

        self.layout(&page.title, &body)
    }

    fn render_index_entry(&self, entry: &IndexEntry) -> String {
        let page = &entry.page;
        let mut item = format!(
            "<li id=\"{}\" class=\"entry\"><a href=\"/{}\">{}</a>",
            encode_double_quoted_attribute(&page.slug),
            encode_double_quoted_attribute(&page.slug),
            encode_text(&page.title)
        );
        let info = &page.metadata.info;
        match entry.strategy {
            CategoryStrategy::Events => {
                for key in ["date", "time", "location"] {
                    item.push_str(&detail_span(key, info.get(key)));
                }
            }
            CategoryStrategy::Collaborators => {
                item.push_str(&detail_span("type", info.get("type")));
                item.push_str(&detail_span("people", info.get("peopleorganisations")));
            }
            CategoryStrategy::Tools => {
                if let Some(tool) = &page.metadata.tool {
                    let _ = write!(
                        item,
                        " <a class=\"repo\" href=\"{}\">{}/{}</a>",
                        encode_double_quoted_attribute(&tool.url()),
                        encode_text(&tool.user),
                        encode_text(&tool.repo)
                    );
                }
            }
            CategoryStrategy::Publishing | CategoryStrategy::Generic => {
                if let Some(created) = &page.metadata.created_at {
                    let day = created.get(..10).unwrap_or(created.as_str());
                    let _ = write!(
                        item,
                        " <time datetime=\"{}\">{}</time>",
                        encode_double_quoted_attribute(created),
                        encode_text(day)
                    );
                }
            }
        }
        item.push_str("</li>");
        item
    }

    fn render_category_index(&self, index: &CategoryIndex) -> String {
        let mut body = String::new();
        let _ = writeln!(body, "<h1>{}</h1>", encode_text(&index.info.label));
        for section in &index.sections {
            let _ = writeln!(body, "<section class=\"{}\">", section.key);
            if let Some(heading) = section.heading {
                let _ = writeln!(body, "<h2>{heading}</h2>");
            }
            body.push_str("<ul class=\"index\">\n");
            for entry in &section.entries {
                body.push_str(&self.render_index_entry(entry));
                body.push('\n');
            }
            body.push_str("</ul>\n</section>\n");
        }
        self.layout(&index.info.label, &body)
    }

    fn render_front_page(&self, front: &FrontPage) -> String {
        let home = &front.home;
        let mut body = String::new();
        let _ = writeln!(body, "<h1>{}</h1>", encode_text(&home.title));
        let _ = writeln!(body, "<article class=\"content\">\n{}\n</article>", home.html.trim_end());

        if !front.highlights.is_empty() {
            body.push_str("<section class=\"highlights\">\n<h2>Highlights</h2>\n<ul class=\"index\">\n");
            for entry in &front.highlights {
                body.push_str(&self.render_index_entry(entry));
                body.push('\n');
            }
            body.push_str("</ul>\n</section>\n");
        }
        if !front.upcoming.is_empty() {
            body.push_str("<section class=\"upcoming\">\n<h2>Upcoming events</h2>\n<ul class=\"index\">\n");
            for item in &front.upcoming {
                body.push_str(item.trim());
                body.push('\n');
            }
            body.push_str("</ul>\n</section>\n");
        }
        self.layout(&home.title, &body)
    }

    fn render_moved_notice(&self, target_title: &str, target_url: &str) -> String {
        format!(
            "<p class=\"{MOVED_NOTICE_CLASS}\">This page has been moved to <a href=\"{}\">{}</a>.</p>",
            encode_double_quoted_attribute(target_url),
            encode_text(target_title)
        )
    }
}

fn detail_span(class: &str, value: Option<&String>) -> String {
    match value.filter(|value| !value.is_empty()) {
        Some(value) => format!(" <span class=\"{class}\">{}</span>", encode_text(value)),
        None => String::new(),
    }
}
