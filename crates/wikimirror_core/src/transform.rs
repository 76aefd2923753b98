use std::cell::Cell;
use std::collections::BTreeMap;

use anyhow::{Context, Result};
use html_escape::{decode_html_entities, encode_double_quoted_attribute, encode_text};
use lol_html::{RewriteStrSettings, element, rewrite_str};
use regex::Regex;
use reqwest::Url;
use scraper::Html;

use crate::config::MirrorConfig;
use crate::dom::{self, AnchorEdit, selector};
use crate::fetch::RemoteContent;
use crate::title::slugify;

/// Info-table rows worth keeping, as they appear in the wiki's templates.
pub const INFO_KEYS: [&str; 6] = [
    "Name",
    "Location",
    "Date",
    "Time",
    "PeopleOrganisations",
    "Type",
];

const DEFAULT_TOOL_HOST: &str = "github";
const DEFAULT_TOOL_BRANCH: &str = "main";
const DEFAULT_TOOL_FILE: &str = "README.md";

const TOOL_TAG_PATTERN: &str = r"&lt;tool\b(.*?)/?&gt;";
const TOOL_ATTRIBUTE_PATTERN: &str = r#"(\w+)\s*=\s*["']([^"']*)["']"#;

/// External repository a tool page documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoReference {
    pub host: String,
    pub user: String,
    pub repo: String,
    pub branch: String,
    pub file: String,
}

impl RepoReference {
    pub fn url(&self) -> String {
        let host = match self.host.as_str() {
            "github" => "github.com",
            "gitlab" => "gitlab.com",
            "codeberg" => "codeberg.org",
            other => other,
        };
        format!("https://{host}/{}/{}", self.user, self.repo)
    }

    fn from_attributes(raw: &str, attribute: &Regex) -> Option<Self> {
        let decoded = decode_html_entities(raw);
        let mut attributes = BTreeMap::new();
        for capture in attribute.captures_iter(&decoded) {
            attributes.insert(capture[1].to_string(), capture[2].trim().to_string());
        }
        let mut take = |key: &str| attributes.remove(key).filter(|value| !value.is_empty());
        Some(Self {
            user: take("user")?,
            repo: take("repo")?,
            host: take("host").unwrap_or_else(|| DEFAULT_TOOL_HOST.to_string()),
            branch: take("branch").unwrap_or_else(|| DEFAULT_TOOL_BRANCH.to_string()),
            file: take("file").unwrap_or_else(|| DEFAULT_TOOL_FILE.to_string()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransformedContent {
    pub html: String,
    /// Category slugs, never empty once the fallback applies.
    pub categories: Vec<String>,
    pub images: Vec<String>,
    pub info: BTreeMap<String, String>,
    pub tool: Option<RepoReference>,
}

/// Turns upstream page HTML into mirror-ready HTML plus metadata.
pub trait Transformer: Send + Sync {
    fn transform(
        &self,
        content: &RemoteContent,
        redirect_target: Option<&str>,
    ) -> Result<TransformedContent>;
}

#[derive(Debug, Clone)]
pub struct DefaultTransformer {
    wiki_url: Option<String>,
    fallback_category: Option<String>,
    tool_tag: Regex,
    tool_attribute: Regex,
}

impl DefaultTransformer {
    pub fn from_config(config: &MirrorConfig) -> Result<Self> {
        Ok(Self {
            wiki_url: config.wiki_url(),
            fallback_category: config.fallback_category().map(|info| info.slug),
            tool_tag: Regex::new(TOOL_TAG_PATTERN).context("invalid tool tag pattern")?,
            tool_attribute: Regex::new(TOOL_ATTRIBUTE_PATTERN)
                .context("invalid tool attribute pattern")?,
        })
    }

    fn localize_href(&self, href: &str) -> AnchorEdit {
        let base = self.wiki_url.as_deref().unwrap_or_default();
        let relative = match self.wiki_url.as_deref() {
            Some(base) if !base.is_empty() => href.strip_prefix(base),
            _ => None,
        };

        if let Some(rest) = relative {
            if rest.starts_with("/index.php") {
                return self.localize_href(rest);
            }
            let last = rest.trim_end_matches('/').rsplit('/').next().unwrap_or_default();
            if last.is_empty() {
                return AnchorEdit::Retarget("/".to_string());
            }
            return AnchorEdit::Retarget(format!("/{}", slugify(&decode_component(last))));
        }

        if href.starts_with("/index.php") {
            if href.contains("=File:") {
                return if base.is_empty() {
                    AnchorEdit::Keep
                } else {
                    AnchorEdit::Retarget(format!("{base}{href}"))
                };
            }
            if let Some(title) = query_title(href) {
                let slug = slugify(&title);
                if !slug.is_empty() {
                    return AnchorEdit::Retarget(format!("/{slug}"));
                }
            }
        }
        AnchorEdit::Keep
    }

    /// Swaps each escaped `<tool .../>` marker for a link to its repository.
    /// The first well-formed marker becomes the page's repo reference.
    fn expand_tool_tags(&self, html: &str) -> (String, Option<RepoReference>) {
        let mut first = None;
        let expanded = self.tool_tag.replace_all(html, |capture: &regex::Captures<'_>| {
            match RepoReference::from_attributes(&capture[1], &self.tool_attribute) {
                Some(repo) => {
                    let link = format!(
                        "<a class=\"tool-repo\" href=\"{}\">{}/{}</a>",
                        encode_double_quoted_attribute(&repo.url()),
                        encode_text(&repo.user),
                        encode_text(&repo.repo),
                    );
                    first.get_or_insert(repo);
                    link
                }
                None => capture[0].to_string(),
            }
        });
        (expanded.into_owned(), first)
    }

    fn categories(&self, upstream: &[String]) -> Vec<String> {
        let mut categories = Vec::new();
        for name in upstream {
            let slug = slugify(name);
            if !slug.is_empty() && !categories.contains(&slug) {
                categories.push(slug);
            }
        }
        if categories.is_empty()
            && let Some(fallback) = &self.fallback_category
        {
            categories.push(fallback.clone());
        }
        categories
    }
}

impl Transformer for DefaultTransformer {
    fn transform(
        &self,
        content: &RemoteContent,
        redirect_target: Option<&str>,
    ) -> Result<TransformedContent> {
        let info = extract_info_table(&content.html)?;
        let mut html = if info.is_empty() {
            content.html.clone()
        } else {
            dom::remove_first(&content.html, "table")?
        };

        if let Some(rewritten) = dom::rewrite_anchor_hrefs(&html, |href| self.localize_href(href))? {
            html = rewritten;
        }
        if let Some(base) = self.wiki_url.as_deref() {
            html = absolutize_image_sources(&html, base)?;
        }

        let (html, tool) = self.expand_tool_tags(&html);
        let html = match redirect_target {
            Some(target) => format!(
                "<p class=\"redirect-notice\">Redirected to <a href=\"/{}\">{}</a>.</p>\n{html}",
                encode_double_quoted_attribute(&slugify(target)),
                encode_text(target),
            ),
            None => html,
        };

        Ok(TransformedContent {
            html,
            categories: self.categories(&content.categories),
            images: content.images.clone(),
            info,
            tool,
        })
    }
}

/// Reads `key::value` rows of the first table, keyed by lowercased name.
fn extract_info_table(html: &str) -> Result<BTreeMap<String, String>> {
    let fragment = Html::parse_fragment(html);
    let mut info = BTreeMap::new();
    let Some(table) = fragment.select(&selector("table")?).next() else {
        return Ok(info);
    };
    let header = selector("th")?;
    let cell = selector("td")?;
    for row in table.select(&selector("tr")?) {
        let Some(key) = row.select(&header).next() else {
            continue;
        };
        let key = key.text().collect::<String>().trim().to_string();
        if !INFO_KEYS.contains(&key.as_str()) {
            continue;
        }
        let Some(value) = row.select(&cell).next() else {
            continue;
        };
        let value = value.text().collect::<String>();
        let value = value.rsplit("::").next().unwrap_or_default().trim();
        info.insert(key.to_lowercase(), value.to_string());
    }
    Ok(info)
}

fn absolutize_image_sources(html: &str, base: &str) -> Result<String> {
    let changed = Cell::new(false);
    let output = rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: vec![element!("img[src]", |el| {
                let src = el.get_attribute("src").unwrap_or_default();
                if src.starts_with('/') && !src.starts_with("//") {
                    el.set_attribute("src", &format!("{base}{src}"))?;
                    changed.set(true);
                }
                Ok(())
            })],
            ..RewriteStrSettings::default()
        },
    )
    .context("failed to rewrite image sources")?;
    Ok(if changed.get() { output } else { html.to_string() })
}

/// `title` parameter of an `index.php` style URL, with underscores as spaces.
pub(crate) fn query_title(href: &str) -> Option<String> {
    let url = Url::parse("http://localhost/").ok()?.join(href).ok()?;
    url.query_pairs()
        .find(|(key, _)| key == "title")
        .map(|(_, value)| value.replace('_', " "))
}

fn decode_component(value: &str) -> String {
    Url::parse(&format!("http://localhost/?v={value}"))
        .ok()
        .and_then(|url| {
            url.query_pairs()
                .next()
                .map(|(_, decoded)| decoded.into_owned())
        })
        .unwrap_or_else(|| value.to_string())
}
