//! Surgical edits on generated documents.
//!
//! Lookups run on a parsed tree (`scraper`); edits stream through `lol_html`
//! so everything outside the touched element keeps its exact bytes.

use std::cell::Cell;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result, anyhow};
use lol_html::html_content::{ContentType, EndTag};
use lol_html::{EndTagHandler, RewriteStrSettings, element, rewrite_str};
use scraper::{Html, Selector};

/// Temporary attribute flagging elements for removal between passes.
const TRACE_MARKER: &str = "data-mirror-trace";
const TRACE_MARKER_SELECTOR: &str = "[data-mirror-trace]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnchorEdit {
    Keep,
    Retarget(String),
    Remove,
}

pub(crate) fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|err| anyhow!("invalid selector `{css}`: {err:?}"))
}

pub fn contains_id(html: &str, id: &str) -> Result<bool> {
    let document = Html::parse_document(html);
    let with_id = selector("[id]")?;
    Ok(document
        .select(&with_id)
        .any(|element| element.value().id() == Some(id)))
}

/// Outer HTML of every element matching `css`, in document order.
pub fn outer_html_of(html: &str, css: &str) -> Result<Vec<String>> {
    let document = Html::parse_document(html);
    let matcher = selector(css)?;
    Ok(document.select(&matcher).map(|element| element.html()).collect())
}

/// Replaces every element whose id is `id` with `replacement`.
/// `None` means nothing carried that id.
pub fn replace_node_by_id(html: &str, id: &str, replacement: &str) -> Result<Option<String>> {
    let replaced = Cell::new(0usize);
    let output = rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: vec![element!("[id]", |el| {
                if el.get_attribute("id").as_deref() == Some(id) {
                    el.replace(replacement, ContentType::Html);
                    replaced.set(replaced.get() + 1);
                }
                Ok(())
            })],
            ..RewriteStrSettings::default()
        },
    )
    .context("failed to patch document")?;
    Ok((replaced.get() > 0).then_some(output))
}

/// True when `href` points at the page `/slug`, with or without `.html`,
/// a query or a fragment.
pub fn href_targets_slug(href: &str, slug: &str) -> bool {
    if slug.is_empty() {
        return false;
    }
    let Some(rest) = href.strip_prefix('/').and_then(|rest| rest.strip_prefix(slug)) else {
        return false;
    };
    rest.is_empty() || rest.starts_with(['#', '?']) || rest.starts_with(".html")
}

/// Strips every trace of `slug`: list items whose id is the slug, and
/// anchors pointing at `/slug` together with the list item holding them.
/// Navigation links are left alone. `None` when the document was clean.
///
/// Matching and removal both run on the `lol_html` token stream, so
/// misnested markup cannot shift which element gets removed.
pub fn remove_nodes_matching(html: &str, slug: &str) -> Result<Option<String>> {
    let scan = scan_traces(html, slug)?;
    if scan.doomed_items.is_empty() && scan.doomed_anchors.is_empty() {
        return Ok(None);
    }
    let marked = mark_traces(html, &scan)?;
    let output = rewrite_str(
        &marked,
        RewriteStrSettings {
            element_content_handlers: vec![element!(TRACE_MARKER_SELECTOR, |el| {
                el.remove();
                Ok(())
            })],
            ..RewriteStrSettings::default()
        },
    )
    .context("failed to remove traces from document")?;
    Ok(Some(output))
}

#[derive(Debug, Default)]
struct TraceScan {
    open_items: Vec<usize>,
    doomed_items: BTreeSet<usize>,
    doomed_anchors: BTreeSet<usize>,
}

fn lock(scan: &Mutex<TraceScan>) -> MutexGuard<'_, TraceScan> {
    scan.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Numbers `li` and `a[href]` start tags in stream order and records which
/// of them are traces of `slug`.
fn scan_traces(html: &str, slug: &str) -> Result<TraceScan> {
    let nav_depth = Arc::new(AtomicUsize::new(0));
    let scan = Arc::new(Mutex::new(TraceScan::default()));
    let items_seen = Cell::new(0usize);
    let anchors_seen = Cell::new(0usize);
    rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: vec![
                element!("nav", |el| {
                    if let Some(handlers) = el.end_tag_handlers() {
                        nav_depth.fetch_add(1, Ordering::Relaxed);
                        let nav_depth = Arc::clone(&nav_depth);
                        handlers.push(Box::new(move |_end: &mut EndTag<'_>| {
                            nav_depth.fetch_sub(1, Ordering::Relaxed);
                            Ok(())
                        }) as EndTagHandler<'static>);
                    }
                    Ok(())
                }),
                element!("li", |el| {
                    let ordinal = items_seen.get();
                    items_seen.set(ordinal + 1);
                    if el.get_attribute("id").as_deref() == Some(slug) {
                        lock(&scan).doomed_items.insert(ordinal);
                    }
                    if let Some(handlers) = el.end_tag_handlers() {
                        lock(&scan).open_items.push(ordinal);
                        let scan = Arc::clone(&scan);
                        handlers.push(Box::new(move |_end: &mut EndTag<'_>| {
                            let mut state = lock(&scan);
                            if let Some(position) =
                                state.open_items.iter().rposition(|open| *open == ordinal)
                            {
                                state.open_items.remove(position);
                            }
                            Ok(())
                        }) as EndTagHandler<'static>);
                    }
                    Ok(())
                }),
                element!("a[href]", |el| {
                    let ordinal = anchors_seen.get();
                    anchors_seen.set(ordinal + 1);
                    let href = el.get_attribute("href").unwrap_or_default();
                    if nav_depth.load(Ordering::Relaxed) > 0 || !href_targets_slug(&href, slug) {
                        return Ok(());
                    }
                    let mut state = lock(&scan);
                    match state.open_items.last().copied() {
                        Some(item) => state.doomed_items.insert(item),
                        None => state.doomed_anchors.insert(ordinal),
                    };
                    Ok(())
                }),
            ],
            ..RewriteStrSettings::default()
        },
    )
    .context("failed to scan document for traces")?;
    let mut state = lock(&scan);
    Ok(std::mem::take(&mut *state))
}

/// Flags the scanned traces with a marker attribute, counting start tags
/// exactly as `scan_traces` did.
fn mark_traces(html: &str, scan: &TraceScan) -> Result<String> {
    let items_seen = Cell::new(0usize);
    let anchors_seen = Cell::new(0usize);
    rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: vec![
                element!("li", |el| {
                    let ordinal = items_seen.get();
                    items_seen.set(ordinal + 1);
                    if scan.doomed_items.contains(&ordinal) {
                        el.set_attribute(TRACE_MARKER, "")?;
                    }
                    Ok(())
                }),
                element!("a[href]", |el| {
                    let ordinal = anchors_seen.get();
                    anchors_seen.set(ordinal + 1);
                    if scan.doomed_anchors.contains(&ordinal) {
                        el.set_attribute(TRACE_MARKER, "")?;
                    }
                    Ok(())
                }),
            ],
            ..RewriteStrSettings::default()
        },
    )
    .context("failed to mark traces in document")
}

/// Applies `edit` to every anchor's href outside `<nav>`. `None` when
/// nothing changed.
pub fn rewrite_anchor_hrefs<F>(html: &str, mut edit: F) -> Result<Option<String>>
where
    F: FnMut(&str) -> AnchorEdit,
{
    let nav_depth = Arc::new(AtomicUsize::new(0));
    let changed = Cell::new(0usize);
    let output = rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: vec![
                element!("nav", |el| {
                    if let Some(handlers) = el.end_tag_handlers() {
                        nav_depth.fetch_add(1, Ordering::Relaxed);
                        let nav_depth = Arc::clone(&nav_depth);
                        handlers.push(Box::new(move |_end: &mut EndTag<'_>| {
                            nav_depth.fetch_sub(1, Ordering::Relaxed);
                            Ok(())
                        }) as EndTagHandler<'static>);
                    }
                    Ok(())
                }),
                element!("a[href]", |el| {
                    if nav_depth.load(Ordering::Relaxed) > 0 {
                        return Ok(());
                    }
                    let href = el.get_attribute("href").unwrap_or_default();
                    match edit(&href) {
                        AnchorEdit::Keep => {}
                        AnchorEdit::Retarget(url) => {
                            if url != href {
                                el.set_attribute("href", &url)?;
                                changed.set(changed.get() + 1);
                            }
                        }
                        AnchorEdit::Remove => {
                            el.remove();
                            changed.set(changed.get() + 1);
                        }
                    }
                    Ok(())
                }),
            ],
            ..RewriteStrSettings::default()
        },
    )
    .context("failed to rewrite anchors")?;
    Ok((changed.get() > 0).then_some(output))
}

/// Inserts `snippet` right after the first `<h1>` (or at the top of `<body>`
/// when there is none), dropping any earlier `<p class="{marker_class}">`.
pub fn insert_after_first_heading(html: &str, snippet: &str, marker_class: &str) -> Result<String> {
    let stale = format!("p.{marker_class}");
    let inserted = Cell::new(false);
    let output = rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: vec![
                element!(stale.as_str(), |el| {
                    el.remove();
                    Ok(())
                }),
                element!("h1", |el| {
                    if !inserted.get() {
                        el.after(snippet, ContentType::Html);
                        inserted.set(true);
                    }
                    Ok(())
                }),
            ],
            ..RewriteStrSettings::default()
        },
    )
    .context("failed to insert notice")?;
    if inserted.get() {
        return Ok(output);
    }

    rewrite_str(
        &output,
        RewriteStrSettings {
            element_content_handlers: vec![element!("body", |el| {
                el.prepend(snippet, ContentType::Html);
                Ok(())
            })],
            ..RewriteStrSettings::default()
        },
    )
    .context("failed to insert notice")
}

/// Drops the first element matching `css`.
pub fn remove_first(html: &str, css: &str) -> Result<String> {
    let done = Cell::new(false);
    rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: vec![element!(css, |el| {
                if !done.get() {
                    el.remove();
                    done.set(true);
                }
                Ok(())
            })],
            ..RewriteStrSettings::default()
        },
    )
    .context("failed to remove element")
}
