use unicode_normalization::UnicodeNormalization;

pub const NS_SPECIAL: i32 = -1;

/// Marker segment MediaWiki's Translate extension uses for the display-title unit.
const DISPLAY_TITLE_SEGMENT: &str = "Page display title";

/// URL- and filesystem-safe key for a title: NFKD-decomposed, ASCII only,
/// lowercase, with each run of other characters collapsed into one `-`.
pub fn slugify(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    let mut pending_separator = false;
    for ch in value.nfkd() {
        if !ch.is_ascii() {
            continue;
        }
        if ch.is_ascii_alphanumeric() {
            if pending_separator && !slug.is_empty() {
                slug.push('-');
            }
            pending_separator = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_separator = true;
        }
    }
    slug
}

/// Title as it appears in `index.php?title=` URLs.
pub fn wiki_title_token(title: &str) -> String {
    title.trim().replace(' ', "_")
}

/// Folds `<Title>/<unit>/<lang>` translation snippets (where `<unit>` is a
/// number or the display-title marker) into `<Title>/<lang>`. Every other
/// title comes back unchanged.
pub fn fold_translation_title(title: &str, langs: &[String]) -> String {
    let mut segments = title.rsplitn(3, '/');
    let (Some(lang), Some(unit), Some(base)) = (segments.next(), segments.next(), segments.next())
    else {
        return title.to_string();
    };
    if base.is_empty() || !langs.iter().any(|candidate| candidate == lang) {
        return title.to_string();
    }
    let is_unit = unit == DISPLAY_TITLE_SEGMENT
        || (!unit.is_empty() && unit.chars().all(|ch| ch.is_ascii_digit()));
    if is_unit {
        format!("{base}/{lang}")
    } else {
        title.to_string()
    }
}

/// A `<Title>/<lang>` facet of a translated page.
pub fn is_translation_facet(title: &str, langs: &[String]) -> bool {
    match title.rsplit_once('/') {
        Some((base, lang)) => !base.is_empty() && langs.iter().any(|candidate| candidate == lang),
        None => false,
    }
}

/// Special pages and excluded prefixes never become mirror files.
pub fn is_syncable_title(title: &str, namespace: i32, excluded_prefixes: &[String]) -> bool {
    if namespace == NS_SPECIAL || title.trim().is_empty() {
        return false;
    }
    !excluded_prefixes
        .iter()
        .any(|prefix| title.starts_with(prefix.as_str()))
}
