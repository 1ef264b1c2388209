//! Page parsing for the MiLB Charleston news section.
//!
//! Two entry points, both pure (no I/O):
//! - [`discover_links`]: article URLs on the listing page
//! - [`extract`]: a [`Candidate`] from one article page
//!
//! Article pages carry their data in two places. The embedded article JSON (a script
//! containing `window.MiLB_ARTICLES`) is preferred for metadata; the rendered body under
//! `div.article-item__bottom` is preferred for content when present.

use chrono::{DateTime, NaiveDate};
use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::error::ExtractionError;
use crate::models::Candidate;

static ANCHOR: Lazy<Selector> = Lazy::new(|| selector("a[href]"));
static SCRIPT: Lazy<Selector> = Lazy::new(|| selector("script"));
static HEADLINE: Lazy<Selector> = Lazy::new(|| selector("h1.article-item__headline"));
static BODY: Lazy<Selector> = Lazy::new(|| selector("div.article-item__bottom"));
static PARAGRAPH: Lazy<Selector> = Lazy::new(|| selector("p"));
static CONTRIBUTOR_DATE: Lazy<Selector> =
    Lazy::new(|| selector("div.article-item__contributor-date"));
static CONTRIBUTOR_INFO: Lazy<Selector> =
    Lazy::new(|| selector("div.article-item__contributor-info"));
static IMAGE: Lazy<Selector> = Lazy::new(|| selector("img[src]"));

static MONTH_DAY_YEAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([A-Za-z]{3,9})\.?\s+(\d{1,2}),?\s+(\d{4})").expect("static regex")
});
static NUMERIC_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{4}-\d{2}-\d{2})|(\d{1,2}/\d{1,2}/\d{4})").expect("static regex"));

const ARTICLES_MARKER: &str = "window.MiLB_ARTICLES";
const JSON_MARKERS: [&str; 2] = ["article-json=", "articlePage:"];

fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("static selector")
}

/// Collect article links from the listing page.
///
/// Keeps `<a href>` values containing `path_fragment`, resolved against `base`, with
/// URL fragments dropped. Order is first-seen; duplicates and the listing page itself
/// are removed.
pub fn discover_links(listing_html: &str, base: &Url, path_fragment: &str) -> Vec<String> {
    let document = Html::parse_document(listing_html);
    let listing_path = path_fragment.trim_end_matches('/');

    let links = document
        .select(&ANCHOR)
        .filter_map(|a| a.value().attr("href"))
        .filter(|href| href.contains(path_fragment))
        .filter_map(|href| base.join(href).ok())
        .map(|mut url| {
            url.set_fragment(None);
            url
        })
        .filter(|url| url.path().trim_end_matches('/') != listing_path)
        .map(|url| url.to_string())
        .unique()
        .collect::<Vec<_>>();

    debug!(count = links.len(), "Discovered article links");
    links
}

/// Parse an article page into a candidate.
///
/// Title and content are required; date, author, section and images are optional.
pub fn extract(raw: &str, source_url: &str) -> Result<Candidate, ExtractionError> {
    let document = Html::parse_document(raw);

    let embedded = match find_embedded_article(&document) {
        Some(Ok(article)) => Some(article),
        Some(Err(e)) => {
            debug!(url = source_url, error = %e, "Ignoring unparseable embedded article JSON");
            // Keep the reason in case the HTML fallback finds nothing either.
            return extract_html(&document, source_url).map_err(|fallback| match fallback {
                ExtractionError::MissingTitle => e,
                other => other,
            });
        }
        None => None,
    };

    match embedded {
        Some(data) => merge_embedded(&document, data, source_url),
        None => extract_html(&document, source_url),
    }
}

fn merge_embedded(
    document: &Html,
    data: EmbeddedArticle,
    source_url: &str,
) -> Result<Candidate, ExtractionError> {
    let title = data.headline.as_deref().map(clean_text).unwrap_or_default();
    if title.is_empty() {
        return Err(ExtractionError::MissingTitle);
    }

    // Rendered paragraphs beat the markdown parts when both exist.
    let content = match body_text(document) {
        Some(html_body) => html_body,
        None => data
            .article_parts
            .iter()
            .filter(|part| part.kind == "markdown")
            .map(|part| strip_markup(&part.content))
            .filter(|text| !text.is_empty())
            .join("\n"),
    };
    if content.is_empty() {
        return Err(ExtractionError::MissingContent);
    }

    let mut images = data
        .media
        .and_then(|m| m.content)
        .map(|c| c.cuts)
        .unwrap_or_default();
    images.extend(
        data.thumbnail
            .and_then(|t| t.image)
            .map(|c| c.cuts)
            .unwrap_or_default(),
    );
    let image_urls = images
        .into_iter()
        .filter_map(|cut| cut.src)
        .filter_map(|src| resolve(source_url, &src))
        .unique()
        .collect();

    Ok(Candidate {
        title,
        subheadline: non_empty(data.sub_headline),
        author: non_empty(data.byline.and_then(|b| b.name)),
        section: non_empty(data.section),
        content,
        date: data.timestamp.as_deref().and_then(parse_source_date),
        image_urls,
        source_url: source_url.to_string(),
    })
}

fn extract_html(document: &Html, source_url: &str) -> Result<Candidate, ExtractionError> {
    let title = document
        .select(&HEADLINE)
        .next()
        .map(element_text)
        .unwrap_or_default();
    if title.is_empty() {
        return Err(ExtractionError::MissingTitle);
    }

    let content = body_text(document).ok_or(ExtractionError::MissingContent)?;

    let date = document
        .select(&CONTRIBUTOR_DATE)
        .next()
        .map(element_text)
        .and_then(|text| parse_source_date(&text));
    let author = document
        .select(&CONTRIBUTOR_INFO)
        .next()
        .map(element_text)
        .filter(|s| !s.is_empty());

    let image_scope: Vec<ElementRef<'_>> = document.select(&BODY).collect();
    let image_urls = if image_scope.is_empty() {
        document
            .select(&IMAGE)
            .filter_map(|img| img.value().attr("src"))
            .filter_map(|src| resolve(source_url, src))
            .unique()
            .collect()
    } else {
        image_scope
            .iter()
            .flat_map(|body| body.select(&IMAGE))
            .filter_map(|img| img.value().attr("src"))
            .filter_map(|src| resolve(source_url, src))
            .unique()
            .collect()
    };

    Ok(Candidate {
        title,
        subheadline: None,
        author,
        section: Some("news".to_string()),
        content,
        date,
        image_urls,
        source_url: source_url.to_string(),
    })
}

/// Paragraph text of the rendered article body, one paragraph per line.
fn body_text(document: &Html) -> Option<String> {
    let body = document.select(&BODY).next()?;
    let text = body
        .select(&PARAGRAPH)
        .map(element_text)
        .filter(|p| !p.is_empty())
        .join("\n");
    (!text.is_empty()).then_some(text)
}

fn find_embedded_article(document: &Html) -> Option<Result<EmbeddedArticle, ExtractionError>> {
    for script in document.select(&SCRIPT) {
        let text = script.text().collect::<String>();
        if !text.contains(ARTICLES_MARKER) {
            continue;
        }
        for marker in JSON_MARKERS {
            let Some(pos) = text.find(marker) else {
                continue;
            };
            let rest = &text[pos + marker.len()..];
            let parsed = balanced_object(rest)
                .ok_or_else(|| ExtractionError::Malformed("unterminated JSON object".to_string()))
                .and_then(|json| {
                    serde_json::from_str::<EmbeddedArticle>(json)
                        .map_err(|e| ExtractionError::Malformed(e.to_string()))
                });
            return Some(parsed);
        }
    }
    None
}

/// The first `{...}` object in `s`, matched by brace depth outside string literals.
fn balanced_object(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in s[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[start..start + offset + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse a source-reported date; anything unrecognised is `None` ("unknown").
pub fn parse_source_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.date_naive());
    }

    if let Some(caps) = NUMERIC_DATE.captures(raw) {
        if let Some(iso) = caps.get(1) {
            if let Ok(date) = NaiveDate::parse_from_str(iso.as_str(), "%Y-%m-%d") {
                return Some(date);
            }
        }
        if let Some(us) = caps.get(2) {
            if let Ok(date) = NaiveDate::parse_from_str(us.as_str(), "%m/%d/%Y") {
                return Some(date);
            }
        }
    }

    let caps = MONTH_DAY_YEAR.captures(raw)?;
    let month = match &caps[1] {
        m if m.eq_ignore_ascii_case("sept") => "Sep",
        m => m,
    };
    let normalized = format!("{} {} {}", month, &caps[2], &caps[3]);
    NaiveDate::parse_from_str(&normalized, "%B %d %Y")
        .or_else(|_| NaiveDate::parse_from_str(&normalized, "%b %d %Y"))
        .ok()
}

fn element_text(element: ElementRef<'_>) -> String {
    clean_text(&element.text().collect::<String>())
}

fn clean_text(s: &str) -> String {
    s.split_whitespace().join(" ")
}

fn strip_markup(fragment: &str) -> String {
    let html = Html::parse_fragment(fragment);
    clean_text(&html.root_element().text().join(" "))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| clean_text(&v)).filter(|v| !v.is_empty())
}

fn resolve(source_url: &str, src: &str) -> Option<String> {
    let src = src.trim();
    if src.is_empty() {
        return None;
    }
    Url::parse(source_url)
        .and_then(|base| base.join(src))
        .or_else(|_| Url::parse(src))
        .ok()
        .map(|u| u.to_string())
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct EmbeddedArticle {
    headline: Option<String>,
    sub_headline: Option<String>,
    timestamp: Option<String>,
    section: Option<String>,
    byline: Option<Byline>,
    article_parts: Vec<ArticlePart>,
    media: Option<Media>,
    thumbnail: Option<Thumbnail>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Byline {
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ArticlePart {
    #[serde(rename = "type")]
    kind: String,
    content: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Media {
    content: Option<ImageCuts>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Thumbnail {
    image: Option<ImageCuts>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ImageCuts {
    cuts: Vec<ImageCut>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ImageCut {
    src: Option<String>,
}
