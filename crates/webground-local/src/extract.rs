use html_scraper::{ElementRef, Html, Selector};
use webground_core::{
    ExtractedContent, MAX_PARAGRAPHS, MIN_PARAGRAPH_CHARS, MIN_VALID_CONTENT_CHARS, UNTITLED,
};

/// Elements whose text never counts: scripts, styling, and page chrome.
const NOISE_TAGS: [&str; 6] = ["script", "style", "nav", "header", "footer", "aside"];

/// Content containers tried by both tiers. The longest text wins, not the first match.
pub const CONTENT_SELECTORS: [&str; 7] = [
    "article",
    "main",
    "[role=\"main\"]",
    ".content",
    ".post-content",
    ".entry-content",
    "#content",
];

fn norm_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_noise(name: &str) -> bool {
    NOISE_TAGS.contains(&name)
}

fn inside_noise(el: &ElementRef<'_>) -> bool {
    el.ancestors().any(|a| {
        a.value()
            .as_element()
            .is_some_and(|e| is_noise(e.name()))
    }) || is_noise(el.value().name())
}

/// Text of `el` with every noise subtree removed. Text nodes are concatenated as-is;
/// whitespace is normalized by the caller.
fn visible_text(el: ElementRef<'_>) -> String {
    let mut out = String::new();
    if inside_noise(&el) {
        return out;
    }
    for node in el.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|a| {
            a.value()
                .as_element()
                .is_some_and(|e| is_noise(e.name()))
        });
        if !hidden {
            out.push_str(text);
        }
    }
    out
}

fn first_text(doc: &Html, selector: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    let el = doc.select(&sel).find(|el| !inside_noise(el))?;
    let t = norm_ws(&visible_text(el));
    (!t.is_empty()).then_some(t)
}

fn pick_title(doc: &Html) -> String {
    first_text(doc, "title")
        .or_else(|| first_text(doc, "h1"))
        .unwrap_or_else(|| UNTITLED.to_string())
}

fn pick_main_text(doc: &Html) -> String {
    let mut best = String::new();
    let mut best_chars = 0usize;
    for selector in CONTENT_SELECTORS {
        let Ok(sel) = Selector::parse(selector) else {
            continue;
        };
        let text: String = doc.select(&sel).map(visible_text).collect();
        let text = text.trim();
        let chars = text.chars().count();
        if chars > best_chars {
            best_chars = chars;
            best = text.to_string();
        }
    }

    if best_chars < MIN_VALID_CONTENT_CHARS {
        let body = Selector::parse("body")
            .ok()
            .and_then(|sel| doc.select(&sel).next())
            .unwrap_or_else(|| doc.root_element());
        best = visible_text(body).trim().to_string();
    }

    norm_ws(&best)
}

fn pick_paragraphs(doc: &Html) -> Vec<String> {
    let Ok(sel) = Selector::parse("p") else {
        return Vec::new();
    };
    doc.select(&sel)
        .map(|p| norm_ws(&visible_text(p)))
        .filter(|p| p.chars().count() > MIN_PARAGRAPH_CHARS)
        .take(MAX_PARAGRAPHS)
        .collect()
}

/// Static (no script execution) extraction of title, body text and paragraphs.
///
/// Used for raw fetched markup and for DOM snapshots taken after rendering, so both tiers
/// apply the same selector priority, cleaning and truncation.
pub fn extract_from_html(html: &str, url: &str) -> ExtractedContent {
    let doc = Html::parse_document(html);
    let title = pick_title(&doc);
    let main = pick_main_text(&doc);
    let paragraphs = pick_paragraphs(&doc);
    ExtractedContent::new(title, &main, paragraphs, url)
}
