//! Text analysis shared by the index writer and the query parser.
//!
//! Both sides must agree on tokenization, so this is the only place that
//! splits text into terms.

use unicode_segmentation::UnicodeSegmentation;

/// Split text into lowercased unicode word tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    text.unicode_words()
        .map(|w| w.to_lowercase())
        .collect()
}

/// Strip HTML tags and entities down to plain text, collapsing whitespace.
/// Good enough for the remote's note payloads; not a general HTML parser.
pub fn strip_html(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    let decoded = out
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}
