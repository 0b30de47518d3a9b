use std::borrow::Cow;

use url::Url;

/// Suffix appended when text is cut short
const ELLIPSIS: &str = "...";

/// Fallback title for items whose title is missing or blank.
pub const UNTITLED: &str = "Untitled";

/// Truncate `s` to at most `max_chars` characters, appending `...` when cut.
///
/// The cut prefers the last space, but only when that keeps at least 70% of
/// the available room; otherwise the text is cut mid-word. Counts `char`s,
/// never splits a code point, and returns `Cow::Borrowed` when `s` fits.
///
/// ```
/// use feedrelay::util::truncate_chars;
///
/// assert_eq!(truncate_chars("Short", 10), "Short");
/// assert_eq!(truncate_chars("Hello brave new world", 15), "Hello brave...");
/// ```
pub fn truncate_chars(s: &str, max_chars: usize) -> Cow<'_, str> {
    if s.chars().count() <= max_chars {
        return Cow::Borrowed(s);
    }

    let ellipsis_len = ELLIPSIS.chars().count();
    if max_chars <= ellipsis_len {
        return Cow::Owned(ELLIPSIS.chars().take(max_chars).collect());
    }

    let keep = max_chars - ellipsis_len;
    let byte_end = s
        .char_indices()
        .nth(keep)
        .map(|(idx, _)| idx)
        .unwrap_or(s.len());
    let mut prefix = &s[..byte_end];

    if let Some(space) = prefix.rfind(' ') {
        // `space` is a byte index; compare in chars so CJK text is judged fairly
        let space_chars = prefix[..space].chars().count();
        if space_chars * 10 > keep * 7 {
            prefix = &prefix[..space];
        }
    }

    Cow::Owned(format!("{}{}", prefix.trim_end(), ELLIPSIS))
}

/// Collapse every run of whitespace (including newlines) to one space and trim.
pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Reduce a possibly-HTML fragment to one line of readable plain text.
///
/// Markup is rendered with `nanohtml2text` (entities decoded, tags dropped).
/// Control characters are removed before whitespace is collapsed. Text
/// without `<` or `&` skips the renderer.
pub fn html_to_text(s: &str) -> String {
    let rendered = if s.contains('<') || s.contains('&') {
        Cow::Owned(nanohtml2text::html2text(s))
    } else {
        Cow::Borrowed(s)
    };

    collapse_whitespace(&strip_control_chars(&rendered))
}

/// First absolute `http(s)` image URL referenced by an `<img src=...>` tag.
pub fn first_image_src(html: &str) -> Option<String> {
    let lower = html.to_ascii_lowercase();
    let mut from = 0;

    while let Some(tag_start) = lower[from..].find("<img").map(|i| i + from) {
        let tag_end = lower[tag_start..]
            .find('>')
            .map(|i| i + tag_start)
            .unwrap_or(lower.len());
        let tag = &lower[tag_start..tag_end];

        if let Some(attr) = tag.find("src=") {
            let value_start = tag_start + attr + "src=".len();
            let rest = &html[value_start..tag_end];
            let value = match rest.chars().next() {
                Some(quote @ ('"' | '\'')) => rest[1..].split(quote).next(),
                Some(_) => rest.split(|c: char| c.is_whitespace() || c == '/').next(),
                None => None,
            };
            if let Some(src) = value.map(str::trim) {
                if src.starts_with("http://") || src.starts_with("https://") {
                    return Some(src.to_string());
                }
            }
        }
        from = tag_end;
    }

    None
}

/// Well-known publishers, keyed by registrable domain.
const KNOWN_SOURCES: &[(&str, &str)] = &[
    ("apnews.com", "AP News"),
    ("arstechnica.com", "Ars Technica"),
    ("bbc.co.uk", "BBC"),
    ("bbc.com", "BBC"),
    ("bloomberg.com", "Bloomberg"),
    ("cnn.com", "CNN"),
    ("economist.com", "The Economist"),
    ("ft.com", "Financial Times"),
    ("nature.com", "Nature"),
    ("npr.org", "NPR"),
    ("nytimes.com", "The New York Times"),
    ("reuters.com", "Reuters"),
    ("techcrunch.com", "TechCrunch"),
    ("theatlantic.com", "The Atlantic"),
    ("theguardian.com", "The Guardian"),
    ("theverge.com", "The Verge"),
    ("washingtonpost.com", "Washington Post"),
    ("wired.com", "Wired"),
    ("wsj.com", "Wall Street Journal"),
];

/// Human-readable publisher name for a link.
///
/// Known domains (and their subdomains) map to a fixed name; anything else
/// falls back to the capitalized second-level label, e.g. `example` for
/// `news.example.org`.
pub fn source_name(link: &str) -> String {
    let host = match Url::parse(link)
        .ok()
        .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
    {
        Some(host) => host,
        None => return "Unknown".to_string(),
    };
    let host = host.strip_prefix("www.").unwrap_or(&host);

    for (domain, name) in KNOWN_SOURCES {
        if host == *domain
            || host
                .strip_suffix(domain)
                .is_some_and(|prefix| prefix.ends_with('.'))
        {
            return (*name).to_string();
        }
    }

    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() >= 2 {
        let label = labels[labels.len() - 2];
        let mut chars = label.chars();
        return match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => host.to_string(),
        };
    }

    host.to_string()
}

/// Strip terminal control characters and ANSI escape sequences from text.
///
/// Feed titles and summaries are attacker-controlled and end up in chat
/// messages and log lines.
///
/// Strips ASCII controls other than tab/newline/CR, DEL, CSI sequences
/// (`ESC [` ... final byte 0x40-0x7E), OSC sequences (`ESC ]` ... BEL or
/// `ESC \`), and bare ESC.
///
/// Returns `Cow::Borrowed` when there is nothing to strip.
pub fn strip_control_chars(s: &str) -> Cow<'_, str> {
    fn is_control(b: u8) -> bool {
        b == 0x1b || b == 0x7f || (b < 0x20 && b != b'\t' && b != b'\n' && b != b'\r')
    }

    let bytes = s.as_bytes();
    if !bytes.iter().any(|&b| is_control(b)) {
        return Cow::Borrowed(s);
    }

    let len = bytes.len();
    let mut out = String::with_capacity(len);
    let mut i = 0;

    while i < len {
        match bytes[i] {
            0x1b if bytes.get(i + 1) == Some(&b'[') => {
                i += 2;
                while i < len {
                    let c = bytes[i];
                    i += 1;
                    if (0x40..=0x7e).contains(&c) {
                        break;
                    }
                }
            }
            0x1b if bytes.get(i + 1) == Some(&b']') => {
                i += 2;
                while i < len {
                    if bytes[i] == 0x07 {
                        i += 1;
                        break;
                    }
                    if bytes[i] == 0x1b && bytes.get(i + 1) == Some(&b'\\') {
                        i += 2;
                        break;
                    }
                    i += 1;
                }
            }
            b if is_control(b) => i += 1,
            _ => {
                let start = i;
                while i < len && !is_control(bytes[i]) {
                    i += 1;
                }
                // Only ASCII bytes stop the run, so the slice is on a char boundary.
                out.push_str(&s[start..i]);
            }
        }
    }

    Cow::Owned(out)
}
