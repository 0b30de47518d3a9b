use feed_rs::model;
use feed_rs::parser;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("Malformed feed document: {0}")]
pub struct ParseError(#[from] parser::ParseFeedError);

/// One item exactly as the source described it, before normalization.
///
/// Text fields may still contain markup; `published` is the source's date
/// rendered as text so that every source shape goes through the same
/// tolerant date parsing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawItem {
    pub title: String,
    pub link: String,
    pub guid: Option<String>,
    pub summary: Option<String>,
    pub published: Option<String>,
    pub image: Option<String>,
}

/// A parsed feed document
#[derive(Debug, Clone, Default)]
pub struct ParsedFeed {
    pub title: Option<String>,
    pub site_url: Option<String>,
    pub items: Vec<RawItem>,
}

/// Parse an RSS 0.9x/1.0/2.0, Atom or JSON Feed document.
///
/// Items without a source id come back with `guid: None`; the normalizer
/// derives a stable key for them instead.
pub fn parse_feed(bytes: &[u8]) -> Result<ParsedFeed, ParseError> {
    // The default generator fills missing ids with random UUIDs.
    let feed = parser::Builder::new()
        .id_generator(|_links, _title, _uri| String::new())
        .build()
        .parse(bytes)?;

    let title = feed
        .title
        .map(|t| t.content.trim().to_string())
        .filter(|t| !t.is_empty());
    let site_url = alternate_link(&feed.links);

    let items = feed.entries.into_iter().map(raw_item).collect();

    Ok(ParsedFeed {
        title,
        site_url,
        items,
    })
}

fn raw_item(entry: model::Entry) -> RawItem {
    let link = alternate_link(&entry.links).unwrap_or_default();
    let image = media_image(&entry.media).or_else(|| enclosure_image(&entry.links));
    let summary = entry
        .summary
        .map(|s| s.content)
        .or_else(|| entry.content.and_then(|c| c.body));
    let published = entry.published.or(entry.updated).map(|dt| dt.to_rfc3339());
    let guid = Some(entry.id).filter(|id| !id.trim().is_empty());

    RawItem {
        title: entry.title.map(|t| t.content).unwrap_or_default(),
        link,
        guid,
        summary,
        published,
        image,
    }
}

/// The `alternate` link (or the first link without a `rel`), else the first link.
fn alternate_link(links: &[model::Link]) -> Option<String> {
    links
        .iter()
        .find(|l| matches!(l.rel.as_deref(), None | Some("alternate")))
        .or_else(|| links.first())
        .map(|l| l.href.trim().to_string())
        .filter(|href| !href.is_empty())
}

fn media_image(media: &[model::MediaObject]) -> Option<String> {
    media.iter().find_map(|object| {
        object
            .thumbnails
            .first()
            .map(|thumb| thumb.image.uri.clone())
            .or_else(|| {
                object.content.iter().find_map(|content| {
                    let is_image = content
                        .content_type
                        .as_ref()
                        .map_or(true, |mime| mime.ty() == "image");
                    content
                        .url
                        .as_ref()
                        .filter(|_| is_image)
                        .map(|url| url.to_string())
                })
            })
    })
}

fn enclosure_image(links: &[model::Link]) -> Option<String> {
    links
        .iter()
        .find(|l| {
            l.rel.as_deref() == Some("enclosure")
                && l
                    .media_type
                    .as_deref()
                    .is_some_and(|t| t.starts_with("image/"))
        })
        .map(|l| l.href.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_rss_items() {
        let rss = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <title>Example News</title>
    <link>https://example.com/</link>
    <item>
        <guid>item-1</guid>
        <title>First &amp; foremost</title>
        <link>https://example.com/1</link>
        <description>&lt;p&gt;Body&lt;/p&gt;</description>
        <pubDate>Mon, 01 Jan 2024 12:00:00 GMT</pubDate>
        <enclosure url="https://example.com/1.jpg" type="image/jpeg" length="10"/>
    </item>
</channel></rss>"#;

        let feed = parse_feed(rss.as_bytes()).unwrap();
        assert_eq!(feed.title.as_deref(), Some("Example News"));
        assert_eq!(feed.site_url.as_deref(), Some("https://example.com/"));
        assert_eq!(feed.items.len(), 1);

        let item = &feed.items[0];
        assert_eq!(item.guid.as_deref(), Some("item-1"));
        assert_eq!(item.title, "First & foremost");
        assert_eq!(item.link, "https://example.com/1");
        assert_eq!(item.summary.as_deref(), Some("<p>Body</p>"));
        assert_eq!(item.published.as_deref(), Some("2024-01-01T12:00:00+00:00"));
        assert_eq!(item.image.as_deref(), Some("https://example.com/1.jpg"));
    }

    #[test]
    fn test_parse_atom_entry() {
        let atom = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Atom Example</title>
  <link href="https://atom.example.com/"/>
  <id>urn:feed</id>
  <updated>2024-02-01T00:00:00Z</updated>
  <entry>
    <id>urn:entry:1</id>
    <title>Atom entry</title>
    <link rel="alternate" href="https://atom.example.com/1"/>
    <updated>2024-02-01T08:30:00Z</updated>
    <content type="html">&lt;b&gt;Hi&lt;/b&gt;</content>
  </entry>
</feed>"#;

        let feed = parse_feed(atom.as_bytes()).unwrap();
        assert_eq!(feed.title.as_deref(), Some("Atom Example"));
        let item = &feed.items[0];
        assert_eq!(item.guid.as_deref(), Some("urn:entry:1"));
        assert_eq!(item.link, "https://atom.example.com/1");
        assert_eq!(item.summary.as_deref(), Some("<b>Hi</b>"));
        assert_eq!(item.published.as_deref(), Some("2024-02-01T08:30:00+00:00"));
    }

    #[test]
    fn test_parse_empty_channel() {
        let rss = r#"<?xml version="1.0"?><rss version="2.0"><channel></channel></rss>"#;
        let feed = parse_feed(rss.as_bytes()).unwrap();
        assert!(feed.items.is_empty());
        assert!(feed.title.is_none());
    }

    #[test]
    fn test_item_without_guid_has_no_id() {
        let rss = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <title>No ids</title>
    <item><title>Anonymous</title><link>https://example.com/a</link></item>
</channel></rss>"#;

        let first = parse_feed(rss.as_bytes()).unwrap();
        let second = parse_feed(rss.as_bytes()).unwrap();
        assert_eq!(first.items[0].guid, None);
        assert_eq!(first.items, second.items);
    }

    #[test]
    fn test_parse_garbage_is_error() {
        assert!(parse_feed(b"<not valid xml").is_err());
        assert!(parse_feed(b"").is_err());
    }
}
