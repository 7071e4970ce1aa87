use regex::Regex;
use std::collections::HashSet;

use crate::listing::RawRecord;

/// Extracts listing cards from a search result page.
///
/// Cards are `<article data-adid=..>` blocks; when the markup has none the
/// parser falls back to bare `/s-anzeige/` links.
pub struct SearchPageParser {
    article: Regex,
    link: Regex,
    title: Regex,
    price: Regex,
    location: Regex,
    posted: Regex,
    bare_link: Regex,
    listing_id: Regex,
    tag: Regex,
}

impl Default for SearchPageParser {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).expect("static pattern compiles")
}

impl SearchPageParser {
    pub fn new() -> Self {
        Self {
            article: compile(r#"(?s)<article[^>]*?data-adid="(\d+)"[^>]*>(.*?)</article>"#),
            link: compile(r#"href="(/s-anzeige/[^"]+)""#),
            title: compile(r#"(?s)<h2[^>]*>.*?<a[^>]*>(.*?)</a>"#),
            price: compile(
                r#"(?s)<p[^>]*aditem-main--middle--price-shipping--price[^>]*>(.*?)</p>"#,
            ),
            location: compile(r#"(?s)<div[^>]*aditem-main--top--left[^>]*>(.*?)</div>"#),
            posted: compile(r#"(?s)<div[^>]*aditem-main--top--right[^>]*>(.*?)</div>"#),
            bare_link: compile(r#"(?s)<a[^>]*href="(/s-anzeige/[^"]+)"[^>]*>(.*?)</a>"#),
            listing_id: compile(r#"/s-anzeige/[^/]+/(\d+)-"#),
            tag: compile(r#"<[^>]+>"#),
        }
    }

    pub fn parse(&self, html: &str, page: u32, max_listings: usize) -> Vec<RawRecord> {
        let mut seen_ids = HashSet::new();
        let mut records = Vec::new();

        for caps in self.article.captures_iter(html) {
            if records.len() >= max_listings {
                break;
            }
            let id = &caps[1];
            let body = &caps[2];

            let Some(href) = self.link.captures(body).map(|c| c[1].to_string()) else {
                continue;
            };
            if !seen_ids.insert(id.to_string()) {
                continue;
            }

            let mut record = RawRecord::new(page).with("id", id).with("url", href);
            if let Some(title) = self.text_of(&self.title, body) {
                record = record.with("title", title);
            }
            if let Some(price) = self.text_of(&self.price, body) {
                record = record.with("price", price);
            }
            if let Some(location) = self.text_of(&self.location, body) {
                record = record.with("location", location);
            }
            if let Some(posted) = self.text_of(&self.posted, body) {
                record = record.with("posted_at", posted);
            }
            records.push(record);
        }

        if records.is_empty() {
            records = self.parse_bare_links(html, page, max_listings);
        }

        tracing::debug!("Parsed {} listings from page {}", records.len(), page);
        records
    }

    fn parse_bare_links(&self, html: &str, page: u32, max_listings: usize) -> Vec<RawRecord> {
        let mut seen_ids = HashSet::new();
        let mut records = Vec::new();

        for caps in self.bare_link.captures_iter(html) {
            if records.len() >= max_listings {
                break;
            }
            let href = &caps[1];
            let Some(id) = self.listing_id.captures(href).map(|c| c[1].to_string()) else {
                continue;
            };
            if !seen_ids.insert(id.clone()) {
                continue;
            }

            let mut record = RawRecord::new(page).with("id", id).with("url", href);
            if let Some(title) = self.clean(&caps[2]) {
                record = record.with("title", title);
            }
            records.push(record);
        }

        records
    }

    fn text_of(&self, pattern: &Regex, body: &str) -> Option<String> {
        pattern.captures(body).and_then(|c| self.clean(&c[1]))
    }

    fn clean(&self, fragment: &str) -> Option<String> {
        html_text(&self.tag, fragment)
    }
}

/// Visible text of an HTML fragment: tags dropped, entities decoded,
/// whitespace collapsed. `None` when nothing is left.
pub(crate) fn html_text(tag: &Regex, fragment: &str) -> Option<String> {
    let stripped = tag.replace_all(fragment, " ");
    let decoded = html_escape::decode_html_entities(&stripped);
    let text = decoded.split_whitespace().collect::<Vec<_>>().join(" ");
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}
