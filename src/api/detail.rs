use regex::Regex;
use std::collections::HashMap;

use super::parser::{compile, html_text};
use crate::listing::ListingDetails;

/// Brands recognised in listing titles, longest spellings first where one
/// contains another.
pub const KNOWN_BRANDS: &[&str] = &[
    "Alfa Romeo", "Audi", "BMW", "Chevrolet", "Citroën", "Dacia", "Fiat",
    "Ford", "Honda", "Hyundai", "Jaguar", "Jeep", "Kia", "Land Rover",
    "Lexus", "Mazda", "Mercedes-Benz", "Mercedes", "Mini", "Mitsubishi",
    "Nissan", "Opel", "Peugeot", "Porsche", "Renault", "Seat", "Skoda",
    "Smart", "Subaru", "Suzuki", "Tesla", "Toyota", "Volkswagen", "Volvo",
];

/// Structured detail values longer than this are page noise, not a brand.
const MAX_BRAND_LEN: usize = 50;
const MAX_LOCATION_LEN: usize = 100;

/// Reads brand, year, price, location and postcode from a listing page.
pub struct DetailPageParser {
    h1: Regex,
    og_title: Regex,
    page_title: Regex,
    detail_row: Regex,
    price_block: Regex,
    price_meta: Regex,
    price_amount: Regex,
    title_location: Regex,
    locality: Regex,
    postal_code: Regex,
    year: Regex,
    plz: Regex,
    tag: Regex,
}

impl Default for DetailPageParser {
    fn default() -> Self {
        Self::new()
    }
}

impl DetailPageParser {
    pub fn new() -> Self {
        Self {
            h1: compile(r#"(?s)<h1[^>]*>(.*?)</h1>"#),
            og_title: compile(r#"<meta[^>]*property="og:title"[^>]*content="([^"]*)""#),
            page_title: compile(r#"(?s)<title[^>]*>(.*?)</title>"#),
            detail_row: compile(
                r#"(?s)<li[^>]*addetailslist--detail[^>]*>(.*?)<span[^>]*addetailslist--detail--value[^>]*>(.*?)</span>"#,
            ),
            price_block: compile(r#"(?is)<(?:h2|span|div|p)[^>]*(?:price|preis)[^>]*>(.*?)</(?:h2|span|div|p)>"#),
            price_meta: compile(r#"<meta[^>]*itemprop="price"[^>]*content="([^"]+)""#),
            price_amount: compile(r#"([\d.,]+)\s*€"#),
            title_location: compile(r#" in ([^|]+?)(?:\s*\||\s*$)"#),
            locality: compile(r#"(?is)<(?:span|div|p)[^>]*(?:locality|location|standort)[^>]*>(.*?)</(?:span|div|p)>"#),
            postal_code: compile(r#"(?s)itemprop="postalCode"[^>]*>(.*?)<"#),
            year: compile(r#"\b(19[7-9]\d|20[0-2]\d)\b"#),
            plz: compile(r#"\b(\d{5})\b"#),
            tag: compile(r#"<[^>]+>"#),
        }
    }

    /// `card_title` is used for brand and year when the page has no title.
    pub fn parse(&self, html: &str, card_title: &str) -> ListingDetails {
        let title = self.title(html);
        let fields = self.detail_fields(html);
        let title_for_lookup = title.as_deref().unwrap_or(card_title);

        let location = self.location(html);
        let plz = location
            .as_deref()
            .and_then(|l| self.plz.captures(l).map(|c| c[1].to_string()))
            .or_else(|| self.text_of(&self.postal_code, html).and_then(|t| {
                self.plz.captures(&t).map(|c| c[1].to_string())
            }));

        ListingDetails {
            brand: self.brand(title_for_lookup, &fields),
            year: self.year(title_for_lookup, &fields),
            price: self.price(html),
            location,
            plz,
            title,
        }
    }

    fn text_of(&self, pattern: &Regex, html: &str) -> Option<String> {
        pattern
            .captures(html)
            .and_then(|c| html_text(&self.tag, &c[1]))
    }

    fn title(&self, html: &str) -> Option<String> {
        self.text_of(&self.h1, html)
            .or_else(|| self.text_of(&self.og_title, html))
            .or_else(|| {
                self.text_of(&self.page_title, html)
                    .and_then(|t| t.split('|').next().map(|s| s.trim().to_string()))
                    .filter(|t| !t.is_empty())
            })
    }

    /// Label → value pairs from the "Details" list, labels lowercased.
    fn detail_fields(&self, html: &str) -> HashMap<String, String> {
        self.detail_row
            .captures_iter(html)
            .filter_map(|c| {
                let label = html_text(&self.tag, &c[1])?;
                let value = html_text(&self.tag, &c[2])?;
                Some((label.to_lowercase(), value))
            })
            .collect()
    }

    fn brand(&self, title: &str, fields: &HashMap<String, String>) -> Option<String> {
        let lower = title.to_lowercase();
        if let Some(brand) = KNOWN_BRANDS
            .iter()
            .find(|b| lower.contains(&b.to_lowercase()))
        {
            return Some(brand.to_string());
        }
        if lower.split_whitespace().any(|w| w == "vw") {
            return Some("Volkswagen".to_string());
        }

        fields
            .get("marke")
            .map(|b| b.trim())
            .map(|b| b.strip_prefix("Modell").unwrap_or(b).trim().to_string())
            .filter(|b| !b.is_empty() && b.len() < MAX_BRAND_LEN)
    }

    fn year(&self, title: &str, fields: &HashMap<String, String>) -> Option<String> {
        ["erstzulassung", "baujahr"]
            .iter()
            .filter_map(|label| fields.get(*label).map(String::as_str))
            .chain(std::iter::once(title))
            .find_map(|text| self.year.captures(text).map(|c| c[1].to_string()))
    }

    fn price(&self, html: &str) -> Option<String> {
        self.price_block
            .captures_iter(html)
            .filter_map(|c| html_text(&self.tag, &c[1]))
            .find_map(|text| {
                self.price_amount
                    .captures(&text)
                    .map(|m| format!("{} €", &m[1]))
            })
            .or_else(|| {
                self.price_meta
                    .captures(html)
                    .map(|c| format!("{} €", &c[1]))
            })
    }

    fn location(&self, html: &str) -> Option<String> {
        let from_title = self
            .page_title
            .captures(html)
            .and_then(|c| html_text(&self.tag, &c[1]))
            .and_then(|t| {
                self.title_location
                    .captures(&t)
                    .map(|m| m[1].trim().to_string())
            })
            .filter(|l| !l.is_empty());

        from_title.or_else(|| {
            self.locality
                .captures_iter(html)
                .filter_map(|c| html_text(&self.tag, &c[1]))
                .find(|t| t.chars().count() > 3)
                .map(|t| t.chars().take(MAX_LOCATION_LEN).collect())
        })
    }
}
