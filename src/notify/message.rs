use crate::listing::{ChangeKind, ClassifiedListing, ListingDetails};

const PLACEHOLDER: &str = "—";

fn field<'a>(
    details: Option<&'a ListingDetails>,
    pick: fn(&ListingDetails) -> &Option<String>,
) -> Option<&'a str> {
    details.and_then(|d| pick(d).as_deref())
}

/// Message text for one listing. Detail-page values win over the search
/// card's when both are present.
pub fn format_listing(entry: &ClassifiedListing) -> String {
    let listing = &entry.listing;
    let details = entry.details.as_ref();
    let badge = match entry.kind {
        ChangeKind::New => "🆕 NEW",
        ChangeKind::Updated => "✏️ UPDATED",
        ChangeKind::Unchanged => "🔁",
    };

    let title = field(details, |d| &d.title)
        .or((!listing.title.is_empty()).then_some(listing.title.as_str()))
        .or(field(details, |d| &d.brand))
        .unwrap_or(PLACEHOLDER);
    let price = field(details, |d| &d.price)
        .or(listing.price.as_deref())
        .unwrap_or(PLACEHOLDER);
    let location = field(details, |d| &d.location)
        .or(listing.location.as_deref())
        .unwrap_or(PLACEHOLDER);

    let mut text = format!("{badge}\n🚗 {title}\n");
    if let Some(details) = details {
        text.push_str(&format!(
            "🏭 {}\n📆 {}\n",
            details.brand.as_deref().unwrap_or(PLACEHOLDER),
            details.year.as_deref().unwrap_or(PLACEHOLDER),
        ));
    }
    text.push_str(&format!("💶 {price}\n📍 {location}\n"));
    if let Some(plz) = field(details, |d| &d.plz) {
        text.push_str(&format!("🏷 PLZ: {plz}\n"));
    }
    text.push_str(&format!(
        "📅 {}\n\n🔗 {}",
        listing.posted_at.as_deref().unwrap_or(PLACEHOLDER),
        listing.url
    ));
    text
}
