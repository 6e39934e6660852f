//! HTML extraction for the map search surface.
//!
//! Selectors target the rendered results feed and the place detail panel.
//! Every field is optional: a selector that stops matching yields a missing
//! field, never an error, so layout drift degrades output instead of failing
//! whole cells.

use leadgrid_core::{Listing, Source};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::collections::{BTreeMap, HashSet};

/// Scrollable results list.
pub const FEED_SELECTOR: &str = r#"div[role="feed"]"#;

/// One card in the results list, used to detect whether scrolling loaded more.
pub const FEED_ITEM_SELECTOR: &str = r#"div[role="feed"] > div > div[jsaction]"#;

/// Detail panel of a single place.
pub const PLACE_PANEL_SELECTOR: &str = r#"div[role="main"]"#;

const MAPS_ORIGIN: &str = "https://www.google.com";

const PLACE_LINKS: &str = r#"div[role="feed"] a[href*="/maps/place/"]"#;
const FALLBACK_LINKS: &str = r#"div[role="feed"] a.hfpxzc"#;

const DAYS: [&str; 7] = [
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
    "Sunday",
];

static PRICE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$+").expect("Price regex is hardcoded and valid"));

static RATING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+(?:\.\d+)?)").expect("Rating regex is hardcoded and valid"));

static PAREN_COUNT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\((\d[\d,]*)\)").expect("Review count regex is hardcoded and valid")
});

static WORD_COUNT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\d[\d,]*)\s+reviews?").expect("Review count regex is hardcoded and valid")
});

static FEATURE_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(0x[0-9a-fA-F]+:0x[0-9a-fA-F]+)").expect("Feature id regex is hardcoded and valid")
});

static PLACE_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(ChIJ[A-Za-z0-9_-]+)").expect("Place id regex is hardcoded and valid"));

/// Place pin, `!3d<lat>!4d<lon>`.
static PIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"!3d(-?\d+(?:\.\d+)?)!4d(-?\d+(?:\.\d+)?)").expect("Pin regex is hardcoded and valid")
});

/// Viewport center, `@<lat>,<lon>`.
static VIEWPORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"@(-?\d+(?:\.\d+)?),(-?\d+(?:\.\d+)?)").expect("Viewport regex is hardcoded and valid")
});

fn select_all<'a>(root: ElementRef<'a>, css: &str) -> Vec<ElementRef<'a>> {
    Selector::parse(css)
        .map(|selector| root.select(&selector).collect())
        .unwrap_or_default()
}

fn select_first<'a>(root: ElementRef<'a>, css: &str) -> Option<ElementRef<'a>> {
    Selector::parse(css)
        .ok()
        .and_then(|selector| root.select(&selector).next())
}

fn text_of(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn first_text(root: ElementRef<'_>, css: &str) -> Option<String> {
    select_first(root, css)
        .map(text_of)
        .filter(|text| !text.is_empty())
}

/// Extract listing stubs from a results page.
///
/// Each card yields at most one listing even when it carries several links.
pub fn parse_feed(html: &str) -> Vec<Listing> {
    let document = Html::parse_document(html);
    let root = document.root_element();

    let mut links = select_all(root, PLACE_LINKS);
    if links.is_empty() {
        links = select_all(root, FALLBACK_LINKS);
    }

    let mut seen = HashSet::new();
    let mut listings = Vec::new();

    for link in links {
        let Some(href) = link.value().attr("href").filter(|h| !h.is_empty()) else {
            continue;
        };
        let maps_url = absolute_url(href);
        if !seen.insert(maps_url.clone()) {
            continue;
        }

        let card = card_of(link);
        let name = link
            .value()
            .attr("aria-label")
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .or_else(|| card.and_then(|c| first_text(c, "div.qBF1Pd")))
            .or_else(|| Some(text_of(link)).filter(|n| !n.is_empty()));
        let Some(name) = name else {
            continue;
        };

        let mut listing = Listing::new(name, Source::Primary);
        if let Some(card) = card {
            fill_from_card(&mut listing, card);
        }
        listing.place_id = extract_place_id(&maps_url);
        if let Some((lat, lon)) = extract_coordinates(&maps_url) {
            listing.latitude = Some(lat);
            listing.longitude = Some(lon);
        }
        listing.maps_url = Some(maps_url);
        listings.push(listing);
    }

    listings
}

/// Nearest enclosing result card of a feed link.
fn card_of(link: ElementRef<'_>) -> Option<ElementRef<'_>> {
    link.ancestors().filter_map(ElementRef::wrap).find(|el| {
        let value = el.value();
        value.classes().any(|c| c == "Nv2PK")
            || value
                .attr("jsaction")
                .is_some_and(|action| action.contains("mouseover"))
    })
}

fn fill_from_card(listing: &mut Listing, card: ElementRef<'_>) {
    let category = first_text(card, "div.fontBodyMedium > div > span > span")
        .map(|c| c.trim_matches(|ch: char| ch == '·' || ch.is_whitespace()).to_string())
        .filter(|c| !c.is_empty())
        .or_else(|| first_text(card, "div.W4Efsd span"));
    if let Some(category) = category {
        listing.types = vec![category.clone()];
        listing.business_type = Some(category);
    }

    if let Some(label) = select_first(card, r#"span[role="img"]"#)
        .and_then(|el| el.value().attr("aria-label"))
    {
        let (rating, reviews) = parse_rating_text(label);
        listing.rating = rating;
        listing.review_count = reviews;
    }

    let address = select_all(card, "div.fontBodyMedium > div:not(:first-child)")
        .into_iter()
        .last()
        .map(text_of)
        .filter(|line| !line.starts_with("Open") && !line.starts_with("Closed"))
        .and_then(|line| {
            // "$$ · 123 Main St": the address is the last segment
            let last = line.rsplit('·').next().unwrap_or(&line).trim().to_string();
            (!last.is_empty()).then_some(last)
        });
    listing.address = address;
}

/// Fill a listing from its detail page.
///
/// Values found on the page replace the stub's; anything missing keeps the
/// stub value.
pub fn parse_detail(html: &str, current_url: Option<&str>, listing: &mut Listing) {
    let document = Html::parse_document(html);
    let root = document.root_element();

    if listing.name.trim().is_empty() {
        if let Some(name) = first_text(root, "h1") {
            listing.name = name;
        }
    }

    if let Some(phone) = first_text(root, r#"button[data-item-id^="phone:tel"] div.fontBodyMedium"#)
    {
        listing.phone = Some(phone);
    }

    let website = select_first(root, r#"a[data-item-id="authority"]"#).and_then(|link| {
        link.value()
            .attr("href")
            .filter(|href| href.starts_with("http"))
            .map(str::to_string)
            .or_else(|| first_text(link, "div.fontBodyMedium"))
    });
    if let Some(site) = website {
        listing.website = Some(if site.starts_with("http") {
            site
        } else {
            format!("https://{site}")
        });
    }

    if let Some(address) = first_text(root, r#"button[data-item-id="address"] div.fontBodyMedium"#)
    {
        listing.address = Some(address);
    }

    let hours_label = [
        r#"div[aria-label*="Monday"]"#,
        r#"div[aria-label*="Sunday"]"#,
        r#"div[aria-label*="hour"]"#,
    ]
    .iter()
    .find_map(|css| select_first(root, css).and_then(|el| el.value().attr("aria-label")));
    if let Some(label) = hours_label {
        listing.opening_hours = Some(parse_hours(label));
    }

    if let Some(category) = first_text(root, r#"button[jsaction*="category"]"#) {
        if listing.business_type.is_none() {
            listing.business_type = Some(category.clone());
        }
        if !listing.types.contains(&category) {
            listing.types.push(category);
        }
    }
    if let Some(level) = select_all(root, r#"span[aria-label*="Price"], button[jsaction*="category"]"#)
        .into_iter()
        .find_map(|el| price_level(&text_of(el)))
    {
        listing.price_level = Some(level);
    }

    if let Some(description) = first_text(root, "div.PYvSYb").filter(|d| d.chars().count() > 10) {
        listing.description = Some(description);
    }

    for span in select_all(root, "span") {
        let text = text_of(span);
        if text.contains("Claimed") || text.contains("Verified") {
            listing.verified = Some(true);
        } else if text.contains("Claim this business") && listing.verified.is_none() {
            listing.verified = Some(false);
        } else if text.starts_with("Permanently closed") {
            listing.business_status = Some("CLOSED_PERMANENTLY".to_string());
        } else if text.starts_with("Temporarily closed") {
            listing.business_status = Some("CLOSED_TEMPORARILY".to_string());
        } else if let Some(owner) = strip_owner_prefix(&text) {
            listing.owner_name.get_or_insert(owner);
        }
    }

    if let Some(url) = current_url {
        if listing.place_id.is_none() {
            listing.place_id = extract_place_id(url);
        }
        if let Some((lat, lon)) = extract_coordinates(url) {
            listing.latitude = Some(lat);
            listing.longitude = Some(lon);
        }
    }
}

/// Listing for a search that landed directly on a single place page.
pub fn parse_place_page(html: &str, url: &str) -> Option<Listing> {
    let mut listing = Listing::new(String::new(), Source::Primary);
    listing.maps_url = Some(url.to_string());
    parse_detail(html, Some(url), &mut listing);
    (!listing.name.trim().is_empty()).then_some(listing)
}

fn strip_owner_prefix(text: &str) -> Option<String> {
    let rest = text
        .strip_prefix("Managed by")
        .or_else(|| text.strip_prefix("Owner:"))
        .or_else(|| text.strip_prefix("Owner"))?;
    let owner = rest.trim();
    (!owner.is_empty()).then(|| owner.to_string())
}

fn price_level(text: &str) -> Option<u8> {
    let dollars = PRICE.find(text)?;
    u8::try_from(dollars.as_str().len()).ok().filter(|n| (1..=4).contains(n))
}

/// Parse a rating label such as `"4.5 stars 1,234 Reviews"` or `"4.5(123)"`.
///
/// Ratings above 5 are discarded.
pub fn parse_rating_text(text: &str) -> (Option<f64>, Option<u32>) {
    let rating = RATING
        .captures(text)
        .and_then(|caps| caps[1].parse::<f64>().ok())
        .filter(|r| (0.0..=5.0).contains(r));

    let count = PAREN_COUNT
        .captures(text)
        .or_else(|| WORD_COUNT.captures(text))
        .and_then(|caps| caps[1].replace(',', "").parse::<u32>().ok());

    (rating, count)
}

/// Place identifier embedded in a map link: a `0x…:0x…` feature id, else a
/// `ChIJ…` place id.
pub fn extract_place_id(url: &str) -> Option<String> {
    FEATURE_ID
        .captures(url)
        .or_else(|| PLACE_ID.captures(url))
        .map(|caps| caps[1].to_string())
}

/// Coordinates embedded in a map link.
///
/// The place pin (`!3d<lat>!4d<lon>`) is preferred over the viewport center
/// (`@<lat>,<lon>`), which can sit anywhere on screen.
pub fn extract_coordinates(url: &str) -> Option<(f64, f64)> {
    let caps = PIN.captures(url).or_else(|| VIEWPORT.captures(url))?;
    let lat: f64 = caps[1].parse().ok()?;
    let lon: f64 = caps[2].parse().ok()?;
    ((-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon)).then_some((lat, lon))
}

/// Split an hours label into per-day entries.
///
/// Labels look like `"Monday, 9 AM to 5 PM; Tuesday, Closed; ..."`, often
/// followed by `". Hide open hours for the week"`. Anything that does not
/// split cleanly is kept whole under `"text"`.
pub fn parse_hours(label: &str) -> BTreeMap<String, String> {
    let body = label.split(". Hide").next().unwrap_or(label);
    let mut hours = BTreeMap::new();
    for entry in body.split(';') {
        let Some((day, value)) = entry.split_once(',') else {
            continue;
        };
        let day = day.trim();
        if DAYS.contains(&day) {
            hours.insert(day.to_string(), value.trim().trim_end_matches('.').to_string());
        }
    }
    if hours.is_empty() {
        hours.insert("text".to_string(), label.trim().to_string());
    }
    hours
}

/// Whether the page is a CAPTCHA or unusual-traffic interstitial.
pub fn detect_captcha(html: &str, url: Option<&str>) -> bool {
    url.is_some_and(|u| u.contains("/sorry/"))
        || html.contains("g-recaptcha")
        || html.contains("recaptcha/api")
        || html.contains("unusual traffic")
}

/// Whether the feed shows its end-of-list marker.
pub fn is_end_of_results(html: &str) -> bool {
    let document = Html::parse_document(html);
    select_all(document.root_element(), "p.fontBodyMedium span, span.HlvSq")
        .into_iter()
        .map(text_of)
        .any(|text| {
            let lower = text.to_lowercase();
            lower.contains("end of the list") || lower.contains("end of results")
        })
}

fn absolute_url(href: &str) -> String {
    if href.starts_with("http") {
        href.to_string()
    } else {
        format!("{MAPS_ORIGIN}{href}")
    }
}
