use leadgrid_core::Coordinates;
use url::Url;

const MAPS_BASE: &str = "https://www.google.com/maps/search/";

/// Map search URL for `keyword` near `center`.
///
/// The search phrase is `"<keyword> in <location>"`, and the viewport is
/// pinned to the cell center at `zoom`, so the feed ranks listings around
/// that cell rather than around the location's centroid.
pub fn build_search_url(keyword: &str, location: &str, center: Coordinates, zoom: u8) -> String {
    let phrase = if location.trim().is_empty() {
        keyword.trim().to_string()
    } else {
        format!("{} in {}", keyword.trim(), location.trim())
    };
    let viewport = format!(
        "@{:.6},{:.6},{}z",
        center.latitude, center.longitude, zoom
    );

    match Url::parse(MAPS_BASE) {
        Ok(mut url) => {
            if let Ok(mut segments) = url.path_segments_mut() {
                segments.pop_if_empty().push(&phrase).push(&viewport);
            }
            url.query_pairs_mut().append_pair("hl", "en");
            url.to_string()
        }
        // MAPS_BASE is a constant absolute URL; this arm is unreachable.
        Err(_) => format!("{MAPS_BASE}{phrase}/{viewport}?hl=en"),
    }
}

/// Whether `url` points at a single place page rather than a result list.
pub fn is_place_url(url: &str) -> bool {
    url.contains("/maps/place/")
}
