//! Shareable links
//!
//! A link carries the peer id as the `id` query parameter. Opening one only
//! pre-fills the dial target.

use url::Url;

const ID_PARAM: &str = "id";

/// Build a link that points a friend at `peer_id`
pub fn share_link(base: &str, peer_id: &str) -> Result<String, url::ParseError> {
    let mut url = Url::parse(base)?;
    url.query_pairs_mut().clear().append_pair(ID_PARAM, peer_id);
    Ok(url.to_string())
}

/// Extract the dial target from a bare id or a shared link
pub fn dial_target(input: &str) -> Option<String> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    match Url::parse(input) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => url
            .query_pairs()
            .find(|(key, _)| key == ID_PARAM)
            .map(|(_, value)| value.trim().to_string())
            .filter(|id| !id.is_empty()),
        _ => Some(input.to_string()),
    }
}
