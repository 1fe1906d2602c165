//! Canonical item keys.
//!
//! `compute_key` is pure: no I/O, no clock, no randomness. The same logical
//! item always produces the same key, whichever worker or process sees it and
//! whatever tracking junk its URL carries.
//!
//! Priority, strongest identity first:
//!
//! 1. explicit offer id → `offer:<id>`
//! 2. explicit market id → `id:<id>`
//! 3. URL: `offerid` query param → `offer:<id>`, numeric path segment of six
//!    or more digits → `id:<digits>`, `/card/<slug>` → `card:<slug>`,
//!    otherwise the canonical URL → `url:<host><path>`
//! 4. `hash:<sha1>` over the normalized title and brand

use std::sync::LazyLock;

use regex::Regex;
use sha1::{Digest, Sha1};
use url::Url;

use super::model::{ItemKey, RawItem};

/// Partner short-link segments (`/cc/AbC123`) carry no product identity.
static CC_SEGMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"/cc/[^/]+").unwrap());

/// Comma-appended partner tails (`/card/foo,cc12ab`).
static CC_TAIL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r",cc[^/]*").unwrap());

static MARKET_ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d{6,}$").unwrap());

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Query parameters that identify a product variant and survive
/// canonicalisation. Everything else (utm_*, clid, track, …) is dropped.
const IDENTIFYING_PARAMS: &[&str] = &["sku"];

const TITLE_KEY_CHARS: usize = 100;

/// Compute the canonical key for a raw item.
pub fn compute_key(raw: &RawItem) -> ItemKey {
    if let Some(offer) = non_empty(raw.offer_id.as_deref()) {
        return ItemKey::new(format!("offer:{}", offer.to_lowercase()));
    }
    if let Some(id) = non_empty(raw.market_id.as_deref()) {
        return ItemKey::new(format!("id:{id}"));
    }
    if let Some(key) = non_empty(raw.url.as_deref()).and_then(url_key) {
        return ItemKey::new(key);
    }
    ItemKey::new(format!("hash:{}", content_hash(&raw.title, raw.brand.as_deref())))
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

/// Canonical key for a URL, or `None` if it does not parse.
fn url_key(raw: &str) -> Option<String> {
    let parsed = if raw.contains("://") {
        Url::parse(raw)
    } else {
        Url::parse(&format!("https://{raw}"))
    }
    .ok()?;

    if let Some(offer) = parsed
        .query_pairs()
        .find(|(k, _)| k.eq_ignore_ascii_case("offerid"))
        .map(|(_, v)| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
    {
        return Some(format!("offer:{offer}"));
    }

    let path = canonical_path(parsed.path());
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    if let Some(id) = segments.iter().find(|s| MARKET_ID.is_match(s)) {
        return Some(format!("id:{id}"));
    }

    if let Some(pos) = segments.iter().position(|s| *s == "card") {
        if let Some(slug) = segments.get(pos + 1) {
            return Some(format!("card:{slug}"));
        }
    }

    let host = parsed.host_str()?.trim_start_matches("www.").to_lowercase();
    let mut key = format!("url:{host}{path}");

    let mut params: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| IDENTIFYING_PARAMS.iter().any(|p| k.eq_ignore_ascii_case(p)))
        .map(|(k, v)| (k.to_lowercase(), v.to_lowercase()))
        .collect();
    if !params.is_empty() {
        params.sort();
        let query: Vec<String> = params.into_iter().map(|(k, v)| format!("{k}={v}")).collect();
        key.push('?');
        key.push_str(&query.join("&"));
    }
    Some(key)
}

/// Lowercase, strip partner fragments, collapse duplicate slashes and drop
/// the trailing slash. The root path becomes the empty string.
fn canonical_path(path: &str) -> String {
    let lowered = path.to_lowercase();
    let stripped = CC_SEGMENT.replace_all(&lowered, "");
    let stripped = CC_TAIL.replace_all(&stripped, "");
    let segments: Vec<&str> = stripped.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        String::new()
    } else {
        format!("/{}", segments.join("/"))
    }
}

fn normalize_text(s: &str) -> String {
    WHITESPACE.replace_all(s.trim(), " ").to_lowercase()
}

fn content_hash(title: &str, brand: Option<&str>) -> String {
    let title: String = normalize_text(title).chars().take(TITLE_KEY_CHARS).collect();
    let brand = brand.map(normalize_text).unwrap_or_default();
    let mut hasher = Sha1::new();
    hasher.update(format!("title:{title}|brand:{brand}").as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_for_url(url: &str) -> String {
        compute_key(&RawItem::new("Some product").with_url(url))
            .as_str()
            .to_string()
    }

    #[test]
    fn explicit_ids_win_over_url() {
        let raw = RawItem::new("Phone")
            .with_offer_id("  AbC-42 ")
            .with_market_id("123456")
            .with_url("https://market.yandex.ru/product--phone/999999");
        assert_eq!(compute_key(&raw).as_str(), "offer:abc-42");

        let raw = RawItem::new("Phone")
            .with_market_id("123456")
            .with_url("https://market.yandex.ru/product--phone/999999");
        assert_eq!(compute_key(&raw).as_str(), "id:123456");
    }

    #[test]
    fn offerid_query_param() {
        assert_eq!(
            key_for_url("https://market.yandex.ru/product--x/123456?offerId=XyZ&utm_source=tg"),
            "offer:xyz"
        );
    }

    #[test]
    fn numeric_path_segment_is_market_id() {
        let a = key_for_url("https://market.yandex.ru/product--smartfon/1779349561?track=tabs");
        let b = key_for_url("market.yandex.ru/product--smartfon/1779349561/");
        let c = key_for_url("https://market.yandex.ru/cc/7xQz1/product--smartfon/1779349561#reviews");
        assert_eq!(a, "id:1779349561");
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn url_digits_share_the_market_id_namespace() {
        let explicit = compute_key(&RawItem::new("Phone").with_market_id("1779349561"));
        let from_url = compute_key(
            &RawItem::new("Phone").with_url("https://m.market.yandex.ru/product--smartfon/1779349561"),
        );
        assert_eq!(explicit, from_url);
    }

    #[test]
    fn short_numbers_are_not_ids() {
        assert_eq!(
            key_for_url("https://shop.example.com/catalog/12345/"),
            "url:shop.example.com/catalog/12345"
        );
    }

    #[test]
    fn card_slug() {
        assert_eq!(
            key_for_url("https://market.yandex.ru/card/Naushniki-Sony,cc4f2a?clid=1"),
            "card:naushniki-sony"
        );
    }

    #[test]
    fn generic_url_is_canonicalised() {
        let a = key_for_url("https://WWW.Shop.Example.com//Deals/Item-7/?utm_source=x&SKU=B2&sku=a1#top");
        let b = key_for_url("https://shop.example.com/deals/item-7?sku=A1&sku=b2");
        assert_eq!(a, b);
        assert_eq!(a, "url:shop.example.com/deals/item-7?sku=a1&sku=b2");
    }

    #[test]
    fn unparseable_url_falls_back_to_hash() {
        let raw = RawItem::new("Phone").with_url("http://[bad");
        assert!(compute_key(&raw).as_str().starts_with("hash:"));
    }

    #[test]
    fn hash_is_whitespace_and_case_insensitive() {
        let a = compute_key(&RawItem::new("  Super   Phone X ").with_brand("ACME"));
        let b = compute_key(&RawItem::new("super phone x").with_brand(" acme "));
        let c = compute_key(&RawItem::new("super phone x").with_brand("other"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.scheme(), "hash");
        assert_eq!(a.as_str().len(), "hash:".len() + 40);
    }

    #[test]
    fn deterministic_across_calls() {
        let raw = RawItem::new("Phone").with_url("https://market.yandex.ru/product--x/123456");
        let keys: Vec<ItemKey> = (0..5).map(|_| compute_key(&raw)).collect();
        assert!(keys.windows(2).all(|w| w[0] == w[1]));
    }
}
