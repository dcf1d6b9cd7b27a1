use once_cell::sync::Lazy;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::env;

pub static API_ROOT: Lazy<String> = Lazy::new(|| {
    env::var("OZON_API_ROOT")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| "https://api-seller.ozon.ru".to_string())
        .trim_end_matches('/')
        .to_string()
});

pub static SELLER_ROOT: Lazy<String> = Lazy::new(|| {
    env::var("OZON_SELLER_ROOT")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| "https://seller.ozon.ru".to_string())
        .trim_end_matches('/')
        .to_string()
});

const BROWSER_HEADERS: &[(&str, &str)] = &[
    ("accept", "application/json, text/plain, */*"),
    ("accept-language", "ru"),
    ("origin", "https://seller.ozon.ru"),
    ("priority", "u=1, i"),
    ("referer", "https://seller.ozon.ru/app/reviews?__rr=1"),
    (
        "sec-ch-ua",
        "\"Microsoft Edge\";v=\"135\", \"Not-A.Brand\";v=\"8\", \"Chromium\";v=\"135\"",
    ),
    ("sec-ch-ua-mobile", "?1"),
    ("sec-ch-ua-platform", "\"Android\""),
    ("sec-fetch-dest", "empty"),
    ("sec-fetch-mode", "cors"),
    ("sec-fetch-site", "same-origin"),
    (
        "user-agent",
        "Mozilla/5.0 (Linux; Android 6.0; Nexus 5 Build/MRA58N) AppleWebKit/537.36 \
         (KHTML, like Gecko) Chrome/135.0.0.0 Mobile Safari/537.36 Edg/135.0.0.0",
    ),
    ("x-o3-app-name", "seller-ui"),
    ("x-o3-language", "ru"),
    ("x-o3-page-type", "review"),
];

/// Headers the seller web UI sends, scoped to one company.
pub fn browser_headers(company_id: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for &(name, value) in BROWSER_HEADERS {
        headers.insert(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        );
    }
    if let Ok(value) = HeaderValue::from_str(company_id) {
        headers.insert(HeaderName::from_static("x-o3-company-id"), value);
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn browser_headers_carry_company() {
        let headers = browser_headers("12345");
        assert_eq!(headers.get("x-o3-company-id").unwrap(), "12345");
        assert_eq!(headers.get("x-o3-app-name").unwrap(), "seller-ui");
    }
}
