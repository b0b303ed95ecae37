//! Request header construction for authenticated feeds.

use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};

/// A header name or value from the feed config that HTTP cannot carry.
#[derive(Debug)]
pub struct InvalidHeader {
    pub name: String,
}

/// Formats an API token as an `Authorization: Bearer <token>` value.
///
/// The value is marked sensitive so it is redacted from `Debug` output.
pub fn bearer(token: &str) -> Result<HeaderValue, InvalidHeader> {
    let mut value =
        HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| InvalidHeader {
            name: AUTHORIZATION.to_string(),
        })?;
    value.set_sensitive(true);
    Ok(value)
}

/// Merges explicitly configured headers with the bearer header derived from
/// `api_token`.
///
/// Explicit headers are applied first, in iteration order, and the derived
/// `Authorization` header last. Names compare case-insensitively, so on any
/// collision the later write wins: a token always overrides an explicit
/// `Authorization` header.
pub fn request_headers<'a, I>(
    explicit: I,
    api_token: Option<&str>,
) -> Result<HeaderMap, InvalidHeader>
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    let mut headers = HeaderMap::new();

    for (name, value) in explicit {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| InvalidHeader { name: name.clone() })?;
        let header_value =
            HeaderValue::from_str(value).map_err(|_| InvalidHeader { name: name.clone() })?;
        headers.insert(header_name, header_value);
    }

    if let Some(token) = api_token {
        headers.insert(AUTHORIZATION, bearer(token)?);
    }

    Ok(headers)
}
