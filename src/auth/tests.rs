//! Unit tests for bearer token extraction

use super::*;
use axum::http::HeaderValue;

fn headers_with_auth(value: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("authorization", HeaderValue::from_str(value).unwrap());
    headers
}

#[test]
fn test_extract_valid_bearer_token() {
    let headers = headers_with_auth("Bearer user-42");
    assert_eq!(extract_bearer_token(&headers), Ok("user-42".to_string()));
}

#[test]
fn test_scheme_is_case_insensitive() {
    let headers = headers_with_auth("bearer user-42");
    assert_eq!(extract_bearer_token(&headers), Ok("user-42".to_string()));
}

#[test]
fn test_missing_header() {
    let headers = HeaderMap::new();
    assert_eq!(extract_bearer_token(&headers), Err(TokenError::Missing));
}

#[test]
fn test_wrong_scheme() {
    let headers = headers_with_auth("Basic dXNlcjpwYXNz");
    assert_eq!(
        extract_bearer_token(&headers),
        Err(TokenError::InvalidFormat)
    );
}

#[test]
fn test_no_token_part() {
    let headers = headers_with_auth("Bearer");
    assert_eq!(
        extract_bearer_token(&headers),
        Err(TokenError::InvalidFormat)
    );
}

#[test]
fn test_empty_token() {
    let headers = headers_with_auth("Bearer   ");
    assert_eq!(extract_bearer_token(&headers), Err(TokenError::Empty));
}
