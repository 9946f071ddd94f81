//! JSON contract for fetching a single feed by URL.
//!
//! Request `{ "url": ".." }`. Success is `200` with
//! `{ "title", "link", "items": [RawItem..] }`; failure is
//! `{ "error": <ErrorKind>, "message": ".." }` with `400` for a missing or
//! rejected URL, `504` for a timeout, and `502` for any other upstream
//! fetch or parse failure.

use serde::{Deserialize, Serialize};

use crate::feed::{ErrorKind, FetchError, Fetcher, RawItem};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedRequest {
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedResponse {
    pub title: String,
    pub link: String,
    pub items: Vec<RawItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireResponse {
    Ok(FeedResponse),
    Err { status: u16, body: ErrorResponse },
}

impl WireResponse {
    pub fn status(&self) -> u16 {
        match self {
            WireResponse::Ok(_) => 200,
            WireResponse::Err { status, .. } => *status,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, WireResponse::Ok(_))
    }

    pub fn to_json(&self) -> serde_json::Value {
        let value = match self {
            WireResponse::Ok(body) => serde_json::to_value(body),
            WireResponse::Err { body, .. } => serde_json::to_value(body),
        };
        // Both bodies are plain strings and vectors of them
        value.unwrap_or(serde_json::Value::Null)
    }
}

fn status_for(error: &FetchError) -> u16 {
    match error {
        FetchError::InvalidUrl(_) => 400,
        FetchError::Timeout => 504,
        _ => 502,
    }
}

/// Fetches and normalizes `request.url` without touching any store.
pub async fn fetch_feed_json(fetcher: &Fetcher, request: &FeedRequest) -> WireResponse {
    let url = request.url.trim();
    if url.is_empty() {
        return WireResponse::Err {
            status: 400,
            body: ErrorResponse {
                error: ErrorKind::InvalidUrl,
                message: "URL parameter is required".to_string(),
            },
        };
    }

    match fetcher.fetch_url(url).await {
        Ok((meta, items)) => WireResponse::Ok(FeedResponse {
            title: meta.title,
            link: meta.link,
            items,
        }),
        Err(e) => {
            tracing::warn!(url = %url, error = %e, "Feed request failed");
            WireResponse::Err {
                status: status_for(&e),
                body: ErrorResponse {
                    error: e.kind(),
                    message: e.to_string(),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FetchConfig;
    use crate::util::HostPolicy;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher(policy: HostPolicy) -> Fetcher {
        Fetcher::new(FetchConfig {
            host_policy: policy,
            max_retries: 0,
            ..FetchConfig::default()
        })
        .unwrap()
    }

    fn request(url: &str) -> FeedRequest {
        FeedRequest { url: url.into() }
    }

    #[tokio::test]
    async fn test_success_shape() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/atom"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<feed xmlns="http://www.w3.org/2005/Atom">
                    <title>Atom Mock</title>
                    <link href="https://mock.example/"/>
                    <entry><id>urn:1</id><title>First</title><link href="https://mock.example/1"/>
                    <updated>2024-01-01T00:00:00Z</updated><summary>Hi</summary></entry>
                </feed>"#,
            ))
            .mount(&server)
            .await;

        let response = fetch_feed_json(
            &fetcher(HostPolicy::AllowPrivate),
            &request(&format!("{}/atom", server.uri())),
        )
        .await;

        assert_eq!(response.status(), 200);
        assert_eq!(
            response.to_json(),
            json!({
                "title": "Atom Mock",
                "link": "https://mock.example/",
                "items": [{
                    "title": "First",
                    "link": "https://mock.example/1",
                    "contentHtml": "Hi",
                    "summaryHtml": "Hi",
                    "publishedAt": "2024-01-01T00:00:00Z",
                    "guid": "urn:1",
                    "author": null,
                    "enclosureUrl": null
                }]
            })
        );
    }

    #[tokio::test]
    async fn test_missing_url_is_client_error() {
        let response = fetch_feed_json(&fetcher(HostPolicy::PublicOnly), &request("  ")).await;
        assert_eq!(response.status(), 400);
        assert_eq!(
            response.to_json(),
            json!({ "error": "invalid_url", "message": "URL parameter is required" })
        );
    }

    #[tokio::test]
    async fn test_rejected_url_is_client_error() {
        for url in ["ftp://example.com/feed", "http://127.0.0.1/feed", "nonsense"] {
            let response = fetch_feed_json(&fetcher(HostPolicy::PublicOnly), &request(url)).await;
            assert_eq!(response.status(), 400, "{url}");
            assert_eq!(response.to_json()["error"], "invalid_url");
        }
    }

    #[tokio::test]
    async fn test_upstream_failures_are_bad_gateway() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/text"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<p>just html</p>"))
            .mount(&server)
            .await;

        let fetcher = fetcher(HostPolicy::AllowPrivate);
        let gone = fetch_feed_json(&fetcher, &request(&format!("{}/gone", server.uri()))).await;
        assert_eq!(gone.status(), 502);
        assert_eq!(gone.to_json()["error"], "http_status");

        let text = fetch_feed_json(&fetcher, &request(&format!("{}/text", server.uri()))).await;
        assert_eq!(text.status(), 502);
        assert_eq!(text.to_json()["error"], "parse");
    }

    #[test]
    fn test_request_deserializes_without_url() {
        let request: FeedRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(request.url, "");
    }
}
