use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use data_model::SourceComment;
use reqwest::{header::LINK, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Deserialize};

use super::source::{SourceItem, TriggerSource};

const PAGE_SIZE: u32 = 100;
/// Listings longer than this are treated as a failed poll of the source.
const MAX_PAGES: usize = 20;
const USER_AGENT: &str = concat!("thopter-server/", env!("CARGO_PKG_VERSION"));

/// Polls issues and comments of one repository through the GitHub REST API.
pub struct GithubSource {
    client: reqwest::Client,
    api_url: String,
    repository: String,
    label: Option<String>,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GithubUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct GithubIssue {
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    user: GithubUser,
    html_url: String,
    updated_at: String,
}

#[derive(Debug, Deserialize)]
struct GithubComment {
    id: u64,
    #[serde(default)]
    body: Option<String>,
    user: GithubUser,
    created_at: String,
}

fn parse_timestamp(ts: &str) -> u64 {
    DateTime::parse_from_rfc3339(ts)
        .ok()
        .and_then(|dt| u64::try_from(dt.timestamp_millis()).ok())
        .unwrap_or(0)
}

fn format_since(since_ms: u64) -> String {
    let since = i64::try_from(since_ms)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_default();
    since.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Target of the `rel="next"` entry of a `Link` header.
fn next_page_url(link: &str) -> Option<String> {
    link.split(',').find_map(|entry| {
        let (target, params) = entry.split_once(';')?;
        params
            .split(';')
            .any(|param| param.trim() == r#"rel="next""#)
            .then(|| {
                target
                    .trim()
                    .trim_start_matches('<')
                    .trim_end_matches('>')
                    .to_string()
            })
    })
}

impl From<GithubIssue> for SourceItem {
    fn from(issue: GithubIssue) -> Self {
        SourceItem {
            number: issue.number,
            title: issue.title,
            body: issue.body.unwrap_or_default(),
            author: issue.user.login,
            url: issue.html_url,
            updated_at: parse_timestamp(&issue.updated_at),
        }
    }
}

impl From<GithubComment> for SourceComment {
    fn from(comment: GithubComment) -> Self {
        SourceComment {
            id: comment.id,
            author: comment.user.login,
            body: comment.body.unwrap_or_default(),
            created_at: parse_timestamp(&comment.created_at),
        }
    }
}

impl GithubSource {
    pub fn new(
        api_url: &str,
        repository: &str,
        label: Option<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("building github http client")?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            repository: repository.to_string(),
            label,
            token,
        })
    }

    fn issues_url(&self) -> String {
        format!("{}/repos/{}/issues", self.api_url, self.repository)
    }

    fn comments_url(&self, item_number: u64) -> String {
        format!("{}/{}/comments", self.issues_url(), item_number)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header("Accept", "application/vnd.github+json");
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check(response: Response, what: &str) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(anyhow!("{} failed with {}: {}", what, status, body))
    }

    /// Sends `first` and follows `Link: rel="next"` until the last page.
    async fn fetch_all<T: DeserializeOwned>(
        &self,
        first: RequestBuilder,
        what: &str,
    ) -> Result<Vec<T>> {
        let mut results = Vec::new();
        let mut request = first;
        for _ in 0..MAX_PAGES {
            let response = self
                .authorize(request)
                .send()
                .await
                .with_context(|| what.to_string())?;
            let response = Self::check(response, what).await?;
            let next = response
                .headers()
                .get(LINK)
                .and_then(|value| value.to_str().ok())
                .and_then(next_page_url);
            let page: Vec<T> = response
                .json()
                .await
                .with_context(|| format!("decoding response of {}", what))?;
            results.extend(page);
            match next {
                Some(url) => request = self.client.get(url),
                None => return Ok(results),
            }
        }
        Err(anyhow!("{} has more than {} pages", what, MAX_PAGES))
    }
}

#[async_trait]
impl TriggerSource for GithubSource {
    fn name(&self) -> &str {
        &self.repository
    }

    async fn list_updated_items(&self, since_ms: u64) -> Result<Vec<SourceItem>> {
        let mut query = vec![
            ("state", "open".to_string()),
            ("sort", "updated".to_string()),
            ("direction", "asc".to_string()),
            ("per_page", PAGE_SIZE.to_string()),
            ("since", format_since(since_ms)),
        ];
        if let Some(label) = &self.label {
            query.push(("labels", label.clone()));
        }
        let issues: Vec<GithubIssue> = self
            .fetch_all(
                self.client.get(self.issues_url()).query(&query),
                &format!("listing issues of {}", self.repository),
            )
            .await?;
        Ok(issues.into_iter().map(SourceItem::from).collect())
    }

    async fn list_comments(&self, item_number: u64) -> Result<Vec<SourceComment>> {
        let comments: Vec<GithubComment> = self
            .fetch_all(
                self.client
                    .get(self.comments_url(item_number))
                    .query(&[("per_page", PAGE_SIZE)]),
                &format!("listing comments of {}#{}", self.repository, item_number),
            )
            .await?;
        Ok(comments.into_iter().map(SourceComment::from).collect())
    }

    async fn create_comment(&self, item_number: u64, body: &str) -> Result<()> {
        let response = self
            .authorize(self.client.post(self.comments_url(item_number)))
            .json(&serde_json::json!({ "body": body }))
            .send()
            .await
            .with_context(|| format!("commenting on {}#{}", self.repository, item_number))?;
        Self::check(response, "creating comment").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use axum::{
        extract::{Query, State},
        http::header,
        response::{IntoResponse, Response},
        routing::get,
        Json,
        Router,
    };

    use super::*;

    /// Serves 150 comments on issue 42, 100 per page. The last one carries
    /// an ack marker.
    async fn comment_pages(
        State(base_url): State<String>,
        Query(params): Query<HashMap<String, String>>,
    ) -> Response {
        let page: u64 = params.get("page").and_then(|p| p.parse().ok()).unwrap_or(1);
        let ids = if page == 1 { 1..=100 } else { 101..=150 };
        let comments: Vec<serde_json::Value> = ids
            .map(|id| {
                let body = if id == 150 {
                    "<!-- trigger-ack:acme/widgets#42:body -->".to_string()
                } else {
                    format!("comment {}", id)
                };
                serde_json::json!({
                    "id": id,
                    "body": body,
                    "user": { "login": "octocat" },
                    "created_at": "2023-11-14T22:13:21Z"
                })
            })
            .collect();
        if page == 1 {
            let link = format!(
                r#"<{base}/repos/acme/widgets/issues/42/comments?per_page=100&page=2>; rel="next", <{base}/repos/acme/widgets/issues/42/comments?per_page=100&page=2>; rel="last""#,
                base = base_url
            );
            ([(header::LINK, link)], Json(comments)).into_response()
        } else {
            Json(comments).into_response()
        }
    }

    #[test]
    fn test_format_since() {
        assert_eq!(format_since(1_700_000_000_000), "2023-11-14T22:13:20Z");
        assert_eq!(format_since(0), "1970-01-01T00:00:00Z");
    }

    #[test]
    fn test_decode_issue_and_comment() {
        let issue: GithubIssue = serde_json::from_value(serde_json::json!({
            "number": 42,
            "title": "Login is broken",
            "body": null,
            "user": { "login": "octocat" },
            "html_url": "https://github.com/acme/widgets/issues/42",
            "updated_at": "2023-11-14T22:13:20Z",
            "labels": []
        }))
        .unwrap();
        let item = SourceItem::from(issue);
        assert_eq!(item.number, 42);
        assert_eq!(item.body, "");
        assert_eq!(item.updated_at, 1_700_000_000_000);

        let comment: GithubComment = serde_json::from_value(serde_json::json!({
            "id": 7,
            "body": "/thopter go",
            "user": { "login": "hubot" },
            "created_at": "2023-11-14T22:13:21Z"
        }))
        .unwrap();
        let comment = SourceComment::from(comment);
        assert_eq!(comment.id, 7);
        assert_eq!(comment.author, "hubot");
        assert_eq!(comment.created_at, 1_700_000_001_000);
    }

    #[test]
    fn test_urls() {
        let source = GithubSource::new(
            "https://api.github.com/",
            "acme/widgets",
            None,
            None,
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(source.name(), "acme/widgets");
        assert_eq!(
            source.comments_url(42),
            "https://api.github.com/repos/acme/widgets/issues/42/comments"
        );
    }

    #[test]
    fn test_next_page_url() {
        let link = r#"<https://api.github.com/repositories/1/issues?page=2>; rel="next", <https://api.github.com/repositories/1/issues?page=5>; rel="last""#;
        assert_eq!(
            next_page_url(link).as_deref(),
            Some("https://api.github.com/repositories/1/issues?page=2")
        );
        let last = r#"<https://api.github.com/repositories/1/issues?page=1>; rel="prev", <https://api.github.com/repositories/1/issues?page=1>; rel="first""#;
        assert_eq!(next_page_url(last), None);
        assert_eq!(next_page_url(""), None);
    }

    #[tokio::test]
    async fn test_list_comments_follows_pages() -> Result<()> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let base_url = format!("http://{}", listener.local_addr()?);
        let app = Router::new()
            .route("/repos/acme/widgets/issues/42/comments", get(comment_pages))
            .with_state(base_url.clone());
        tokio::spawn(async move { axum::serve(listener, app).await });

        let source = GithubSource::new(
            &base_url,
            "acme/widgets",
            None,
            None,
            Duration::from_secs(5),
        )?;
        let comments = source.list_comments(42).await?;

        assert_eq!(comments.len(), 150);
        assert_eq!(comments[0].id, 1);
        assert!(comments[149].body.contains("trigger-ack:acme/widgets#42:body"));
        Ok(())
    }
}
