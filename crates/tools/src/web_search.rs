//! Web search tool — looks things up on DuckDuckGo.
//!
//! Uses the DuckDuckGo Instant Answer API. When an instant answer exists it
//! is returned alone; otherwise related topics are returned as a result list.

use async_trait::async_trait;
use gemcord_core::error::ToolError;
use gemcord_core::tool::{ParamKind, Tool, ToolSchema};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const TOOL_NAME: &str = "web_search";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub href: String,
    pub body: String,
}

/// A search engine.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>, String>;
}

pub struct WebSearchTool {
    backend: Arc<dyn SearchBackend>,
    default_max_results: usize,
}

impl WebSearchTool {
    pub fn new(backend: Arc<dyn SearchBackend>, default_max_results: usize) -> Self {
        Self {
            backend,
            default_max_results,
        }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        TOOL_NAME
    }

    fn description(&self) -> &str {
        "Search the web for current information. Returns a list of results with a title, \
         a URL (href) and a text body."
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema::new()
            .required("query", ParamKind::String, "The search query")
            .optional(
                "max_results",
                ParamKind::Integer,
                "Maximum number of results to return",
            )
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        // Models like to wrap queries in quotes.
        let query = arguments["query"]
            .as_str()
            .unwrap_or_default()
            .trim()
            .trim_matches(|c| c == '"' || c == '\'');
        if query.is_empty() {
            return Err(ToolError::Failed {
                tool_name: TOOL_NAME.into(),
                reason: "query is empty".into(),
            });
        }

        let max_results = arguments["max_results"]
            .as_u64()
            .map(|n| n.clamp(1, 10) as usize)
            .unwrap_or(self.default_max_results);

        debug!(query = %query, max_results, "Searching the web");
        let results = self
            .backend
            .search(query, max_results)
            .await
            .map_err(|reason| ToolError::Failed {
                tool_name: TOOL_NAME.into(),
                reason,
            })?;

        Ok(serde_json::json!({
            "query": query,
            "results": results,
        }))
    }
}

/// DuckDuckGo Instant Answer API client.
pub struct DuckDuckGoBackend {
    client: reqwest::Client,
    base_url: String,
}

impl DuckDuckGoBackend {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("gemcord/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            base_url: "https://api.duckduckgo.com".into(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstantAnswer {
    #[serde(default)]
    answer: String,
    #[serde(default)]
    abstract_text: String,
    #[serde(rename = "AbstractURL", default)]
    abstract_url: String,
    #[serde(default)]
    related_topics: Vec<RelatedTopic>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RelatedTopic {
    #[serde(default)]
    text: Option<String>,
    #[serde(rename = "FirstURL", default)]
    first_url: Option<String>,
    /// Topic groups nest their entries here
    #[serde(default)]
    topics: Vec<RelatedTopic>,
}

fn flatten_topics(topics: Vec<RelatedTopic>, out: &mut Vec<SearchResult>, limit: usize) {
    for topic in topics {
        if out.len() >= limit {
            return;
        }
        match (topic.text, topic.first_url) {
            (Some(text), Some(href)) => {
                let title = text.split(" - ").next().unwrap_or(&text).to_string();
                out.push(SearchResult { title, href, body: text });
            }
            _ => flatten_topics(topic.topics, out, limit),
        }
    }
}

fn to_results(query: &str, answer: InstantAnswer, max_results: usize) -> Vec<SearchResult> {
    let direct = if !answer.answer.is_empty() {
        Some(answer.answer)
    } else if !answer.abstract_text.is_empty() {
        Some(answer.abstract_text)
    } else {
        None
    };

    if let Some(body) = direct {
        return vec![SearchResult {
            title: query.to_string(),
            href: answer.abstract_url,
            body,
        }];
    }

    let mut out = Vec::new();
    flatten_topics(answer.related_topics, &mut out, max_results);
    out
}

#[async_trait]
impl SearchBackend for DuckDuckGoBackend {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>, String> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("q", query),
                ("format", "json"),
                ("no_html", "1"),
                ("skip_disambig", "1"),
            ])
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("search returned HTTP {}", status.as_u16()));
        }

        let answer: InstantAnswer = response
            .json()
            .await
            .map_err(|e| format!("unreadable response: {e}"))?;
        Ok(to_results(query, answer, max_results))
    }
}
