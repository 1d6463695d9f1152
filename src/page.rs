//! Fetching the live page a routine extracts from.

use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::config::PageConfig;

#[derive(Debug, Error)]
#[error("failed to fetch {url}: {reason}")]
pub struct PageError {
    pub url: String,
    pub reason: String,
}

pub trait PageSource {
    fn fetch(&self, url: &str) -> Result<String, PageError>;
}

/// Plain HTTP GET. Script-rendered pages come back as served.
pub struct HttpPageSource {
    agent: ureq::Agent,
}

impl HttpPageSource {
    pub fn new(config: &PageConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(&config.user_agent)
            .build();
        Self { agent }
    }
}

impl PageSource for HttpPageSource {
    fn fetch(&self, url: &str) -> Result<String, PageError> {
        let fail = |reason: String| PageError {
            url: url.to_string(),
            reason,
        };
        let response = self.agent.get(url).call().map_err(|e| match e {
            ureq::Error::Status(code, _) => fail(format!("HTTP {code}")),
            ureq::Error::Transport(t) => fail(t.to_string()),
        })?;
        let body = response.into_string().map_err(|e| fail(e.to_string()))?;
        debug!(url, chars = body.chars().count(), "page fetched");
        Ok(body)
    }
}

/// Split `content` into pieces of at most `chunk_chars` characters.
pub fn split_page(content: &str, chunk_chars: usize) -> Vec<String> {
    if chunk_chars == 0 || content.is_empty() {
        return vec![content.to_string()];
    }
    let chars: Vec<char> = content.chars().collect();
    chars
        .chunks(chunk_chars)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_page_is_one_chunk() {
        assert_eq!(split_page("<html></html>", 100), vec!["<html></html>"]);
    }

    #[test]
    fn long_page_splits_on_char_boundaries() {
        let page = "é".repeat(5);
        let chunks = split_page(&page, 2);
        assert_eq!(chunks, vec!["éé", "éé", "é"]);
        assert_eq!(chunks.concat(), page);
    }

    #[test]
    fn zero_chunk_size_disables_splitting() {
        assert_eq!(split_page("abc", 0), vec!["abc"]);
    }

    #[test]
    fn empty_page_is_one_empty_chunk() {
        assert_eq!(split_page("", 10), vec![""]);
    }

    #[test]
    fn unreachable_host_is_an_error() {
        let source = HttpPageSource::new(&PageConfig {
            timeout_secs: 2,
            ..PageConfig::default()
        });
        let err = source.fetch("http://127.0.0.1:9/page").unwrap_err();
        assert_eq!(err.url, "http://127.0.0.1:9/page");
    }
}
