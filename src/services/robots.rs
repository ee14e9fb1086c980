//! robots.txt policy check, run before any browser work.
//!
//! The policy is lenient: a missing, unreachable, failing or unparseable
//! robots.txt allows the crawl.

use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::models::target::TargetUrl;

/// Whether a target may be crawled.
#[async_trait]
pub trait PolicyCheck: Send + Sync {
    async fn is_allowed(&self, target: &TargetUrl) -> bool;
}

/// Parsed robots.txt rules.
#[derive(Debug, Clone, Default)]
pub struct RobotsTxt {
    groups: Vec<Group>,
}

#[derive(Debug, Clone, Default)]
struct Group {
    /// Lowercased user-agent tokens
    agents: Vec<String>,
    rules: Vec<Rule>,
}

#[derive(Debug, Clone)]
struct Rule {
    allow: bool,
    pattern: String,
}

impl RobotsTxt {
    /// Parse robots.txt content.
    pub fn parse(content: &str) -> Self {
        let mut robots = Self::default();
        let mut current = Group::default();
        // Consecutive user-agent lines share one group.
        let mut collecting_agents = false;

        for line in content.lines() {
            let line = line.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }

            let Some((directive, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();

            match directive.trim().to_ascii_lowercase().as_str() {
                "user-agent" => {
                    if !collecting_agents && !current.agents.is_empty() {
                        robots.groups.push(std::mem::take(&mut current));
                    }
                    current.agents.push(value.to_ascii_lowercase());
                    collecting_agents = true;
                }
                directive @ ("allow" | "disallow") => {
                    collecting_agents = false;
                    // Rules before any user-agent line belong to no group.
                    if current.agents.is_empty() || value.is_empty() {
                        continue;
                    }
                    current.rules.push(Rule {
                        allow: directive == "allow",
                        pattern: value.to_string(),
                    });
                }
                _ => {
                    collecting_agents = false;
                }
            }
        }

        if !current.agents.is_empty() {
            robots.groups.push(current);
        }

        robots
    }

    /// Evaluate `path` (path plus query) for the wildcard agent. The longest
    /// matching pattern decides; on a tie `Allow` wins. No matching rule, or
    /// no `*` group at all, means allowed.
    pub fn is_allowed(&self, path: &str) -> bool {
        let mut best: Option<(usize, bool)> = None;

        for group in self.groups.iter().filter(|g| g.agents.iter().any(|a| a == "*")) {
            for rule in &group.rules {
                if !pattern_matches(&rule.pattern, path) {
                    continue;
                }
                let specificity = rule.pattern.len();
                best = match best {
                    Some((len, allow)) if len > specificity || (len == specificity && allow) => {
                        Some((len, allow))
                    }
                    _ => Some((specificity, rule.allow)),
                };
            }
        }

        best.map_or(true, |(_, allow)| allow)
    }
}

/// robots.txt path pattern: prefix match, `*` matches any run of characters,
/// a trailing `$` anchors the end.
fn pattern_matches(pattern: &str, path: &str) -> bool {
    let (pattern, anchored) = match pattern.strip_suffix('$') {
        Some(stripped) => (stripped, true),
        None => (pattern, false),
    };

    let mut parts = pattern.split('*');
    let first = parts.next().unwrap_or_default();
    if !path.starts_with(first) {
        return false;
    }
    let mut pos = first.len();

    let rest: Vec<&str> = parts.collect();
    if rest.is_empty() {
        return !anchored || pos == path.len();
    }

    for (i, part) in rest.iter().enumerate() {
        if anchored && i == rest.len() - 1 {
            return path.len() >= pos + part.len() && path.ends_with(part);
        }
        match path[pos..].find(part) {
            Some(offset) => pos += offset + part.len(),
            None => return false,
        }
    }

    true
}

/// Fetches `scheme://host/robots.txt` for each target with a bounded timeout.
pub struct RobotsChecker {
    http: reqwest::Client,
    timeout: Duration,
}

impl RobotsChecker {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .user_agent(crate::services::fetcher::USER_AGENT)
            .timeout(timeout)
            .build()?;
        Ok(Self { http, timeout })
    }

    /// `Ok(None)` when the origin answers with a non-success status.
    async fn fetch(&self, robots_url: &Url) -> Result<Option<RobotsTxt>, reqwest::Error> {
        let response = self
            .http
            .get(robots_url.clone())
            .timeout(self.timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            tracing::debug!(
                robots_url = %robots_url,
                status = %response.status(),
                "No usable robots.txt, allowing"
            );
            return Ok(None);
        }

        let content = response.text().await?;
        Ok(Some(RobotsTxt::parse(&content)))
    }
}

#[async_trait]
impl PolicyCheck for RobotsChecker {
    async fn is_allowed(&self, target: &TargetUrl) -> bool {
        let robots_url = target.robots_url();
        match self.fetch(&robots_url).await {
            Ok(Some(robots)) => robots.is_allowed(&target.path_and_query()),
            Ok(None) => true,
            Err(e) => {
                tracing::warn!(
                    robots_url = %robots_url,
                    error = %e,
                    "robots.txt fetch failed, allowing"
                );
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;

    #[test]
    fn test_parse_basic() {
        let content = r#"
User-agent: *
Disallow: /private/
Disallow: /admin/
Allow: /public/

Sitemap: https://example.com/sitemap.xml
        "#;

        let robots = RobotsTxt::parse(content);

        assert!(robots.is_allowed("/public/page"));
        assert!(!robots.is_allowed("/private/page"));
        assert!(!robots.is_allowed("/admin/"));
        assert!(robots.is_allowed("/other/page"));
    }

    #[test]
    fn test_only_wildcard_group_applies() {
        let content = r#"
User-agent: badbot
Disallow: /

User-agent: *
Disallow: /tmp/
        "#;

        let robots = RobotsTxt::parse(content);

        assert!(robots.is_allowed("/page"));
        assert!(!robots.is_allowed("/tmp/file"));
    }

    #[test]
    fn test_shared_group_for_consecutive_agents() {
        let content = r#"
User-agent: googlebot
User-agent: *
Disallow: /
        "#;

        assert!(!RobotsTxt::parse(content).is_allowed("/anything"));
    }

    #[test]
    fn test_longest_match_wins() {
        let content = r#"
User-agent: *
Disallow: /private/
Allow: /private/public/
        "#;

        let robots = RobotsTxt::parse(content);

        assert!(!robots.is_allowed("/private/secret"));
        assert!(robots.is_allowed("/private/public/page"));

        let reversed = RobotsTxt::parse("User-agent: *\nAllow: /docs\nDisallow: /docs/internal");
        assert!(!reversed.is_allowed("/docs/internal/a"));
        assert!(reversed.is_allowed("/docs/readme"));
    }

    #[test]
    fn test_wildcards_and_anchor() {
        let robots = RobotsTxt::parse("User-agent: *\nDisallow: /*.pdf$\nDisallow: /search*q=");

        assert!(!robots.is_allowed("/files/report.pdf"));
        assert!(robots.is_allowed("/files/report.pdf?download=1"));
        assert!(!robots.is_allowed("/search?lang=en&q=rust"));
        assert!(robots.is_allowed("/search"));
    }

    #[test]
    fn test_empty_and_indeterminate_allow() {
        assert!(RobotsTxt::parse("").is_allowed("/any/path"));
        assert!(RobotsTxt::parse("<html>not robots</html>").is_allowed("/"));
        // An empty Disallow allows everything.
        assert!(RobotsTxt::parse("User-agent: *\nDisallow:").is_allowed("/"));
    }

    #[test]
    fn test_disallow_all() {
        let robots = RobotsTxt::parse("User-agent: *\nDisallow: /");
        assert!(!robots.is_allowed("/"));
        assert!(!robots.is_allowed("/anything"));
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_network_error_allows() {
        let checker = RobotsChecker::new(Duration::from_secs(2)).unwrap();
        // Nothing listens on port 1.
        let target = TargetUrl::parse("http://127.0.0.1:1/page").unwrap();
        assert!(checker.is_allowed(&target).await);
    }

    #[tokio::test]
    async fn test_served_policy_is_enforced() {
        let base = serve(Router::new().route(
            "/robots.txt",
            get(|| async { "User-agent: *\nDisallow: /" }),
        ))
        .await;

        let checker = RobotsChecker::new(Duration::from_secs(5)).unwrap();
        let target = TargetUrl::parse(&format!("{base}/page")).unwrap();
        assert!(!checker.is_allowed(&target).await);
    }

    #[tokio::test]
    async fn test_error_status_allows() {
        let base = serve(Router::new().route(
            "/robots.txt",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        ))
        .await;

        let checker = RobotsChecker::new(Duration::from_secs(5)).unwrap();
        let target = TargetUrl::parse(&format!("{base}/page")).unwrap();
        assert!(checker.is_allowed(&target).await);
    }

    #[tokio::test]
    async fn test_slow_policy_times_out_and_allows() {
        let base = serve(Router::new().route(
            "/robots.txt",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "User-agent: *\nDisallow: /"
            }),
        ))
        .await;

        let checker = RobotsChecker::new(Duration::from_millis(200)).unwrap();
        let target = TargetUrl::parse(&format!("{base}/page")).unwrap();
        assert!(checker.is_allowed(&target).await);
    }
}
