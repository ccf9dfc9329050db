use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// Immutable relay configuration.
///
/// Built once at process start and passed explicitly into every component.
/// Nothing in this crate reads ambient/global state.
#[derive(Debug, Clone)]
pub struct Config {
    upstream_url: String,
    account_number: String,
    database_path: PathBuf,
    allow_list: AllowList,
}

impl Config {
    /// Create a configuration for the given signal-cli base URL and the
    /// relay's own account number.
    ///
    /// Defaults:
    /// - database path: `messages.db` in the working directory
    /// - callback allow-list: empty (every subscribe attempt is rejected)
    pub fn new(upstream_url: impl Into<String>, account_number: impl Into<String>) -> Self {
        let mut upstream_url = upstream_url.into();
        while upstream_url.ends_with('/') {
            upstream_url.pop();
        }
        Self {
            upstream_url,
            account_number: account_number.into(),
            database_path: PathBuf::from("messages.db"),
            allow_list: AllowList::default(),
        }
    }

    /// Set the SQLite database path.
    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = path.into();
        self
    }

    /// Set the callback-URL allow-list.
    pub fn with_allow_list(mut self, allow_list: AllowList) -> Self {
        self.allow_list = allow_list;
        self
    }

    pub fn account_number(&self) -> &str {
        &self.account_number
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn allow_list(&self) -> &AllowList {
        &self.allow_list
    }

    /// URL of the upstream SSE event stream.
    pub fn events_url(&self) -> String {
        format!("{}/api/v1/events", self.upstream_url)
    }

    /// URL of the upstream JSON-RPC endpoint.
    pub fn rpc_url(&self) -> String {
        format!("{}/api/v1/rpc", self.upstream_url)
    }
}

/// Allow-list of hosts that webhook callbacks may resolve to.
///
/// Entries are exact hostnames or IP addresses. IP entries are compared as
/// parsed addresses, so textual variants of the same address match. An empty
/// list permits nothing.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    entries: Vec<String>,
}

impl AllowList {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entries: entries.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether the given host (hostname or IP literal) is allow-listed.
    pub fn permits_host(&self, host: &str) -> bool {
        if self.entries.iter().any(|e| e == host) {
            return true;
        }

        // Exact string match failed; retry as a parsed IP so that
        // "127.0.0.1" and "127.000.000.001" compare equal.
        let Ok(ip) = host.parse::<IpAddr>() else {
            return false;
        };
        self.entries
            .iter()
            .filter_map(|e| e.parse::<IpAddr>().ok())
            .any(|allowed| allowed == ip)
    }

    /// Whether a full callback URL points at an allow-listed host.
    ///
    /// Returns `None` when the URL cannot be parsed or has no host.
    pub fn permits_url(&self, url: &str) -> Option<bool> {
        let parsed = reqwest::Url::parse(url).ok()?;
        let host = parsed.host_str()?;
        Some(self.permits_host(host))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_urls_strip_trailing_slash() {
        let config = Config::new("http://localhost:8080/", "+15550001111");
        assert_eq!(config.events_url(), "http://localhost:8080/api/v1/events");
        assert_eq!(config.rpc_url(), "http://localhost:8080/api/v1/rpc");
    }

    #[test]
    fn allow_list_matches_hostname_exactly() {
        let list = AllowList::new(["hooks.internal", "127.0.0.1"]);
        assert!(list.permits_host("hooks.internal"));
        assert!(!list.permits_host("hooks.internal.evil.com"));
        assert!(!list.permits_host("other.internal"));
    }

    #[test]
    fn allow_list_matches_ip_by_value() {
        let list = AllowList::new(["127.0.0.1"]);
        assert!(list.permits_host("127.0.0.1"));
        assert!(list.permits_host("127.000.000.001"));
        assert!(!list.permits_host("127.0.0.2"));
    }

    #[test]
    fn empty_allow_list_permits_nothing() {
        let list = AllowList::default();
        assert!(!list.permits_host("127.0.0.1"));
        assert_eq!(list.permits_url("http://127.0.0.1/hook"), Some(false));
    }

    #[test]
    fn permits_url_extracts_host() {
        let list = AllowList::new(["10.0.0.5"]);
        assert_eq!(list.permits_url("http://10.0.0.5:9000/hook"), Some(true));
        assert_eq!(list.permits_url("http://10.0.0.6/hook"), Some(false));
        assert_eq!(list.permits_url("not a url"), None);
    }
}
