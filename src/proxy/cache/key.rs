/// Identity of a cached response: the absolute request URL plus the client's
/// `User-Agent`, so agents that receive different representations never share
/// an entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    uri: String,
    user_agent: Option<String>,
}

impl CacheKey {
    pub fn new(uri: impl Into<String>, user_agent: Option<&str>) -> Self {
        Self {
            uri: uri.into(),
            user_agent: user_agent.map(str::to_string),
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }
}
