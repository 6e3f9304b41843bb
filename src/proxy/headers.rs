/// Header appended to every response relayed from upstream.
pub const PROXY_MARKER_NAME: &str = "X-Proxied-By";
pub const PROXY_MARKER_VALUE: &str = "cachegate";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderLine {
    pub name: String,
    pub value: String,
    lower_name: String,
}

impl HeaderLine {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        let name_string = name.into();
        let lower_name = name_string.to_ascii_lowercase();
        Self {
            name: name_string,
            value: value.into(),
            lower_name,
        }
    }

    pub fn lower_name(&self) -> &str {
        &self.lower_name
    }
}

/// Ordered header list. Duplicates are kept in arrival order, which matters
/// for multi-valued headers such as `Set-Cookie`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderList {
    lines: Vec<HeaderLine>,
}

impl HeaderList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.lines.push(HeaderLine::new(name, value));
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeaderLine> {
        self.lines.iter()
    }

    /// First value for `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.lines
            .iter()
            .find(|line| line.lower_name.eq_ignore_ascii_case(name))
            .map(|line| line.value.as_str())
    }

    pub fn get_all<'s, 'n>(
        &'s self,
        name: &'n str,
    ) -> impl Iterator<Item = &'s str> + use<'s, 'n> {
        self.lines
            .iter()
            .filter(move |line| line.lower_name.eq_ignore_ascii_case(name))
            .map(|line| line.value.as_str())
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn encode_into(&self, buffer: &mut Vec<u8>) {
        for line in &self.lines {
            buffer.extend_from_slice(line.name.as_bytes());
            buffer.extend_from_slice(b": ");
            buffer.extend_from_slice(line.value.as_bytes());
            buffer.extend_from_slice(b"\r\n");
        }
    }
}

impl<N, V> FromIterator<(N, V)> for HeaderList
where
    N: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut list = HeaderList::new();
        for (name, value) in iter {
            list.push(name, value);
        }
        list
    }
}

/// Prepares upstream response headers for relaying and caching: comma-joined
/// `Set-Cookie` values are split into one line per cookie and the proxy
/// marker is appended.
pub fn process_response_headers(headers: &HeaderList) -> HeaderList {
    let mut processed = HeaderList::new();
    for line in headers.iter() {
        if line.lower_name() == "set-cookie" {
            for cookie in split_set_cookie(&line.value) {
                processed.push(line.name.clone(), cookie);
            }
            continue;
        }
        processed.push(line.name.clone(), line.value.clone());
    }
    processed.push(PROXY_MARKER_NAME, PROXY_MARKER_VALUE);
    processed
}

/// Splits on commas that are not followed by a space. Cookie `Expires`
/// attributes (`Wed, 21 Oct ...`) always carry a space after the comma, so
/// they stay intact.
pub fn split_set_cookie(value: &str) -> Vec<&str> {
    let bytes = value.as_bytes();
    let mut parts = Vec::new();
    let mut start = 0;
    for (idx, byte) in bytes.iter().enumerate() {
        if *byte == b',' && bytes.get(idx + 1) != Some(&b' ') {
            parts.push(&value[start..idx]);
            start = idx + 1;
        }
    }
    parts.push(&value[start..]);
    parts.retain(|part| !part.trim().is_empty());
    parts
}
