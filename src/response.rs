//! Accumulates bytes from the upstream proxy's CONNECT response until the
//! end of headers is seen, then extracts the status code and header map.
//!
//! Grounded on `PuttleProxy::handle_proxy_response`/`check_proxy_response`
//! in the original: the `\r\n\r\n`/`\n\n` end-of-headers detection, the
//! `HTTP/` prefix check, the "byte after the first space" status code
//! extraction, and last-write-wins duplicate header collapsing are all
//! carried over unchanged.

use std::collections::HashMap;

use crate::error::ProxyError;

/// Header map extracted from a response. Case-sensitive, matching the
/// original's plain `std::map<std::string, std::string>` (no
/// case-folding was ever applied).
pub type HeaderMap = HashMap<String, String>;

/// A parsed `CONNECT` response: status code plus header map.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: HeaderMap,
}

/// Accumulates bytes across possibly-many reads until the end of headers
/// is found.
#[derive(Debug, Default)]
pub struct ResponseAccumulator {
    buf: Vec<u8>,
}

impl ResponseAccumulator {
    pub fn new() -> Self {
        ResponseAccumulator { buf: Vec::new() }
    }

    /// Appends freshly-read bytes and reports whether the end of headers
    /// has now been seen.
    pub fn feed(&mut self, chunk: &[u8]) -> bool {
        self.buf.extend_from_slice(chunk);
        self.has_end_of_headers()
    }

    fn has_end_of_headers(&self) -> bool {
        contains(&self.buf, b"\r\n\r\n") || contains(&self.buf, b"\n\n")
    }

    /// Parses the accumulated buffer into a [`Response`]. Only call once
    /// [`Self::feed`] has returned `true`.
    pub fn parse(&self) -> Result<Response, ProxyError> {
        let text = String::from_utf8_lossy(&self.buf);

        if !text.starts_with("HTTP/") {
            return Err(ProxyError::MalformedResponse(
                "response does not start with HTTP/".to_string(),
            ));
        }

        let first_space = text
            .find(' ')
            .ok_or_else(|| ProxyError::MalformedResponse("no space in status line".to_string()))?;
        let status_str: String = text[first_space + 1..].chars().take(3).collect();
        let status: u16 = status_str
            .parse()
            .map_err(|_| ProxyError::MalformedResponse(format!("bad status code {:?}", status_str)))?;

        let mut headers = HeaderMap::new();
        let mut rest: &str = &text;
        while let Some(idx) = rest.find("\r\n") {
            let line = &rest[..idx];
            rest = &rest[idx + 2..];
            if line.is_empty() {
                break;
            }
            if let Some(sep) = line.find(": ") {
                let name = line[..sep].to_string();
                let value = line[sep + 2..].to_string();
                headers.insert(name, value);
            }
            // Lines without `": "` are ignored (typically the status line).
        }

        Ok(Response { status, headers })
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window == needle)
}
