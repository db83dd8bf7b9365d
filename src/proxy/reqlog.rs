//! Request/response logging for the proxy.
//!
//! Every transaction that reaches the proxy produces exactly one
//! [`RequestRecord`], serialized as a single JSON line and appended to the
//! rotating gzip sink. Bodies are fully buffered by the server before the
//! record is started, so logging never consumes a stream the forwarding
//! path still needs.
//!
//! Header values for names on the redaction list are replaced with
//! `[redacted]` at capture time. Injected credentials never appear at all:
//! capture happens before credential injection.

use super::rotating::{RotatingFileConfig, RotatingFileWriter};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use hyper::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;
use tracing::warn;

/// File name prefix for request logs.
pub const LOG_FILE_PREFIX: &str = "requests";

/// File name suffix for request logs.
pub const LOG_FILE_SUFFIX: &str = ".jsonl.gz";

/// One logged request/response pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    /// Request receipt time.
    pub ts: DateTime<Utc>,
    /// HTTP method.
    pub method: String,
    /// Full request URL.
    pub url: String,
    /// Request headers, deep-cloned at capture.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub req_headers: HashMap<String, Vec<String>>,
    /// Request body, base64-encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub req_body: Option<String>,
    /// Response status code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Response headers.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub resp_headers: HashMap<String, Vec<String>>,
    /// Response body, base64-encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resp_body: Option<String>,
    /// Wall time from receipt to response completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ns: Option<u64>,
    /// Error description when no response was produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Serializes request/response pairs into the rotating sink.
pub struct RequestLogger {
    writer: Mutex<RotatingFileWriter>,
    /// Lowercased header names whose values are redacted in records.
    redact: Vec<String>,
}

impl RequestLogger {
    /// Create a logger writing into `dir` with the given size/retention
    /// limits and header redaction list.
    pub fn new(
        dir: &Path,
        max_size: u64,
        max_files: usize,
        redact_headers: &[String],
    ) -> io::Result<Self> {
        let mut config = RotatingFileConfig::new(dir.to_path_buf(), LOG_FILE_PREFIX, LOG_FILE_SUFFIX);
        config.max_size = max_size;
        config.max_files = max_files;

        Ok(Self {
            writer: Mutex::new(RotatingFileWriter::new(config)?),
            redact: redact_headers.iter().map(|h| h.to_lowercase()).collect(),
        })
    }

    /// Start a record from the already-buffered request.
    pub fn begin(
        &self,
        method: &hyper::Method,
        url: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> RequestRecord {
        RequestRecord {
            ts: Utc::now(),
            method: method.to_string(),
            url: url.to_string(),
            req_headers: self.clone_headers(headers),
            req_body: encode_body(body),
            status: None,
            resp_headers: HashMap::new(),
            resp_body: None,
            duration_ns: None,
            error: None,
        }
    }

    /// Fill in the response half of a record. `response` of `None` marks a
    /// transaction that produced no response.
    pub fn complete(
        &self,
        record: &mut RequestRecord,
        response: Option<(u16, &HeaderMap, &[u8])>,
        started: Instant,
    ) {
        record.duration_ns = Some(started.elapsed().as_nanos() as u64);
        match response {
            Some((status, headers, body)) => {
                record.status = Some(status);
                record.resp_headers = self.clone_headers(headers);
                record.resp_body = encode_body(body);
            }
            None => record.error = Some("no response".to_string()),
        }
    }

    /// Serialize and append one record. Write failures are reported to
    /// stderr and never fail the request.
    pub fn log(&self, record: &RequestRecord) {
        let mut line = match serde_json::to_vec(record) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to serialize request record: {}", e);
                return;
            }
        };
        line.push(b'\n');

        if let Err(e) = self.writer.lock().unwrap().write(&line) {
            warn!("Failed to write request log: {}", e);
        }
    }

    /// Flush and close the sink.
    pub fn close(&self) -> io::Result<()> {
        self.writer.lock().unwrap().close()
    }

    fn clone_headers(&self, headers: &HeaderMap) -> HashMap<String, Vec<String>> {
        let mut map: HashMap<String, Vec<String>> = HashMap::with_capacity(headers.len());
        for (name, value) in headers {
            let name = name.as_str().to_string();
            let value = if self.redact.contains(&name.to_lowercase()) {
                "[redacted]".to_string()
            } else {
                String::from_utf8_lossy(value.as_bytes()).into_owned()
            };
            map.entry(name).or_default().push(value);
        }
        map
    }
}

fn encode_body(body: &[u8]) -> Option<String> {
    if body.is_empty() {
        None
    } else {
        Some(BASE64.encode(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::rotating;
    use hyper::header::{HeaderName, HeaderValue};
    use hyper::Method;

    fn logger(dir: &Path) -> RequestLogger {
        RequestLogger::new(dir, 1024 * 1024, 3, &["authorization".to_string()]).unwrap()
    }

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                name.parse::<HeaderName>().unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn record_round_trips_through_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let logger = logger(dir.path());

        let started = Instant::now();
        let mut record = logger.begin(
            &Method::POST,
            "https://api.example.com/v1/things",
            &headers(&[("content-type", "application/json")]),
            br#"{"a":1}"#,
        );
        logger.complete(
            &mut record,
            Some((201, &headers(&[("content-length", "2")]), b"ok")),
            started,
        );
        logger.log(&record);
        logger.close().unwrap();

        let content =
            rotating::read_all(dir.path(), LOG_FILE_PREFIX, LOG_FILE_SUFFIX).unwrap();
        let lines: Vec<&[u8]> = content.split(|&b| b == b'\n').filter(|l| !l.is_empty()).collect();
        assert_eq!(lines.len(), 1);

        let parsed: RequestRecord = serde_json::from_slice(lines[0]).unwrap();
        assert_eq!(parsed.method, "POST");
        assert_eq!(parsed.url, "https://api.example.com/v1/things");
        assert_eq!(parsed.status, Some(201));
        assert_eq!(parsed.resp_body, Some(BASE64.encode(b"ok")));
        assert!(parsed.duration_ns.is_some());
        assert!(parsed.error.is_none());
    }

    #[test]
    fn missing_response_sets_error() {
        let dir = tempfile::tempdir().unwrap();
        let logger = logger(dir.path());

        let mut record = logger.begin(&Method::GET, "http://x/", &HeaderMap::new(), b"");
        logger.complete(&mut record, None, Instant::now());

        assert_eq!(record.error.as_deref(), Some("no response"));
        assert!(record.status.is_none());
    }

    #[test]
    fn headers_are_deep_cloned_with_all_values() {
        let dir = tempfile::tempdir().unwrap();
        let logger = logger(dir.path());

        let map = headers(&[("accept", "text/html"), ("accept", "application/json")]);
        let record = logger.begin(&Method::GET, "http://x/", &map, b"");

        assert_eq!(
            record.req_headers.get("accept").unwrap(),
            &vec!["text/html".to_string(), "application/json".to_string()]
        );
    }

    #[test]
    fn redaction_list_hides_values() {
        let dir = tempfile::tempdir().unwrap();
        let logger = logger(dir.path());

        let map = headers(&[("authorization", "Bearer sekrit"), ("accept", "*/*")]);
        let record = logger.begin(&Method::GET, "http://x/", &map, b"");

        assert_eq!(
            record.req_headers.get("authorization").unwrap(),
            &vec!["[redacted]".to_string()]
        );
        assert_eq!(record.req_headers.get("accept").unwrap(), &vec!["*/*".to_string()]);
    }

    #[test]
    fn empty_body_is_omitted() {
        let dir = tempfile::tempdir().unwrap();
        let logger = logger(dir.path());

        let record = logger.begin(&Method::GET, "http://x/", &HeaderMap::new(), b"");
        assert!(record.req_body.is_none());

        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("req_body"));
    }
}
