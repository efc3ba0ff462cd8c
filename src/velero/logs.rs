//! Backup controller log parsing
//!
//! Log bundles are gzip-compressed, one logfmt record per line:
//!
//! ```text
//! time="2024-01-02T03:04:05Z" level=info msg="running exec hook" hookName=dump name=db-0
//! ```
//!
//! Parsing is best effort. Only broken gzip framing is an error; lines that
//! do not tokenize are skipped.

use chrono::{DateTime, Utc};
use flate2::read::MultiGzDecoder;
use indexmap::IndexMap;
use std::io::Read;
use tracing::debug;

use crate::error::{Error, Result};

/// One parsed log line, fields in the order they appeared
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogRecord {
    fields: IndexMap<String, String>,
}

impl LogRecord {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn level(&self) -> Option<&str> {
        self.get("level")
    }

    pub fn msg(&self) -> Option<&str> {
        self.get("msg")
    }

    /// Record timestamp, if present and RFC 3339
    pub fn time(&self) -> Option<DateTime<Utc>> {
        self.get("time")
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
    }

    pub fn fields(&self) -> &IndexMap<String, String> {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Parser for controller log bundles
#[derive(Debug, Clone, Copy, Default)]
pub struct LogParser;

impl LogParser {
    /// Decompress and parse a log bundle
    pub fn parse(raw: &[u8]) -> Result<Vec<LogRecord>> {
        let mut text = Vec::new();
        MultiGzDecoder::new(raw)
            .read_to_end(&mut text)
            .map_err(|e| Error::DecompressionError(e.to_string()))?;
        Ok(Self::parse_text(&String::from_utf8_lossy(&text)))
    }

    /// Parse already-decompressed log text
    pub fn parse_text(text: &str) -> Vec<LogRecord> {
        let mut skipped = 0usize;
        let records: Vec<LogRecord> = text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|line| {
                let record = Self::parse_line(line);
                if record.is_none() {
                    skipped += 1;
                }
                record
            })
            .collect();

        if skipped > 0 {
            debug!(skipped, parsed = records.len(), "skipped malformed log lines");
        }
        records
    }

    /// Tokenize one logfmt line
    pub fn parse_line(line: &str) -> Option<LogRecord> {
        let mut fields = IndexMap::new();
        let mut chars = line.chars().peekable();

        loop {
            while chars.next_if(|c| c.is_whitespace()).is_some() {}
            if chars.peek().is_none() {
                break;
            }

            let mut key = String::new();
            while let Some(c) = chars.next_if(|c| !c.is_whitespace() && *c != '=') {
                key.push(c);
            }
            if key.is_empty() || key.contains('"') {
                return None;
            }

            if chars.next_if_eq(&'=').is_none() {
                fields.insert(key, String::new());
                continue;
            }

            let value = if chars.next_if_eq(&'"').is_some() {
                let mut value = String::new();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '"' => {
                            closed = true;
                            break;
                        }
                        '\\' => match chars.next()? {
                            'n' => value.push('\n'),
                            't' => value.push('\t'),
                            'r' => value.push('\r'),
                            '"' => value.push('"'),
                            '\\' => value.push('\\'),
                            other => {
                                value.push('\\');
                                value.push(other);
                            }
                        },
                        c => value.push(c),
                    }
                }
                if !closed {
                    return None;
                }
                value
            } else {
                let mut value = String::new();
                while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                    value.push(c);
                }
                value
            };

            fields.insert(key, value);
        }

        if fields.is_empty() {
            None
        } else {
            Some(LogRecord { fields })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::gzip;
    use assert_matches::assert_matches;

    const HOOK_LINE: &str = r#"time="2024-01-02T03:04:05Z" level=info msg="running exec hook" backup=velero/manual-1 hookCommand="[/bin/sh -c \"pg_dump > /tmp/x\"]" hookName=dump hookPhase=pre name=db-0 namespace=acme"#;

    #[test]
    fn test_parse_line_fields() {
        let record = LogParser::parse_line(HOOK_LINE).unwrap();
        assert_eq!(record.level(), Some("info"));
        assert_eq!(record.msg(), Some("running exec hook"));
        assert_eq!(record.get("hookName"), Some("dump"));
        assert_eq!(
            record.get("hookCommand"),
            Some(r#"[/bin/sh -c "pg_dump > /tmp/x"]"#)
        );
        assert_eq!(record.get("namespace"), Some("acme"));
        assert_eq!(
            record.time().unwrap().to_rfc3339(),
            "2024-01-02T03:04:05+00:00"
        );
        assert_eq!(record.fields().keys().next().map(String::as_str), Some("time"));
    }

    #[test]
    fn test_escapes_and_bare_keys() {
        let record = LogParser::parse_line(r#"msg="stdout: a\nb" verbose level="""#).unwrap();
        assert_eq!(record.msg(), Some("stdout: a\nb"));
        assert_eq!(record.get("verbose"), Some(""));
        assert_eq!(record.level(), Some(""));
    }

    #[test]
    fn test_malformed_lines_rejected() {
        assert!(LogParser::parse_line(r#"msg="never closed"#).is_none());
        assert!(LogParser::parse_line("=value").is_none());
        assert!(LogParser::parse_line(r#""quoted" key=v"#).is_none());
        assert!(LogParser::parse_line("   ").is_none());
    }

    #[test]
    fn test_parse_bundle_skips_bad_lines() {
        let text = format!(
            "{}\nthis=\"is broken\n\nlevel=warning msg=\"second\"\n",
            HOOK_LINE
        );
        let records = LogParser::parse(&gzip(&text)).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].msg(), Some("second"));
    }

    #[test]
    fn test_invalid_gzip_is_decompression_error() {
        let err = LogParser::parse(b"plain text, not gzip").unwrap_err();
        assert_matches!(err, Error::DecompressionError(_));
    }
}
