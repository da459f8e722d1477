//! Read-only access to past detections kept by the history collaborator.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: String,
    #[serde(alias = "threatType")]
    pub threat_type: String,
    #[serde(alias = "imageLink", default)]
    pub image_link: String,
}

/// Either a bare array or `{"entries": [...]}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum HistoryPayload {
    Bare(Vec<HistoryEntry>),
    Wrapped { entries: Vec<HistoryEntry> },
}

pub struct HistoryClient {
    url: String,
    agent: ureq::Agent,
}

impl HistoryClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            agent: ureq::AgentBuilder::new()
                .timeout_connect(timeout)
                .timeout(timeout)
                .build(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn fetch(&self) -> Result<Vec<HistoryEntry>> {
        let response = self
            .agent
            .get(&self.url)
            .call()
            .with_context(|| format!("request threat history from {}", self.url))?;
        let body = response
            .into_string()
            .context("read threat history response")?;
        parse_history(&body)
    }
}

pub fn parse_history(body: &str) -> Result<Vec<HistoryEntry>> {
    let payload: HistoryPayload =
        serde_json::from_str(body).context("parse threat history json")?;
    Ok(match payload {
        HistoryPayload::Bare(entries) => entries,
        HistoryPayload::Wrapped { entries } => entries,
    })
}

pub fn render_history_table(entries: &[HistoryEntry]) -> String {
    const HEADERS: [&str; 3] = ["TIMESTAMP", "THREAT", "IMAGE"];
    if entries.is_empty() {
        return "no recorded threats\n".to_string();
    }
    let mut widths = HEADERS.map(str::len);
    for entry in entries {
        widths[0] = widths[0].max(entry.timestamp.chars().count());
        widths[1] = widths[1].max(entry.threat_type.chars().count());
    }

    let mut out = String::new();
    push_row(&mut out, &widths, HEADERS);
    for entry in entries {
        let image = if entry.image_link.is_empty() {
            "-"
        } else {
            entry.image_link.as_str()
        };
        push_row(
            &mut out,
            &widths,
            [entry.timestamp.as_str(), entry.threat_type.as_str(), image],
        );
    }
    out
}

fn push_row(out: &mut String, widths: &[usize; 3], cells: [&str; 3]) {
    let line = format!(
        "{:<w0$}  {:<w1$}  {}",
        cells[0],
        cells[1],
        cells[2],
        w0 = widths[0],
        w1 = widths[1]
    );
    out.push_str(line.trim_end());
    out.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    #[test]
    fn parses_both_field_spellings() {
        let entries = parse_history(
            r#"[
                {"timestamp": "2024-05-01 10:00", "threatType": "Knife", "imageLink": "http://x/1.jpg"},
                {"timestamp": "2024-05-01 10:05", "threat_type": "Gun"}
            ]"#,
        )
        .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].threat_type, "Knife");
        assert_eq!(entries[0].image_link, "http://x/1.jpg");
        assert_eq!(entries[1].image_link, "");
    }

    #[test]
    fn parses_wrapped_payload() {
        let entries =
            parse_history(r#"{"entries": [{"timestamp": "t", "threat_type": "Gun"}]}"#).unwrap();
        assert_eq!(entries[0].timestamp, "t");
    }

    #[test]
    fn rejects_malformed_payload() {
        assert!(parse_history("{\"rows\": 1}").is_err());
        assert!(parse_history("not json").is_err());
    }

    #[test]
    fn table_aligns_columns() {
        let entries = vec![
            HistoryEntry {
                timestamp: "2024-05-01 10:00".to_string(),
                threat_type: "Knife".to_string(),
                image_link: "http://x/1.jpg".to_string(),
            },
            HistoryEntry {
                timestamp: "t2".to_string(),
                threat_type: "Gun".to_string(),
                image_link: String::new(),
            },
        ];
        let table = render_history_table(&entries);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines[0], "TIMESTAMP         THREAT  IMAGE");
        assert_eq!(lines[1], "2024-05-01 10:00  Knife   http://x/1.jpg");
        assert_eq!(lines[2], "t2                Gun     -");
        assert_eq!(render_history_table(&[]), "no recorded threats\n");
    }

    #[test]
    fn fetches_over_http() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).unwrap();
            let body = r#"[{"timestamp":"t","threatType":"Gun","imageLink":""}]"#;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).unwrap();
        });

        let client = HistoryClient::new(
            format!("http://{}/history", addr),
            Duration::from_secs(2),
        );
        let entries = client.fetch().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].threat_type, "Gun");
        server.join().unwrap();
    }
}
