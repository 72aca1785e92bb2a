use std::time::Duration;

use async_trait::async_trait;
use reqwest::tls::Version;
use serde_json::{json, Value};

use super::{Sink, SinkError};
use crate::event::LogEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookStyle {
    /// POST the raw event object.
    Generic,
    /// Slack incoming-webhook attachment with one field per event key.
    Slack,
    /// Teams MessageCard with one fact per event key.
    Teams,
}

/// Pushes each event to an HTTP endpoint. No retries; a failed POST is a
/// one-line diagnostic and the event moves on to the next sink.
pub struct WebhookSink {
    style: WebhookStyle,
    url: String,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(style: WebhookStyle, url: String) -> Result<WebhookSink, SinkError> {
        let client = reqwest::Client::builder()
            .min_tls_version(Version::TLS_1_2)
            .deflate(true)
            .brotli(true)
            .use_rustls_tls()
            .tls_built_in_root_certs(true)
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(WebhookSink { style, url, client })
    }

    fn payload(&self, event: &LogEvent) -> Value {
        match self.style {
            WebhookStyle::Generic => serde_json::to_value(event).unwrap_or(Value::Null),
            WebhookStyle::Slack => slack_payload(event),
            WebhookStyle::Teams => teams_payload(event),
        }
    }
}

#[async_trait]
impl Sink for WebhookSink {
    fn kind(&self) -> &'static str {
        match self.style {
            WebhookStyle::Generic => "webhook",
            WebhookStyle::Slack => "slack",
            WebhookStyle::Teams => "teams",
        }
    }

    async fn deliver(&mut self, event: &LogEvent) -> Result<(), SinkError> {
        let response = self
            .client
            .post(&self.url)
            .json(&self.payload(event))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SinkError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Event keys and display values in sorted key order.
fn event_fields(event: &LogEvent) -> Vec<(String, String)> {
    match serde_json::to_value(event) {
        Ok(Value::Object(map)) => map
            .into_iter()
            .map(|(key, value)| (key, display_value(value)))
            .collect(),
        _ => Vec::new(),
    }
}

fn display_value(value: Value) -> String {
    match value {
        Value::String(text) => text,
        other => other.to_string(),
    }
}

fn slack_payload(event: &LogEvent) -> Value {
    let fields: Vec<Value> = event_fields(event)
        .into_iter()
        .map(|(title, value)| {
            let short = value.len() < 30;
            json!({ "title": title, "value": value, "short": short })
        })
        .collect();
    json!({
        "attachments": [{
            "pretext": "decoyd Alert",
            "fields": fields,
        }]
    })
}

fn teams_payload(event: &LogEvent) -> Value {
    let facts: Vec<Value> = event_fields(event)
        .into_iter()
        .map(|(name, value)| json!({ "name": name, "value": value }))
        .collect();
    json!({
        "@type": "MessageCard",
        "@context": "http://schema.org/extensions",
        "summary": "decoyd Alert",
        "title": "decoyd Alert",
        "sections": [{ "facts": facts }],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, LogType};

    fn sample() -> LogEvent {
        Event::new(LogType::FTP_LOGIN_ATTEMPT)
            .data("USERNAME", "admin")
            .data("PASSWORD", "hunter2")
            .sanitize("node-test")
    }

    #[test]
    fn slack_fields_cover_every_event_key() {
        let payload = slack_payload(&sample());
        let fields = payload["attachments"][0]["fields"].as_array().unwrap();
        assert_eq!(payload["attachments"][0]["pretext"], "decoyd Alert");
        assert_eq!(fields.len(), 9);
        let titles: Vec<&str> = fields
            .iter()
            .map(|field| field["title"].as_str().unwrap())
            .collect();
        assert!(titles.contains(&"logtype"));
        assert!(titles.contains(&"src_host"));
    }

    #[test]
    fn slack_short_flag_tracks_value_length() {
        let payload = slack_payload(&sample());
        let fields = payload["attachments"][0]["fields"].as_array().unwrap();
        for field in fields {
            let value = field["value"].as_str().unwrap();
            assert_eq!(field["short"].as_bool().unwrap(), value.len() < 30);
        }
    }

    #[test]
    fn teams_card_shape() {
        let payload = teams_payload(&sample());
        assert_eq!(payload["@type"], "MessageCard");
        let facts = payload["sections"][0]["facts"].as_array().unwrap();
        assert!(facts
            .iter()
            .any(|fact| fact["name"] == "node_id" && fact["value"] == "node-test"));
    }

    #[test]
    fn logdata_renders_as_json_text() {
        let fields = event_fields(&sample());
        let (_, logdata) = fields.iter().find(|(key, _)| key == "logdata").unwrap();
        assert!(logdata.contains("\"USERNAME\":\"admin\""));
    }
}
