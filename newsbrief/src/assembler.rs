//! Renders a topic digest into the email sent to every subscriber of that topic.
//!
//! Pure: no I/O, no clock. The same `Digest` always renders to the same message, which is what
//! lets the dispatcher reuse one body for the whole subscriber list.

use crate::model::{Digest, EmailMessage, Topic};

#[derive(Debug, Clone, Default)]
pub struct AssemblerOptions {
    /// Site where readers manage their subscription; linked from the footer.
    pub frontend_url: Option<String>,
    pub newsletter_name: String,
}

pub fn subject_for(topic: &Topic) -> String {
    format!("Weekly News Summary for {}", topic.display_name)
}

/// Build subject, HTML body and plain-text body for a topic digest.
///
/// Citations are rendered in the digest's order, which is the search ranking order.
/// An empty summary or a digest for another topic is a caller bug.
pub fn assemble(topic: &Topic, digest: &Digest, options: &AssemblerOptions) -> EmailMessage {
    assert_eq!(digest.topic_id, topic.id, "digest assembled for the wrong topic");
    assert!(!digest.summary.trim().is_empty(), "digest summary is empty");

    let mut html = String::with_capacity(digest.summary.len() + 2048);
    html.push_str(HTML_HEAD);
    html.push_str("<div><h1>Hey there! &#128075;</h1></div>\n");
    html.push_str(&format!(
        "<p class=\"intro\">Here is this week's digest for <strong>{}</strong>.</p>\n",
        escape(&topic.display_name)
    ));
    html.push_str("<div class=\"summary\">\n");
    html.push_str(&digest.summary);
    html.push_str("\n</div>\n");

    html.push_str("<div class=\"articles\">\n<h2>Source Articles</h2>\n");
    for (i, c) in digest.citations.iter().enumerate() {
        let title = if c.title.is_empty() { "Untitled" } else { c.title.as_str() };
        html.push_str("<div class=\"article\">\n");
        html.push_str(&format!(
            "<div class=\"title\">[{}] {}</div>\n",
            i + 1,
            escape(title)
        ));
        if let Some(meta) = source_line(c.source.as_deref(), c.date.as_deref()) {
            html.push_str(&format!("<div class=\"source\">{}</div>\n", escape(&meta)));
        }
        html.push_str(&format!(
            "<a href=\"{}\" class=\"link\">Read original article</a>\n</div>\n",
            escape(&c.url)
        ));
    }
    html.push_str("</div>\n");

    html.push_str("<div class=\"footer\">\n");
    html.push_str(&format!(
        "<p>This is an automated AI generated newsletter from {}.</p>\n",
        escape(&options.newsletter_name)
    ));
    if let Some(url) = &options.frontend_url {
        html.push_str(&format!(
            "<p>To unsubscribe, please visit <a href=\"{}\">our website</a>.</p>\n",
            escape(url)
        ));
    }
    html.push_str("</div>\n</body>\n</html>\n");

    EmailMessage {
        subject: subject_for(topic),
        text_body: text_body(topic, digest, options),
        html_body: html,
    }
}

fn text_body(topic: &Topic, digest: &Digest, options: &AssemblerOptions) -> String {
    let summary = html2text::from_read(digest.summary.as_bytes(), 80)
        .unwrap_or_else(|_| digest.summary.clone());

    let mut text = format!("Weekly digest: {}\n\n{}\n\nSource Articles\n", topic.display_name, summary.trim());
    for (i, c) in digest.citations.iter().enumerate() {
        text.push_str(&format!("[{}] {}\n    {}\n", i + 1, c.title, c.url));
    }
    if let Some(url) = &options.frontend_url {
        text.push_str(&format!("\nTo unsubscribe, visit {}\n", url));
    }
    text
}

fn source_line(source: Option<&str>, date: Option<&str>) -> Option<String> {
    match (source.filter(|s| !s.is_empty()), date.filter(|d| !d.is_empty())) {
        (Some(s), Some(d)) => Some(format!("{} - {}", s, d)),
        (Some(s), None) => Some(s.to_string()),
        (None, Some(d)) => Some(d.to_string()),
        (None, None) => None,
    }
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

const HTML_HEAD: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<style>
  body { font-family: Arial, sans-serif; line-height: 1.6; color: #333; }
  .summary { margin-bottom: 20px; }
  .articles { margin-top: 20px; }
  .article { margin-bottom: 15px; padding: 10px; border-left: 3px solid #007bff; }
  .title { font-weight: bold; color: #007bff; }
  .source { color: #666; font-size: 0.9em; }
  .link { color: #007bff; text-decoration: none; }
  .footer { margin-top: 20px; padding-top: 20px; border-top: 1px solid #eee; font-size: 0.8em; color: #666; }
</style>
</head>
<body>
"#;
