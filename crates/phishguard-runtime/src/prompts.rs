//! Prompts for phishing explanations.
//!
//! Each request is a fixed system prompt plus one user message carrying the
//! subject and its analysis result as pretty-printed JSON. The user message
//! is capped at a character ceiling so a huge header blob cannot blow up
//! provider latency.

use serde_json::Value as JsonValue;
use std::borrow::Cow;

use crate::providers::ChatMessage;

/// Default ceiling for the user message, in characters.
pub const MAX_PROMPT_CHARS: usize = 3000;

/// Appended to a prompt that was cut at the ceiling.
pub const TRUNCATION_NOTE: &str = "\n\n[Note: Input was truncated due to length.]";

/// System prompt for URL explanations.
pub const URL_EXPLANATION_PROMPT: &str = r#"
You are a security analyst explaining a URL risk assessment to a non-technical user.

You will receive a URL and the results of an automated analysis (risk score,
triggered checks, domain information). Using only that data:

1. State plainly whether the URL looks safe, suspicious or dangerous
2. Explain the most important warning signs in everyday language
3. Point out lookalike domains, misleading subdomains or unusual paths if present
4. Tell the user what to do next (avoid, verify through an official channel, or proceed)

Keep the answer under 200 words. Do not invent findings that are not in the data.
"#;

/// System prompt for email header analysis.
pub const EMAIL_ANALYSIS_PROMPT: &str = r#"
You are an email security analyst deciding whether a message is phishing or legitimate.

You will receive the findings of an automated email header analysis and the raw
headers. Provide:

1. An overall verdict: likely phishing, suspicious, or legitimate
2. The key security indicators in the headers (SPF, DKIM, DMARC, routing, sender alignment)
3. What those indicators mean for the recipient
4. Concrete advice on how to handle the message

Be concise but thorough. Focus on anomalies that strongly indicate either
legitimacy or a phishing attempt.
"#;

/// Cut `prompt` to at most `max_chars` characters, appending
/// [`TRUNCATION_NOTE`] when anything was removed.
pub fn truncate_prompt(prompt: &str, max_chars: usize) -> Cow<'_, str> {
    match prompt.char_indices().nth(max_chars) {
        None => Cow::Borrowed(prompt),
        Some((cut, _)) => {
            tracing::debug!(
                original_chars = prompt.chars().count(),
                max_chars,
                "Prompt exceeds ceiling, truncating"
            );
            Cow::Owned(format!("{}{}", &prompt[..cut], TRUNCATION_NOTE))
        }
    }
}

fn render(value: &JsonValue) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// Messages asking for an explanation of a URL analysis.
pub fn url_messages(url: &str, analysis: &JsonValue, max_chars: usize) -> Vec<ChatMessage> {
    let body = format!("URL: {}\n\nURL Analysis Results:\n{}", url, render(analysis));
    vec![
        ChatMessage::system(URL_EXPLANATION_PROMPT.trim()),
        ChatMessage::user(truncate_prompt(&body, max_chars)),
    ]
}

/// Messages asking for an interpretation of an email header analysis.
pub fn email_messages(headers: &str, analysis: &JsonValue, max_chars: usize) -> Vec<ChatMessage> {
    let body = format!(
        "Email Header Analysis Findings:\n{}\n\nRaw Headers:\n{}",
        render(analysis),
        headers.trim()
    );
    vec![
        ChatMessage::system(EMAIL_ANALYSIS_PROMPT.trim()),
        ChatMessage::user(truncate_prompt(&body, max_chars)),
    ]
}
