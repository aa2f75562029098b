use milesguard_common::RelevantMessage;

/// Longest message excerpt included in a notification, in characters.
pub const EXCERPT_MAX_CHARS: usize = 1000;

pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// First `max_chars` characters of `text`.
#[must_use]
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

/// Keywords as hashtags; inner whitespace becomes `_`.
pub fn hashtags(keywords: &[String]) -> String {
    keywords
        .iter()
        .map(|k| format!("#{}", k.split_whitespace().collect::<Vec<_>>().join("_")))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Render a relevant message as Telegram HTML.
pub fn format_notification(relevant: &RelevantMessage) -> String {
    let message = &relevant.message;
    let mut out = String::from("🎯 <b>Offer detected</b>\n\n");
    out.push_str(&format!(
        "📱 <b>Group:</b> {}\n",
        escape_html(message.conversation_name())
    ));
    out.push_str(&format!(
        "👤 <b>From:</b> {}\n",
        escape_html(&message.sender_name)
    ));
    out.push_str(&format!(
        "🕐 <b>Time:</b> {}\n",
        message.received_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    if !relevant.matched_keywords.is_empty() {
        out.push_str(&format!(
            "🔍 <b>Keywords:</b> {}\n",
            escape_html(&hashtags(&relevant.matched_keywords))
        ));
    }

    let total = message.text.chars().count();
    let excerpt = truncate_chars(&message.text, EXCERPT_MAX_CHARS);
    out.push_str("\n💬 <b>Message:</b>\n<pre>");
    out.push_str(&escape_html(excerpt));
    if total > EXCERPT_MAX_CHARS {
        out.push_str("\n...");
    }
    out.push_str("</pre>");
    if total > EXCERPT_MAX_CHARS {
        out.push_str(&format!(
            "\n📏 <i>Message truncated ({total} characters total)</i>"
        ));
    }
    out
}
