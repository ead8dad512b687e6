//! Shared severity presentation and event text helpers.

use ve_protocol::{Event, Severity};

/// Severity icon used in chat-style sinks.
pub fn severity_icon(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical => "\u{1f525}", // fire
        Severity::Error => "\u{274c}",     // cross mark
        Severity::Warning => "\u{26a0}\u{fe0f}", // warning sign
        Severity::Info => "\u{2139}\u{fe0f}",    // information
        Severity::Debug => "\u{1f41b}",    // bug
    }
}

/// Attachment/markup colour per severity.
pub fn severity_color(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical | Severity::Error => "#d32f2f",
        Severity::Warning => "#ffa000",
        Severity::Info => "#1976d2",
        Severity::Debug => "#616161",
    }
}

/// The non-null correlation handles as (label, value) pairs, in field order.
pub fn correlation_fields(event: &Event) -> Vec<(&'static str, &str)> {
    let mut fields = Vec::new();
    if let Some(id) = event.model_id.as_deref() {
        fields.push(("model", id));
    }
    if let Some(id) = event.provider_id.as_deref() {
        fields.push(("provider", id));
    }
    if let Some(id) = event.verification_id.as_deref() {
        fields.push(("verification", id));
    }
    if let Some(id) = event.issue_id.as_deref() {
        fields.push(("issue", id));
    }
    if let Some(id) = event.client_id.as_deref() {
        fields.push(("client", id));
    }
    if let Some(id) = event.user_id.as_deref() {
        fields.push(("user", id));
    }
    fields
}

/// Plain-text rendering shared by the e-mail and WhatsApp sinks.
pub fn plain_body(event: &Event) -> String {
    let mut body = format!(
        "{}\n\n{}\n\nSeverity: {}\nSource: {}\nTime: {}",
        event.title,
        event.message,
        event.severity,
        event.source,
        event.timestamp.to_rfc3339(),
    );
    for (label, value) in correlation_fields(event) {
        body.push_str(&format!("\n{label}: {value}"));
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use ve_protocol::EventKind;

    #[test]
    fn correlation_fields_include_only_present_handles() {
        let event = Event::new(EventKind::IssueDetected, Severity::Error, "t", "m")
            .with_model("m1")
            .with_issue("i9");
        let fields = correlation_fields(&event);
        assert_eq!(fields, vec![("model", "m1"), ("issue", "i9")]);
    }

    #[test]
    fn plain_body_contains_all_fields() {
        let event = Event::new(EventKind::SecurityAlert, Severity::Critical, "Alert", "bad")
            .with_user("u1");
        let body = plain_body(&event);
        assert!(body.contains("Alert"));
        assert!(body.contains("Severity: critical"));
        assert!(body.contains("user: u1"));
    }

    #[test]
    fn every_severity_has_presentation() {
        for severity in [
            Severity::Debug,
            Severity::Info,
            Severity::Warning,
            Severity::Error,
            Severity::Critical,
        ] {
            assert!(!severity_icon(severity).is_empty());
            assert!(severity_color(severity).starts_with('#'));
        }
    }
}
