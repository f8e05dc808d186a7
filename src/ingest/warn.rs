fn sanitize_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut prev_sep = false;
    for ch in value.chars() {
        if ch.is_ascii_whitespace() || ch == '=' {
            if !out.is_empty() && !prev_sep {
                out.push('_');
                prev_sep = true;
            }
        } else if ch.is_ascii_graphic() {
            out.push(ch);
            prev_sep = false;
        }
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "na".to_string()
    } else {
        trimmed.to_string()
    }
}

/// A machine-greppable warning about a single row or resource.
#[derive(Debug, Clone, Copy, Default)]
pub struct WarnEvent<'a> {
    pub code: &'a str,
    pub step: &'a str,
    pub action: &'a str,
    pub site: &'a str,
    pub file: &'a str,
    pub retry: &'a str,
    pub reason: &'a str,
    pub err: &'a str,
}

pub fn format_event(event: &WarnEvent<'_>) -> String {
    format!(
        "INGEST_WARN code={} step={} action={} site={} file={} retry={} reason={} err={}",
        sanitize_value(event.code),
        sanitize_value(event.step),
        sanitize_value(event.action),
        sanitize_value(event.site),
        sanitize_value(event.file),
        sanitize_value(event.retry),
        sanitize_value(event.reason),
        sanitize_value(event.err),
    )
}

pub fn emit(event: WarnEvent<'_>) {
    tracing::warn!("{}", format_event(&event));
}
