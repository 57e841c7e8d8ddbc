//! Secret redaction for log output.
//!
//! Commands are logged after redaction. Stored claims keep the exact text.

use std::borrow::Cow;
use std::sync::OnceLock;

use regex::Regex;

const REDACTED: &str = "[REDACTED]";

fn patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // --password=x, --token x, --api-key=x, --apikey x
            r"(?i)(--(?:password|passwd|token|api-?key|secret)(?:=|\s+))(\S+)",
            // FOO_PASSWORD=x, GITHUB_TOKEN=x, AWS_SECRET_ACCESS_KEY=x
            r"(\b[A-Z_]*(?:PASSWORD|TOKEN|SECRET|API_KEY|SECRET_ACCESS_KEY)=)(\S+)",
            // Authorization: Bearer x
            r"(?i)(bearer\s+)([A-Za-z0-9._~+/=-]+)",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// Replace secret values in a command with `[REDACTED]`
pub fn redact_secrets(command: &str) -> Cow<'_, str> {
    let mut out = Cow::Borrowed(command);
    for pattern in patterns() {
        if pattern.is_match(&out) {
            let replaced = pattern
                .replace_all(&out, |caps: &regex::Captures| format!("{}{}", &caps[1], REDACTED))
                .into_owned();
            out = Cow::Owned(replaced);
        }
    }
    out
}
