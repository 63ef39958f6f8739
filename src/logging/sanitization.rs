use regex::Regex;
use std::sync::OnceLock;

/// Patterns that must never reach a log line verbatim
struct SanitizationPatterns {
    email: Regex,
    bearer_token: Regex,
    token_param: Regex,
    api_key: Regex,
    password_field: Regex,
    ipv4_address: Regex,
    user_path: Regex,
}

static PATTERNS: OnceLock<SanitizationPatterns> = OnceLock::new();

fn patterns() -> &'static SanitizationPatterns {
    PATTERNS.get_or_init(|| SanitizationPatterns {
        // Principals are often e-mail addresses; keep the domain
        email: Regex::new(r"\b([a-zA-Z0-9._%+-]+)@([a-zA-Z0-9.-]+\.[a-zA-Z]{2,})\b").unwrap(),

        bearer_token: Regex::new(r"Bearer\s+[a-zA-Z0-9\-_\.=]+").unwrap(),

        // Credentials passed as query parameters to the authority
        token_param: Regex::new(r"(?i)\b(access_token|token|secret)=[^&\s]+").unwrap(),

        api_key: Regex::new(r"\b(sk_|pk_|api_|key_)[a-zA-Z0-9_]{15,}\b").unwrap(),

        password_field: Regex::new(r"(?i)(password|passwd|pwd)\s*[:=]\s*\S+").unwrap(),

        // Show the subnet only
        ipv4_address: Regex::new(r"\b(\d{1,3})\.(\d{1,3})\.(\d{1,3})\.(\d{1,3})\b").unwrap(),

        // Local backends may live under home directories
        user_path: Regex::new(r"/(?:home|Users)/([^/\s]+)").unwrap(),
    })
}

/// Strip credentials and personal data from a message before logging it
///
/// - e-mail addresses become `***@domain`
/// - bearer tokens, token query parameters and API keys become `[REDACTED]`
/// - password fields become `field=[REDACTED]`
/// - IPv4 addresses keep their first two octets
/// - home directories become `/[USER]`
pub fn sanitize_log_message(message: &str) -> String {
    let patterns = patterns();

    let result = patterns.email.replace_all(message, "***@$2");
    let result = patterns.bearer_token.replace_all(&result, "Bearer [REDACTED]");
    let result = patterns.token_param.replace_all(&result, "$1=[REDACTED]");
    let result = patterns.api_key.replace_all(&result, "[REDACTED]");
    let result = patterns.password_field.replace_all(&result, "$1=[REDACTED]");
    let result = patterns.ipv4_address.replace_all(&result, "$1.$2.x.x");
    let result = patterns.user_path.replace_all(&result, "/[USER]");

    result.into_owned()
}
