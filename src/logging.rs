//! 安全的日志记录工具
//!
//! 提供敏感信息脱敏功能，确保日志和错误信息中不会泄露 API keys。

use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

/// Key-shaped substrings inside free text (provider error bodies, URLs)
static KEY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(sk-(?:ant-)?[A-Za-z0-9_\-]{8,}|AIza[0-9A-Za-z_\-]{20,})").expect("valid regex")
});

/// 脱敏后的 API key 表示
///
/// 只显示前 8 个字符，其余替换为 `***`
#[derive(Clone, Debug)]
pub struct SensitiveApiKey<'a> {
    inner: &'a str,
}

impl<'a> SensitiveApiKey<'a> {
    /// # 示例
    /// ```
    /// use metered_gateway::logging::SensitiveApiKey;
    ///
    /// let sanitized = SensitiveApiKey::new("sk-ant-api123-abcdef123456");
    /// assert_eq!(format!("{}", sanitized), "sk-ant-a***");
    /// ```
    pub fn new(key: &'a str) -> Self {
        Self { inner: key }
    }
}

impl<'a> fmt::Display for SensitiveApiKey<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let visible_len = 8.min(self.inner.len());
        if self.inner.len() <= visible_len || !self.inner.is_char_boundary(visible_len) {
            // key 太短，全部脱敏
            write!(f, "***")
        } else {
            write!(f, "{}***", &self.inner[..visible_len])
        }
    }
}

/// 检查字符串是否可能是 API key
pub fn is_sensitive_key(value: &str) -> bool {
    const SENSITIVE_PREFIXES: [&str; 7] = [
        "sk-ant-",
        "sk-",
        "pk-",
        "AIza",
        "sess-",
        "Bearer sk-",
        "Bearer pk-",
    ];

    SENSITIVE_PREFIXES
        .iter()
        .any(|prefix| value.starts_with(prefix))
}

/// 对字符串进行脱敏处理（如果是敏感值）
///
/// ```
/// use metered_gateway::logging::sanitize_log_value;
///
/// assert_eq!(sanitize_log_value("sk-ant-api123-key"), "sk-ant-a***");
/// assert_eq!(sanitize_log_value("my-app-name"), "my-app-name");
/// ```
pub fn sanitize_log_value(value: &str) -> String {
    if is_sensitive_key(value) {
        SensitiveApiKey::new(value).to_string()
    } else {
        value.to_string()
    }
}

/// Remove a known credential and anything key-shaped from free text
pub fn redact_secret(text: &str, secret: &str) -> String {
    let text = if secret.is_empty() {
        text.to_string()
    } else {
        text.replace(secret, "***")
    };
    KEY_PATTERN.replace_all(&text, "***").into_owned()
}

/// Truncate text for log fields, respecting char boundaries
pub fn truncate_for_log(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
