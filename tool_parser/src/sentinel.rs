//! Configurable sentinel tag pair delimiting tool invocations in model output.

/// Environment variable holding the sentinel tag base name.
pub const SENTINEL_ENV_VAR: &str = "ZIYA_TOOL_SENTINEL";

/// Default sentinel tag base name.
pub const DEFAULT_SENTINEL: &str = "TOOL_SENTINEL";

/// The open/close tag pair that delimits a tool-call block.
///
/// The base name is configurable via `ZIYA_TOOL_SENTINEL`; the effective
/// tags are `<BASE>` and `</BASE>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentinel {
    base: String,
    open: String,
    close: String,
}

impl Sentinel {
    pub fn new(base: impl Into<String>) -> Self {
        let base = base.into();
        let open = format!("<{}>", base);
        let close = format!("</{}>", base);
        Self { base, open, close }
    }

    /// Read the sentinel base name from the environment, falling back to
    /// `TOOL_SENTINEL`.
    pub fn from_env() -> Self {
        let base = std::env::var(SENTINEL_ENV_VAR)
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SENTINEL.to_string());
        Self::new(base)
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn open(&self) -> &str {
        &self.open
    }

    pub fn close(&self) -> &str {
        &self.close
    }
}

impl Default for Sentinel {
    fn default() -> Self {
        Self::new(DEFAULT_SENTINEL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_sentinel_tags() {
        let s = Sentinel::default();
        assert_eq!(s.open(), "<TOOL_SENTINEL>");
        assert_eq!(s.close(), "</TOOL_SENTINEL>");
    }

    #[test]
    #[serial]
    fn test_from_env_override() {
        std::env::set_var(SENTINEL_ENV_VAR, "TOOL_CALL");
        let s = Sentinel::from_env();
        assert_eq!(s.open(), "<TOOL_CALL>");
        assert_eq!(s.close(), "</TOOL_CALL>");
        std::env::remove_var(SENTINEL_ENV_VAR);
    }

    #[test]
    #[serial]
    fn test_from_env_empty_falls_back() {
        std::env::set_var(SENTINEL_ENV_VAR, "  ");
        let s = Sentinel::from_env();
        assert_eq!(s.base(), DEFAULT_SENTINEL);
        std::env::remove_var(SENTINEL_ENV_VAR);
    }
}
