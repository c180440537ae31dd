use crate::error::AppError;

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 100;

/// Tunables for the orchestrator's query layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Page size used when a query does not ask for one.
    pub default_page_size: usize,
    /// Upper bound applied to every requested page size.
    pub max_page_size: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_page_size: DEFAULT_PAGE_SIZE,
            max_page_size: MAX_PAGE_SIZE,
        }
    }
}

impl OrchestratorConfig {
    /// Read configuration from environment variables.
    ///
    /// - `KESTREL_DEFAULT_PAGE_SIZE` (optional, defaults to 20)
    /// - `KESTREL_MAX_PAGE_SIZE` (optional, defaults to 100)
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let max_page_size = parse_size(&lookup, "KESTREL_MAX_PAGE_SIZE", MAX_PAGE_SIZE)?;
        let default_page_size =
            parse_size(&lookup, "KESTREL_DEFAULT_PAGE_SIZE", DEFAULT_PAGE_SIZE.min(max_page_size))?;

        if default_page_size > max_page_size {
            return Err(AppError::ConfigError(format!(
                "KESTREL_DEFAULT_PAGE_SIZE ({default_page_size}) exceeds KESTREL_MAX_PAGE_SIZE ({max_page_size})"
            )));
        }

        Ok(Self {
            default_page_size,
            max_page_size,
        })
    }
}

fn parse_size(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: usize,
) -> Result<usize, AppError> {
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    let parsed: usize = raw.trim().parse().map_err(|_| {
        AppError::ConfigError(format!("Invalid {key} '{raw}': must be a positive integer"))
    })?;
    if parsed == 0 {
        return Err(AppError::ConfigError(format!("{key} must be at least 1")));
    }
    Ok(parsed)
}
