//! Build version metadata.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::timeutil;

/// Build metadata exposed at /api/version. `build_date` is the canonical
/// RFC3339 UTC value stamped by CI; the Beijing rendering is a redundant
/// companion for operators.
#[derive(Debug, Clone, Serialize)]
pub struct VersionInfo {
    pub version: &'static str,
    pub build_date: &'static str,
    pub build_date_beijing: String,
}

pub fn version_info() -> VersionInfo {
    let build_date = option_env!("NODEWATCH_BUILD_DATE").unwrap_or("dev");
    VersionInfo {
        version: env!("CARGO_PKG_VERSION"),
        build_date,
        build_date_beijing: formatted_build_date(build_date),
    }
}

fn formatted_build_date(build_date: &str) -> String {
    match DateTime::parse_from_rfc3339(build_date) {
        Ok(t) => timeutil::format_beijing_time(t.with_timezone(&Utc)),
        Err(_) => build_date.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_formatted_build_date() {
        assert_eq!(formatted_build_date("dev"), "dev");
        assert_eq!(formatted_build_date("2025-11-25T10:00:00Z"), "2025-11-25 18:00:00");
    }

    #[test]
    fn test_version_info_has_package_version() {
        let info = version_info();
        assert_eq!(info.version, env!("CARGO_PKG_VERSION"));
    }
}
