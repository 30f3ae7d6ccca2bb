//! Data output: trial logging and filename templating.

pub mod trial_log;

pub use trial_log::TrialLogWriter;

use std::collections::HashMap;

use chrono::{DateTime, Local};

use crate::error::AppResult;

/// Expand a filename template: `{placeholder}` substitution first, then
/// strftime directives against `now`.
///
/// The order matters and is part of the template contract — placeholder
/// values are themselves subject to time formatting.
pub fn expand_pattern(
    pattern: &str,
    vars: &HashMap<String, String>,
    now: DateTime<Local>,
) -> AppResult<String> {
    let substituted = strfmt::strfmt(pattern, vars)?;
    Ok(now.format(&substituted).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn vars(animal: &str) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("animal".to_string(), animal.to_string());
        map
    }

    fn noon() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_placeholders_then_strftime() {
        let name = expand_pattern("{animal}_%m-%d-%Y.csv", &vars("rat1"), noon()).unwrap();
        assert_eq!(name, "rat1_03-05-2024.csv");
    }

    #[test]
    fn test_plain_pattern_passes_through() {
        let name = expand_pattern("{animal}.csv", &vars("rat1"), noon()).unwrap();
        assert_eq!(name, "rat1.csv");
    }

    #[test]
    fn test_missing_placeholder_is_pattern_error() {
        let err = expand_pattern("{typo}.csv", &vars("rat1"), noon()).unwrap_err();
        assert!(matches!(err, crate::error::RigError::Pattern(_)));
    }
}
