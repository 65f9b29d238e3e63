use std::str::FromStr;
use std::time::Duration;

use tracing::{info, warn, Level};

/// Level used for "value left at its default" notices; these are noisy so they stay below info.
pub const INFORMATION_LOG_LEVEL: Level = Level::DEBUG;

/// Controls how a configuration value is parsed from an environment string.
pub trait ParsableConfigValue: std::fmt::Debug + Sized {
    fn parse_user_value(value: &str) -> Option<Self>;

    /// Parse the value, returning the default if it is absent or can't be parsed.
    /// Issues a warning when a user-supplied value is rejected.
    fn parse(variable_name: &str, value: Option<String>, default: Self) -> Self {
        match value {
            Some(v) => match Self::parse_user_value(&v) {
                Some(v) => {
                    info!("Config: {variable_name} = {v:?} (user set)");
                    v
                },
                None => {
                    warn!(
                        "Configuration value {v} for {variable_name} cannot be parsed into correct type; reverting to default."
                    );
                    info!("Config: {variable_name} = {default:?} (default due to parse error)");
                    default
                },
            },
            None => {
                tracing::event!(INFORMATION_LOG_LEVEL, "Config: {variable_name} = {default:?} (default)");
                default
            },
        }
    }
}

/// Types whose `FromStr` implementation is already the right parser.
pub trait FromStrParseable: FromStr + std::fmt::Debug {}

impl<T: FromStrParseable> ParsableConfigValue for T {
    fn parse_user_value(value: &str) -> Option<Self> {
        value.trim().parse::<T>().ok()
    }
}

impl FromStrParseable for usize {}
impl FromStrParseable for u32 {}
impl FromStrParseable for u64 {}
impl FromStrParseable for i64 {}
impl FromStrParseable for String {}

/// Special handling for bool:
/// - true: "1","true","yes","y","on"
/// - false: "0","false","no","n","off"
fn parse_bool_value(value: &str) -> Option<bool> {
    let t = value.trim().to_ascii_lowercase();

    match t.as_str() {
        "0" | "false" | "no" | "n" | "off" => Some(false),
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        _ => None,
    }
}

impl ParsableConfigValue for bool {
    fn parse_user_value(value: &str) -> Option<Self> {
        parse_bool_value(value)
    }
}

/// Lets the default be `None` and a user-specified value appear as `Some(value)`.
impl<T: ParsableConfigValue> ParsableConfigValue for Option<T> {
    fn parse_user_value(value: &str) -> Option<Self> {
        T::parse_user_value(value).map(Some)
    }
}

/// Durations accept suffixes such as `ms`, `s`, `m`, `h`; see the duration_str crate for the full list.
impl ParsableConfigValue for Duration {
    fn parse_user_value(value: &str) -> Option<Self> {
        duration_str::parse(value.trim()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bool_parsing() {
        assert_eq!(bool::parse_user_value("Yes"), Some(true));
        assert_eq!(bool::parse_user_value(" off "), Some(false));
        assert_eq!(bool::parse_user_value("maybe"), None);
    }

    #[test]
    fn test_parse_falls_back_on_garbage() {
        let v = u64::parse("SOME_VALUE", Some("not-a-number".to_string()), 7);
        assert_eq!(v, 7);

        let v = u64::parse("SOME_VALUE", Some("12".to_string()), 7);
        assert_eq!(v, 12);

        let v = u64::parse("SOME_VALUE", None, 7);
        assert_eq!(v, 7);
    }

    #[test]
    fn test_duration_and_option() {
        assert_eq!(Duration::parse_user_value("90s"), Some(Duration::from_secs(90)));
        assert_eq!(Option::<u32>::parse_user_value("5"), Some(Some(5)));
        assert_eq!(Option::<u32>::parse_user_value("five"), None);
    }
}
