use std::env;
use std::ffi::OsStr;

/// Guard that temporarily sets an environment variable and restores the previous value on drop.
///
/// Environment mutation is process-wide, so tests using this should be serialized.
///
/// # Examples
///
/// ```no_run
/// use utils::EnvVarGuard;
///
/// let _guard = EnvVarGuard::set("CACHE_WRITERS_ALLOW_TRUNCATED_ENTRIES", "false");
/// // The previous value (or absence) is restored when `_guard` is dropped.
/// ```
pub struct EnvVarGuard {
    key: &'static str,
    prev: Option<String>,
}

impl EnvVarGuard {
    pub fn set(key: &'static str, value: impl AsRef<OsStr>) -> Self {
        let prev = env::var(key).ok();
        env::set_var(key, value);
        Self { key, prev }
    }
}

impl Drop for EnvVarGuard {
    fn drop(&mut self) {
        match &self.prev {
            Some(v) => env::set_var(self.key, v),
            None => env::remove_var(self.key),
        }
    }
}
