use std::time::Duration;

utils::config_group!(WritersConfig, "CACHE_WRITERS", {
    /// Minimum gap between the `Date` and `Last-Modified` headers for `Last-Modified` to
    /// count as a strong validator.
    ///
    /// Use the environment variable `CACHE_WRITERS_STRONG_VALIDATOR_MIN_AGE` to set this value.
    ref strong_validator_min_age: Duration = Duration::from_secs(60);

    /// Keep hop-by-hop headers in the metadata written for truncated entries.
    ///
    /// Use the environment variable `CACHE_WRITERS_PERSIST_TRANSIENT_HEADERS` to set this value.
    ref persist_transient_headers: bool = false;

    /// Whether incomplete bodies may be kept as resumable truncated entries at all.
    ///
    /// Use the environment variable `CACHE_WRITERS_ALLOW_TRUNCATED_ENTRIES` to set this value.
    ref allow_truncated_entries: bool = true;
});
