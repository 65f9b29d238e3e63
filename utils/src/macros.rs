/// Macro to create a configuration value group struct.
///
/// Usage:
/// ```rust
/// use utils::config_group;
///
/// config_group!(ExampleConfig, "EXAMPLE", {
///     ref test_int: usize = 42;
///     ref test_string: String = "default".to_string();
/// });
///
/// let config = ExampleConfig::default();
/// assert_eq!(config.test_int, 42);
/// ```
///
/// This creates a struct with the specified fields, a `Default` impl holding the declared
/// defaults, and `apply_env_overrides()` which reads `<PREFIX>_<FIELD_NAME_UPPERCASE>`.
#[macro_export]
macro_rules! config_group {
    ($group:ident, $prefix:literal, {
        $(
            $(#[$meta:meta])*
            ref $name:ident : $type:ty = $value:expr;
        )+
    }) => {
        #[derive(Debug, Clone, PartialEq)]
        pub struct $group {
            $(
                $(#[$meta])*
                pub $name: $type,
            )+
        }

        impl Default for $group {
            /// Default values only (no environment variable overrides).
            fn default() -> Self {
                Self {
                    $(
                        $name: {
                            let v: $type = $value;
                            v
                        },
                    )+
                }
            }
        }

        impl $group {
            /// Defaults with environment variable overrides applied.
            pub fn from_env() -> Self {
                let mut config = Self::default();
                config.apply_env_overrides();
                config
            }

            /// Apply environment variable overrides to this configuration group.
            pub fn apply_env_overrides(&mut self) {
                #[allow(unused_imports)]
                use $crate::ParsableConfigValue;

                $(
                    let env_var_name = format!("{}_{}", $prefix, stringify!($name).to_uppercase());
                    let maybe_env_value = std::env::var(&env_var_name).ok();
                    let default_value: $type = $value;
                    self.$name = <$type>::parse(&env_var_name, maybe_env_value, default_value);
                )+
            }

            /// The environment variable names this group reads, in declaration order.
            pub fn env_var_names() -> Vec<String> {
                vec![$(format!("{}_{}", $prefix, stringify!($name).to_uppercase())),+]
            }
        }
    };
}
