//! Configuration parameters struct parsing helper.

/// Composes a configuration struct from its default values, then overwrites
/// given fields by parsing from given TOML string if it's not `None`. Returns
/// an `Ok(config)` on success, and `Err(EmberError)` on parser failure.
///
/// Example:
/// ```no_run
/// let config = parsed_config!(config_str => ConfigMaster; seg_capacity,
///                                                         grd_timeout_ms)?;
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;

        // closure helper for easier error returning
        let compose_config = || -> Result<$config_type, EmberError> {
            let mut config: $config_type = Default::default();
            if config_str.is_none() {
                return Ok(config);
            }

            let mut table = config_str.unwrap().parse::<toml::Table>()?;

            // traverse through all given field names
            $({
                // if field name found in table (and removed)
                if let Some(v) = table.remove(stringify!($field)) {
                    config.$field = v.try_into()?;
                }
            })+

            // if table is not empty at this time, some parsed keys are not
            // expected hence invalid
            if !table.is_empty() {
                return Err(EmberError(format!(
                    "invalid field name '{}' in config",
                    table.keys().next().unwrap(),
                )));
            }

            Ok(config)
        };

        compose_config()
    }};
}

#[cfg(test)]
mod config_tests {
    use crate::utils::EmberError;

    #[derive(Debug, PartialEq)]
    struct TestConfig {
        slots: u16,
        path: String,
        ratio: f64,
    }

    impl Default for TestConfig {
        fn default() -> Self {
            TestConfig {
                slots: 4,
                path: "/tmp/ember".into(),
                ratio: 0.75,
            }
        }
    }

    #[test]
    fn parse_from_none() -> Result<(), EmberError> {
        let config = parsed_config!(None => TestConfig; slots, path, ratio)?;
        let ref_config: TestConfig = Default::default();
        assert_eq!(config, ref_config);
        Ok(())
    }

    #[test]
    fn parse_from_partial() -> Result<(), EmberError> {
        let config_str = Some("path = '/mnt/log'");
        let config = parsed_config!(config_str => TestConfig; path, ratio)?;
        let ref_config = TestConfig {
            slots: 4,
            path: "/mnt/log".into(),
            ratio: 0.75,
        };
        assert_eq!(config, ref_config);
        Ok(())
    }

    #[test]
    fn parse_invalid_field() {
        let config_str = Some("stale_name = 999");
        assert!(parsed_config!(config_str => TestConfig; slots).is_err());
    }
}
