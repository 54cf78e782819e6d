use tracing_subscriber::{fmt, EnvFilter};
use crate::core::config::SetupError;

/*
Logging bootstrap. The filter string comes from the machine description's
`log` field (or the harness --log override); architectural exceptions and
MMU/translation chatter are logged at debug, so "r_mips=debug" is the
verbosity switch for them.
*/

pub fn init(filter: &str) -> Result<(), SetupError> {
    let env_filter = EnvFilter::try_new(filter)
        .map_err(|e| SetupError::BadLogFilter(format!("\"{}\": {}", filter, e)))?;
    fmt()
        .with_env_filter(env_filter)
        .try_init()
        .map_err(|e| SetupError::BadLogFilter(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_a_malformed_filter() {
        // fails in filter parsing, before any global subscriber is touched
        assert!(matches!(
            init("cpu=debug=extra"),
            Err(SetupError::BadLogFilter(_))
        ));
    }
}
