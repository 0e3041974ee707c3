use log::LevelFilter;

use crate::config::EngineConfig;

/// Sets up logging for the engine using `fern`, following the
/// teacher's dispatch-chain construction. Dropped from the teacher:
/// the GitHub release-check and `sys-info` system dump, which are
/// particular to an end-user desktop application, not a driver
/// library; the log path and level come from `EngineConfig` instead of
/// a hardcoded platform-specific `Documents/tba` convention.
pub fn setup_logging(config: &EngineConfig) {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S%.3f]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(config.log_level)
        .chain(std::io::stdout());

    if let Some(log_path) = &config.log_file_path {
        match fern::log_file(log_path) {
            Ok(file) => dispatch = dispatch.chain(file),
            Err(e) => {
                eprintln!("failed to open log file {:?}: {e}", log_path);
            }
        }
    }

    if let Err(e) = dispatch.apply() {
        // `apply()` fails only if a global logger was already set; this
        // is expected if the embedding application already installed
        // its own and is not itself an error worth propagating.
        eprintln!("logger already initialized: {e}");
    }

    log::info!("-== keycard driver engine starting ==-");
}

pub fn level_from_str(s: &str) -> LevelFilter {
    s.parse().unwrap_or(LevelFilter::Info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use std::env;

    #[test]
    fn level_from_str_falls_back_to_info() {
        assert_eq!(level_from_str("garbage"), LevelFilter::Info);
        assert_eq!(level_from_str("debug"), LevelFilter::Debug);
    }

    #[test]
    fn setup_logging_does_not_panic_with_a_writable_log_path() {
        let mut log_path = env::temp_dir();
        log_path.push(format!("keycard-driver-test-{}.log", std::process::id()));

        let config = EngineConfig {
            log_file_path: Some(log_path.clone()),
            ..EngineConfig::default()
        };

        setup_logging(&config);

        let _ = std::fs::remove_file(&log_path);
    }
}
