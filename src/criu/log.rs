use std::io::Write;
use std::sync::OnceLock;
use std::time::Instant;

// Restore start time for dmesg-style timestamps
static START_TIME: OnceLock<Instant> = OnceLock::new();

/// Install the logger.
///
/// Every restored process writes to the same stderr after fork, so each
/// line carries the OS pid next to the timestamp. `RUST_LOG` overrides
/// the level picked from `verbose`.
pub fn log_init(verbose: bool) {
    START_TIME.get_or_init(Instant::now);

    let log_level = if verbose { "debug" } else { "info" };
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format(|buf, record| {
            let elapsed = START_TIME.get().map(|t| t.elapsed()).unwrap_or_default();

            // [  123.456789] (pid) LEVEL message
            writeln!(
                buf,
                "[{:5}.{:06}] ({}) {} {}",
                elapsed.as_secs(),
                elapsed.subsec_micros(),
                std::process::id(),
                record.level(),
                record.args()
            )
        })
        .try_init();
}
