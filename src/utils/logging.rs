/// Tracing subscriber setup shared by the binaries
use tracing_subscriber::EnvFilter;

/// Initialise the global subscriber.
///
/// `RUST_LOG` overrides `default_level`; `LOG_FORMAT=json` switches to JSON lines.
pub fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("rc100={0},{0}", default_level)));

    let json = std::env::var("LOG_FORMAT").map(|v| v.eq_ignore_ascii_case("json")).unwrap_or(false);

    let result = if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init()
    };

    if let Err(e) = result {
        eprintln!("Logging already initialised: {}", e);
    }
}
