use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io::IsTerminal;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn, Level, Metadata, Subscriber};
use tracing_core::callsite;
use tracing_subscriber::filter::{FilterFn, LevelFilter};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::{Context, Filter, Layer, SubscriberExt};

/// Drops repeats of a WARN or ERROR event from the same callsite within
/// `interval`, then reports how many were dropped once the interval passes.
///
/// A stuck Bigtable backend can fail every batch, and each failure logs.
struct SpewFilter {
    callsites: Mutex<HashMap<callsite::Identifier, Window>>,
    interval: Duration,
}

struct Window {
    started: Instant,
    suppressed: usize,
}

impl SpewFilter {
    fn new(interval: Duration) -> Self {
        Self {
            callsites: Mutex::new(HashMap::new()),
            interval,
        }
    }
}

impl<S: Subscriber> Filter<S> for SpewFilter {
    fn enabled(&self, meta: &Metadata<'_>, _cx: &Context<'_, S>) -> bool {
        // INFO, DEBUG and TRACE are more verbose than WARN and pass through.
        if *meta.level() > Level::WARN || meta.fields().field("suppressed").is_some() {
            return true;
        }
        let now = Instant::now();
        let mut callsites = self.callsites.lock().unwrap();
        match callsites.entry(meta.callsite()) {
            Entry::Vacant(entry) => {
                entry.insert(Window {
                    started: now,
                    suppressed: 0,
                });
                true
            }
            Entry::Occupied(mut entry) => {
                let window = entry.get_mut();
                if now - window.started < self.interval {
                    window.suppressed += 1;
                    return false;
                }
                let suppressed = std::mem::replace(&mut window.suppressed, 0);
                window.started = now;
                drop(callsites);
                if suppressed > 0 {
                    warn!(
                        suppressed,
                        "suppressed duplicate log entries from {}",
                        meta.name()
                    );
                }
                true
            }
        }
    }
}

// Quiet down the gRPC stack.
fn should_log(module_path: Option<&str>) -> bool {
    let Some(module) = module_path else {
        return true;
    };
    let krate = module.split_once("::").map_or(module, |(krate, _)| krate);
    !matches!(
        krate,
        "h2" | "hyper" | "mio" | "rustls" | "tokio_util" | "tonic" | "tower" | "want"
    )
}

pub fn configure(service_name: &str) {
    configure_with_options(Options {
        process_name: service_name.to_owned(),
        ..Options::default()
    })
}

#[derive(Debug)]
pub struct Options {
    pub process_name: String,
    pub default_log_level: Level,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            process_name: String::new(),
            default_log_level: Level::INFO,
        }
    }
}

/// Installs the global `tracing` subscriber.
///
/// Output is human-readable when stdout is a terminal and JSON otherwise.
/// The `LOGLEVEL` environment variable overrides
/// [`Options::default_log_level`].
pub fn configure_with_options(options: Options) {
    let (log_level, bad_level) = match std::env::var("LOGLEVEL") {
        Ok(s) => match Level::from_str(&s) {
            Ok(level) => (level, None),
            Err(_) => (options.default_log_level, Some(s)),
        },
        Err(_) => (options.default_log_level, None),
    };

    let terminal = tracing_subscriber::fmt::layer()
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::ACTIVE)
        .with_target(false);

    let terminal = if std::io::stdout().is_terminal() {
        terminal.boxed()
    } else {
        terminal.json().boxed()
    };

    let subscriber = tracing_subscriber::registry()
        .with(
            terminal
                .with_filter(SpewFilter::new(Duration::from_millis(1000)))
                .with_filter(LevelFilter::from_level(log_level)),
        )
        .with(FilterFn::new(|metadata| should_log(metadata.module_path())));

    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        // This goes to stderr because there's no logger to send it to.
        eprintln!("failed to install logger: {err}");
        return;
    }

    if let Some(bad_level) = bad_level {
        warn!(LOGLEVEL = %bad_level, "couldn't parse LOGLEVEL, using default");
    }
    info!(
        process = %options.process_name,
        max_level = %log_level,
        "initialized logging to terminal. you can set verbosity with env var LOGLEVEL."
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_log() {
        assert!(!should_log(Some("tonic")));
        assert!(!should_log(Some("h2::codec")));
        assert!(should_log(Some("bigtable")));
        assert!(should_log(Some("bigtable::batcher")));
        assert!(should_log(None));
    }
}
