use dogstatsd::DogstatsdResult;
use std::borrow::Cow;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Returns a stringified metrics [`Tag`] with a key and corresponding value.
///
/// Examples:
///
/// ```ignore
/// use observability::metrics_tag as tag;
/// tag!(?debugged);
/// tag!(displayed);
/// tag!(reason: "too_{}", "large");
/// tag!("result": "ok");
/// ```
#[macro_export]
macro_rules! metrics_tag {
    ($k:ident) => {{
        $crate::metrics::Tag::from(format!("{}:{}", stringify!($k), $k))
    }};
    (?$k:ident) => {{
        $crate::metrics::Tag::from(format!("{}:{:?}", stringify!($k), $k))
    }};
    ($k:ident : $($arg:tt)*) => {{
        $crate::metrics::Tag::from(format!("{}:{}", stringify!($k), format_args!($($arg)*)))
    }};
    ($k:tt : $($arg:tt)*) => {{
        $crate::metrics::Tag::from(format!("{}:{}", $k, format_args!($($arg)*)))
    }};
}

/// A `key:value` pair attached to a metric. The contents are normalized to
/// the character set Datadog accepts when the tag is built.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Tag(String);

impl From<String> for Tag {
    fn from(s: String) -> Self {
        Self(sanitize_tag(&s))
    }
}

impl AsRef<str> for Tag {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Helps with specifying generic types when you have no tags to pass.
pub const NO_TAGS: &[Tag] = &[];

/// Sends metrics to a local Datadog agent over the statsd protocol.
///
/// Compared to using [`dogstatsd::Client`] directly:
/// - [`Client::NONE`] records nothing, which keeps tests quiet.
/// - Clones share one socket.
/// - Send failures are logged, never returned.
/// - Durations are recorded as nanosecond distributions.
#[derive(Clone, Debug)]
pub struct Client {
    inner: Option<Arc<dogstatsd::Client>>,
}

impl Client {
    /// Does not record metrics.
    pub const NONE: Self = Self { inner: None };

    pub fn new(service_name: &str) -> Self {
        Self::new_with_tags(service_name, [])
    }

    pub fn new_with_tags<I>(service_name: &str, tags: I) -> Self
    where
        I: IntoIterator<Item = Tag>,
    {
        let mut options = dogstatsd::OptionsBuilder::new();
        options.default_tag(metrics_tag!(service: "{service_name}").0);
        for tag in tags {
            options.default_tag(tag.0);
        }
        Self::with_options(options.build())
    }

    /// Like [`Self::new`], but sends wherever `options` say, with only the
    /// default tags they carry.
    pub fn with_options(options: dogstatsd::Options) -> Self {
        match dogstatsd::Client::new(options) {
            Ok(client) => Self {
                inner: Some(Arc::new(client)),
            },
            Err(err) => {
                warn!(?err, "couldn't create metrics client, metrics are disabled");
                Self::NONE
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// See [`dogstatsd::Client::incr`].
    pub fn incr<'a, I, S, T>(&self, stat: S, tags: I)
    where
        I: IntoIterator<Item = T>,
        S: Into<Cow<'a, str>>,
        T: AsRef<str>,
    {
        if let Some(client) = &self.inner {
            client.incr(metric_name(stat), tags).warn_err();
        }
    }

    /// See [`dogstatsd::Client::count`].
    pub fn count<'a, I, S, T>(&self, stat: S, count: i64, tags: I)
    where
        I: IntoIterator<Item = T>,
        S: Into<Cow<'a, str>>,
        T: AsRef<str>,
    {
        if let Some(client) = &self.inner {
            client.count(metric_name(stat), count, tags).warn_err();
        }
    }

    /// See [`dogstatsd::Client::gauge`].
    pub fn gauge<'a, I, S, V, T>(&self, stat: S, val: V, tags: I)
    where
        I: IntoIterator<Item = T>,
        S: Into<Cow<'a, str>>,
        V: Value,
        T: AsRef<str>,
    {
        if let Some(client) = &self.inner {
            client
                .gauge(metric_name(stat), val.to_metric(), tags)
                .warn_err();
        }
    }

    /// See [`dogstatsd::Client::distribution`].
    pub fn distribution<'a, I, S, V, T>(&self, stat: S, val: V, tags: I)
    where
        I: IntoIterator<Item = T>,
        S: Into<Cow<'a, str>>,
        V: Value,
        T: AsRef<str>,
    {
        if let Some(client) = &self.inner {
            client
                .distribution(metric_name(stat), val.to_metric(), tags)
                .warn_err();
        }
    }

    /// Records `duration` as a distribution named `{stat}.ns`.
    pub fn timing<'a, I, S, T>(&self, stat: S, duration: Duration, tags: I)
    where
        I: IntoIterator<Item = T>,
        S: Into<Cow<'a, str>>,
        T: AsRef<str>,
    {
        if self.inner.is_some() {
            let stat: Cow<'a, str> = stat.into();
            self.distribution(format!("{stat}.ns"), duration.as_nanos(), tags);
        }
    }

    /// Awaits the future returned by `block` and records how long it took
    /// with [`Self::timing`].
    pub async fn async_time<'a, F, Fut, O, I, S, T>(&self, stat: S, tags: I, block: F) -> O
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = O>,
        I: IntoIterator<Item = T>,
        S: Into<Cow<'a, str>>,
        T: AsRef<str>,
    {
        if self.inner.is_none() {
            return block().await;
        }
        let start = Instant::now();
        let output = block().await;
        self.timing(stat, start.elapsed(), tags);
        output
    }
}

fn metric_name<'a>(name: impl Into<Cow<'a, str>>) -> Cow<'a, str> {
    let name = name.into();
    if name.is_empty() {
        return Cow::Borrowed("empty_metric");
    }
    let fixed = match sanitize_metric_name(&name) {
        Cow::Borrowed(_) => None,
        Cow::Owned(fixed) => Some(fixed),
    };
    let output = match fixed {
        Some(fixed) => Cow::Owned(fixed),
        None => name,
    };
    debug_assert!(
        output.len() < 100,
        "metric name '{output}' is longer than recommended"
    );
    output
}

// Datadog metric names must start with a letter and may only contain ASCII
// alphanumerics, underscores and periods.
// https://docs.datadoghq.com/metrics/custom_metrics/#naming-custom-metrics
fn sanitize_metric_name(name: &str) -> Cow<'_, str> {
    sanitize(
        name,
        "empty_metric",
        |c| c.is_ascii_alphanumeric() || c == '_' || c == '.',
        |_| '_',
    )
}

// Tags are lowercase. Uppercase letters are folded, anything else that isn't
// allowed becomes an underscore.
fn sanitize_tag(tag: &str) -> String {
    sanitize(
        tag,
        "empty_tag",
        |c| matches!(c, 'a'..='z' | '0'..='9' | '_' | '-' | ':' | '.' | '/'),
        |c| {
            if c.is_ascii_uppercase() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        },
    )
    .into_owned()
}

fn sanitize<'a>(
    input: &'a str,
    empty: &'a str,
    allowed: fn(char) -> bool,
    replace: fn(char) -> char,
) -> Cow<'a, str> {
    if input.is_empty() {
        return Cow::Borrowed(empty);
    }
    let starts_alpha = input.starts_with(|c: char| c.is_ascii_alphabetic() && allowed(c));
    if starts_alpha && input.chars().all(allowed) {
        return Cow::Borrowed(input);
    }

    let mut output: String = input
        .chars()
        .map(|c| if allowed(c) { c } else { replace(c) })
        .collect();
    if !output.starts_with(|c: char| c.is_ascii_alphabetic()) {
        output.insert(0, 'Z');
    }
    Cow::Owned(output)
}

/// Numeric values that can be sent as a gauge or distribution.
pub trait Value {
    fn to_metric(self) -> String;
}

macro_rules! impl_value {
    ($($t:ty),*) => {
        $(
            impl Value for $t {
                fn to_metric(self) -> String {
                    self.to_string()
                }
            }
        )*
    };
}

impl_value!(i32, i64, u32, u64, u128, usize, f64);

trait Warn {
    fn warn_err(&self);
}

impl Warn for DogstatsdResult {
    fn warn_err(&self) {
        if let Err(err) = self {
            warn!(?err, "failed to send metrics to Datadog agent");
        }
    }
}
