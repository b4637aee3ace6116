#![cfg_attr(test, allow(clippy::unwrap_used))]

mod err_with_sources;

use anyhow::{Context as _, Result};
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    filter::ParseError,
    fmt,
    layer::SubscriberExt as _,
    registry::LookupSpan,
    reload,
    util::SubscriberInitExt as _,
};

pub use err_with_sources::{ErrorWithSources, err_with_src};

/// Registers a global subscriber that logs to stdout, filtered by `directives`.
///
/// Returns a handle through which the filter can be swapped at runtime
/// (used by configuration reloads).
pub fn setup(directives: &str) -> Result<FilterReloadHandle> {
    let (filter, reload_handle) = try_filter(directives).context("Failed to parse directives")?;

    let subscriber = Registry::default().with(fmt::layer().with_filter(filter));

    subscriber
        .try_init()
        .context("Failed to init global subscriber")?;

    Ok(FilterReloadHandle {
        inner: reload_handle,
    })
}

/// Constructs an [`EnvFilter`] plus a handle to reload it later.
pub fn try_filter<S>(
    directives: &str,
) -> Result<(reload::Layer<EnvFilter, S>, reload::Handle<EnvFilter, S>), ParseError>
where
    S: 'static,
{
    let filter = EnvFilter::try_new(directives)?;
    let (layer, handle) = reload::Layer::new(filter);

    Ok((layer, handle))
}

pub struct FilterReloadHandle {
    inner: reload::Handle<EnvFilter, Registry>,
}

impl FilterReloadHandle {
    pub fn reload(&self, new_directives: &str) -> Result<()> {
        let filter = EnvFilter::try_new(new_directives).context("Failed to parse directives")?;

        self.inner
            .reload(filter)
            .context("Failed to reload filter")?;

        Ok(())
    }
}

/// Initialises logging for a test, active for as long as the returned guard lives.
pub fn test(directives: &str) -> DefaultGuard {
    let subscriber = Registry::default().with(test_layer(directives));

    tracing::subscriber::set_default(subscriber)
}

fn test_layer<S>(directives: &str) -> impl Layer<S>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    let env_filter = EnvFilter::new(directives);

    fmt::layer().with_test_writer().with_filter(env_filter)
}
