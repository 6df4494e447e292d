use std::sync::Once;

static INIT: Once = Once::new();

/// Install the fmt subscriber once. `RUST_LOG` directives are honored on
/// top of an `info` floor; calling this again is a no-op.
pub fn init_logging(enable: bool) {
    if !enable {
        return;
    }
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive(tracing::Level::INFO.into()),
            )
            .try_init();
    });
}
