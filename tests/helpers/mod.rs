#![allow(dead_code)]

pub mod mock_h2_server;
pub mod mock_h3_server;
pub mod mock_server;
pub mod proxy_server;
pub mod tls;

/// Install a test subscriber once; `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("veil=debug")),
        )
        .with_test_writer()
        .try_init();
}
