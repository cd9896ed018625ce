//! Standalone shareterm server binary. Run with --port and
//! --scrollback-bytes, or use settings.json / built-in defaults.

use std::sync::Arc;

use common::{config, registry::Registry};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "server=info,common=info".into()),
        )
        .init();

    let cfg = config::ensure_loaded();
    let mut port = cfg.port;
    let mut scrollback_bytes = cfg.scrollback_bytes;

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        if args[i] == "--port" && i + 1 < args.len() {
            port = args[i + 1].parse().unwrap_or(port);
            i += 2;
            continue;
        }
        if args[i] == "--scrollback-bytes" && i + 1 < args.len() {
            scrollback_bytes = args[i + 1].parse().unwrap_or(scrollback_bytes);
            i += 2;
            continue;
        }
        i += 1;
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let registry = Arc::new(Registry::new(scrollback_bytes));
        server::run_web_server(port, registry).await
    })
}
