#![allow(dead_code)]

use std::sync::{Arc, Once};

use dw_cli::Engine;
use dw_config::DwConfig;
use dw_remote::EnvCredentialResolver;
use dw_remote::mock::MockTransport;
use dw_store::DwStore;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

static INIT: Once = Once::new();

/// Initialize tracing once for integration tests.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::registry()
            .with(fmt::layer().with_test_writer())
            .with(filter)
            .init();
    });
}

/// An engine on an in-memory store and a scripted transport.
pub fn test_engine(config_toml: &str) -> (MockTransport, Arc<Engine>) {
    init_tracing();
    let config = DwConfig::from_toml(config_toml).expect("test config parses");
    let transport = MockTransport::new();
    let engine = Engine::assemble(
        config,
        Arc::new(DwStore::open_memory().expect("in-memory store")),
        Arc::new(transport.clone()),
        Arc::new(EnvCredentialResolver::with_lookup(|_| None)),
    )
    .expect("engine assembles");
    (transport, Arc::new(engine))
}
