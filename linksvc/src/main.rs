//! linksvc main entry point
//!
//! Runs one connection microservice described by a JSON configuration file.

use std::env;
use std::process;
use std::sync::Arc;

use env_logger::Env;
use log::{error, info};

use linkgs::{MemoryStatusStore, MessageBus, MicroserviceIdentity, RelayError, RelayResult};
use linksvc_lib::config::constants::MICROSERVICE_NAME_ENV;
use linksvc_lib::{build_endpoint, load_config, LinkMicroservice, LinkServices};

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "linksvc.json".to_string());

    if let Err(e) = run(&config_path) {
        error!("linksvc exiting: {}", e);
        process::exit(1);
    }
}

fn run(config_path: &str) -> RelayResult<()> {
    info!("Loading configuration from: {}", config_path);
    let config = load_config(config_path)?;

    let name = match config.name.clone() {
        Some(name) => name,
        None => env::var(MICROSERVICE_NAME_ENV).map_err(|_| {
            RelayError::identity(format!(
                "No microservice name in configuration or {}",
                MICROSERVICE_NAME_ENV
            ))
        })?,
    };
    let identity = MicroserviceIdentity::parse(&name, config.target_names.clone())?;
    let endpoint = build_endpoint(&config.endpoint, identity.kind)?;

    let store = Arc::new(MemoryStatusStore::new());
    let services = LinkServices {
        store: store.clone(),
        bus: Arc::new(MessageBus::new(config.link.queue_capacity)),
    };

    let microservice = Arc::new(LinkMicroservice::new(
        &name,
        config.target_names.clone(),
        endpoint,
        config.link.clone(),
        services,
    )?);

    let handler_service = Arc::clone(&microservice);
    ctrlc::set_handler(move || {
        info!("Interrupt received");
        handler_service.shutdown();
    })
    .map_err(|e| RelayError::configuration(format!("Unable to install signal handler: {}", e)))?;

    let result = microservice.run();
    microservice.shutdown();

    match store.to_json() {
        Ok(json) => info!("Final status: {}", json),
        Err(e) => error!("Unable to dump status: {}", e),
    }
    result
}
