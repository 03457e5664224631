use chrono::Utc;
use device_relay_lambda::adapters::dtls::DtlsConnector;
use device_relay_lambda::handlers::relay::handle_relay_event;
use device_relay_lambda::runtime::{RelayConfig, RelayResponse};
use device_relay_lambda::settings::{settings_from_env, trust_roots_from_env};
use device_relay_lambda::telemetry::init_tracing;
use lambda_runtime::{service_fn, Error, LambdaEvent};
use serde_json::Value;
use tracing::{info, warn};

async fn handle_request(
    event: LambdaEvent<Value>,
    config: &RelayConfig,
    connector: &DtlsConnector,
) -> Result<RelayResponse, Error> {
    info!(request_id = %event.context.request_id, "relay invocation");
    handle_relay_event(event.payload, config, connector, Utc::now()).map_err(Error::from)
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    init_tracing();

    let config = settings_from_env()?;
    let connector = DtlsConnector::with_extra_roots(trust_roots_from_env()?)?;
    if config.transport.insecure_skip_verify {
        warn!(
            endpoint = %config.endpoint,
            "peer certificate verification is disabled"
        );
    }
    info!(
        endpoint = %config.endpoint,
        trust_anchors = connector.trust_anchor_count(),
        "relay configured"
    );

    let config = &config;
    let connector = &connector;
    lambda_runtime::run(service_fn(move |event| {
        handle_request(event, config, connector)
    }))
    .await
}
