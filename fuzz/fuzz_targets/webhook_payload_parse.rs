#![no_main]

use std::sync::OnceLock;

use iris_connectors::{
    validate_parsed_message, ChannelProvider, ConnectorRegistry, PARSED_MESSAGE_SCHEMA_VERSION,
};
use libfuzzer_sys::fuzz_target;

static REGISTRY: OnceLock<ConnectorRegistry> = OnceLock::new();

fuzz_target!(|data: &[u8]| {
    let registry = REGISTRY.get_or_init(ConnectorRegistry::new);
    for provider in ChannelProvider::ALL {
        let Ok(connector) = registry.resolve(provider) else {
            continue;
        };
        match connector.parse_webhook(data) {
            Ok(parsed) => {
                assert_eq!(parsed.schema_version, PARSED_MESSAGE_SCHEMA_VERSION);
                // Validation may still reject a structurally parsed message;
                // it must never panic on one.
                let _ = validate_parsed_message(&parsed);
            }
            Err(error) => {
                assert_eq!(error.provider, provider);
                assert!(!error.message.trim().is_empty());
            }
        }
    }
});
