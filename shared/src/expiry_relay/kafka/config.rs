use relay_config::KafkaConfig;
use rdkafka::config::ClientConfig;
use tracing::info;

/// Client configuration shared by the producer, consumer and admin clients
///
/// Security protocol follows the settings: `plaintext` by default, `ssl` when
/// TLS is enabled, `sasl_plaintext` / `sasl_ssl` once SASL credentials are
/// complete.
pub fn create_client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config.set("bootstrap.servers", &config.brokers);
    client_config.set("security.protocol", "plaintext");

    if config.ssl_enabled {
        info!("Enabling SSL/TLS for Kafka connection");
        client_config.set("security.protocol", "ssl");
        if let Some(ca) = &config.ssl_ca_location {
            client_config.set("ssl.ca.location", ca);
        }
    }

    if let (Some(mechanism), Some(username), Some(password)) = (
        &config.sasl_mechanism,
        &config.sasl_username,
        &config.sasl_password,
    ) {
        info!(sasl_mechanism = %mechanism, "Configuring SASL authentication");
        client_config
            .set("sasl.mechanism", mechanism)
            .set("sasl.username", username)
            .set("sasl.password", password)
            .set(
                "security.protocol",
                if config.ssl_enabled {
                    "sasl_ssl"
                } else {
                    "sasl_plaintext"
                },
            );
    }

    client_config
}
