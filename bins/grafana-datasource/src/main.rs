mod plugin;

use plugin::RabbitMqPlugin;

#[grafana_plugin_sdk::main(
    services(data, diagnostics, stream),
    init_subscriber = true,
)]
async fn plugin() -> RabbitMqPlugin {
    RabbitMqPlugin::new()
}
