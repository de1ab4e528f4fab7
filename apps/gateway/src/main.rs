//! 网关入口：加载配置 → 构建首个 Epoch → 启动 REST 服务。

use std::sync::Arc;

use driver_gateway::{AppState, EpochCell, Gateway, GatewaySettings, create_router};
use gw_config::AppConfig;
use gw_control::{MqttBridge, MqttBridgeConfig};
use gw_pipeline::{LogNotificationSink, LogPublisher, NotificationSink, Publisher};
use gw_script::PluginCache;
use gw_telemetry::init_tracing;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 加载本地 .env（如存在），便于直接 cargo run 启动
    dotenvy::dotenv().ok();
    let config = AppConfig::from_env()?;
    init_tracing();

    let cell = Arc::new(EpochCell::default());
    let mut bridge_task = None;
    let (publisher, sink): (Arc<dyn Publisher>, Arc<dyn NotificationSink>) = match &config.mqtt {
        Some(mqtt) => {
            let (bridge, task) = MqttBridge::connect(
                MqttBridgeConfig {
                    host: mqtt.host.clone(),
                    port: mqtt.port,
                    username: mqtt.username.clone(),
                    password: mqtt.password.clone(),
                    client_id: mqtt.client_id.clone(),
                    topic_prefix: mqtt.topic_prefix.clone(),
                },
                cell.clone(),
            )?;
            bridge_task = Some(task);
            let bridge = Arc::new(bridge);
            let publisher: Arc<dyn Publisher> = bridge.clone();
            let sink: Arc<dyn NotificationSink> = bridge;
            (publisher, sink)
        }
        None => {
            let publisher: Arc<dyn Publisher> = Arc::new(LogPublisher);
            let sink: Arc<dyn NotificationSink> = Arc::new(LogNotificationSink);
            (publisher, sink)
        }
    };

    let gateway = Arc::new(
        Gateway::start(
            GatewaySettings::from_app_config(&config),
            publisher,
            sink,
            PluginCache::new(),
            cell,
        )
        .await?,
    );

    let app = create_router(AppState {
        gateway: gateway.clone(),
    });
    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    info!(target: "gw.bootstrap", addr = %config.http_addr, "rest api listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    gateway.shutdown().await;
    if let Some(task) = bridge_task {
        task.abort();
    }
    Ok(())
}
