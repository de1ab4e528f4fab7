//! 影子回调（同步）到 NotificationSink（异步）的桥接。

use std::sync::Arc;

use domain::{DeviceEvent, now_epoch_ms};
use gw_storage::OnlineChangeCallback;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::NotificationSink;

/// 返回可注册到影子的回调与投递任务。
///
/// 事件按边沿发生顺序投递；回调端永不阻塞。
pub fn spawn_notifier(sink: Arc<dyn NotificationSink>) -> (OnlineChangeCallback, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<DeviceEvent>();
    let callback: OnlineChangeCallback = Arc::new(move |device_sn: &str, online: bool| {
        gw_telemetry::record_online_edge(online);
        let _ = tx.send(DeviceEvent::online_change(device_sn, online, now_epoch_ms()));
    });
    let task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Err(e) = sink.notify(event).await {
                warn!(target: "gw.pipeline", error = %e, "device event dropped");
            }
        }
    });
    (callback, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PipelineError;
    use async_trait::async_trait;
    use domain::OnlineState;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Events(Mutex<Vec<DeviceEvent>>);

    #[async_trait]
    impl NotificationSink for Events {
        async fn notify(&self, event: DeviceEvent) -> Result<(), PipelineError> {
            self.0.lock().expect("lock").push(event);
            Ok(())
        }
    }

    #[tokio::test]
    async fn edges_are_delivered_in_order() {
        let sink = Arc::new(Events::default());
        let (callback, task) = spawn_notifier(sink.clone());
        callback("dev-1", true);
        callback("dev-1", false);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let events = sink.0.lock().expect("lock").clone();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_data.state, OnlineState::Online);
        assert_eq!(events[1].event_data.state, OnlineState::Offline);
        assert_eq!(events[1].event_type, "DeviceEvent");
        task.abort();
    }
}
