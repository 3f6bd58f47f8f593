use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;

use super::http::RegistryState;

/// WebSocket 推送端点：把变更源按版本序转发给订阅者。
/// 投递是尽力而为的，落后的订阅者被切断，由拉取端点对账。
pub async fn ws_registry_handler(
    State(state): State<RegistryState>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| push_events(socket, state))
}

async fn push_events(socket: WebSocket, state: RegistryState) {
    let (mut outbound, mut inbound) = socket.split();
    let feed = state.registry.feed();
    let mut events = feed.subscribe();
    let drain = state.config.subscriber_drain();
    tracing::info!(
        subscriber_count = feed.subscriber_count(),
        "Push subscriber connected"
    );

    loop {
        tokio::select! {
            // 停机时给订阅者一个排空宽限期后关闭
            _ = state.shutdown.cancelled() => {
                let _ = tokio::time::timeout(drain, outbound.send(Message::Close(None))).await;
                break;
            }
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let frame = match serde_json::to_string(&event) {
                            Ok(json) => json,
                            Err(e) => {
                                tracing::error!(error = %e, "Failed to encode change event");
                                continue;
                            }
                        };
                        if outbound.send(Message::Text(frame.into())).await.is_err() {
                            tracing::debug!("Push subscriber disconnected");
                            break;
                        }
                    }
                    // 订阅者消费太慢，切断连接，客户端重连后用拉取补齐
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            skipped_events = skipped,
                            "Push subscriber lagged, closing connection"
                        );
                        let _ = outbound.send(Message::Close(None)).await;
                        break;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            frame = inbound.next() => {
                match frame {
                    // 客户端只会发心跳帧或关闭帧
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "Push subscriber socket error");
                        break;
                    }
                }
            }
        }
    }

    tracing::info!("Push subscriber closed");
}
