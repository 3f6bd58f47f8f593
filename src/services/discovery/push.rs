use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::models::ServiceChangeEvent;

use super::cache::DiscoveryCache;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// 推送通道消费者：长连接订阅注册中心的变更事件，
/// 断线指数退避重连。投递是尽力而为的，收敛始终由拉取保证。
pub(super) fn spawn_push_consumer(cache: Arc<DiscoveryCache>) {
    let shutdown = cache.shutdown_token();
    let url = cache.push_url();

    let tracker = cache.tracker().clone();
    tracker.spawn(async move {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match connect_async(url.as_str()).await {
                Ok((stream, _response)) => {
                    tracing::info!(push_url = %url, "Push channel connected");
                    backoff = INITIAL_BACKOFF;
                    consume_stream(&cache, stream, &shutdown).await;
                    if shutdown.is_cancelled() {
                        break;
                    }
                    tracing::warn!(push_url = %url, "Push channel disconnected, will reconnect");
                }
                Err(e) => {
                    tracing::warn!(
                        push_url = %url,
                        error = %e,
                        backoff_secs = backoff.as_secs(),
                        "Push channel connect failed"
                    );
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = std::cmp::min(backoff * 2, MAX_BACKOFF);
        }
        tracing::debug!("Push consumer stopped");
    });
}

async fn consume_stream<S>(
    cache: &Arc<DiscoveryCache>,
    mut stream: S,
    shutdown: &tokio_util::sync::CancellationToken,
) where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServiceChangeEvent>(&text) {
                            Ok(event) => cache.enqueue_push_event(event),
                            Err(e) => {
                                tracing::debug!(error = %e, "Ignoring undecodable push frame");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "Push channel read error");
                        break;
                    }
                }
            }
        }
    }
}
