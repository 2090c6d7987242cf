//! The `/sync/v{N}/connect` WebSocket.
//!
//! Messages from the group's syncer and this connection's own replies
//! (pongs, protocol errors) share the socket. The socket is closed once the
//! syncer drops its end, which happens when the client is replaced, the
//! group stops, or the connection fails.

use crate::AppState;
use crate::syncer_service::SyncerHandle;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;
use viewsync::{ConnectRequest, SyncError};
use viewsync_protocol::down::PongBody;
use viewsync_protocol::{ConnectParams, Downstream, Upstream};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// `v5` -> 5
pub fn parse_protocol_version(segment: &str) -> Option<u32> {
    segment.strip_prefix('v')?.parse().ok()
}

pub async fn sync_handler(
    ws: WebSocketUpgrade,
    Path(version): Path<String>,
    Query(mut params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> Response {
    let Some(protocol_version) = parse_protocol_version(&version) else {
        return (StatusCode::NOT_FOUND, "unknown sync path").into_response();
    };
    let wsid = params
        .wsid
        .get_or_insert_with(|| Uuid::new_v4().to_string())
        .clone();
    let span = info_span!(
        "connection",
        client_group = %params.client_group_id,
        client_id = %params.client_id,
        wsid = %wsid,
        protocol_version,
    );
    ws.on_upgrade(move |socket| {
        Connection {
            state,
            params,
            protocol_version,
            handle: None,
        }
        .run(socket)
        .instrument(span)
    })
}

struct Connection {
    state: AppState,
    params: ConnectParams,
    protocol_version: u32,
    /// Set once `initConnection` has been accepted.
    handle: Option<SyncerHandle>,
}

enum Next {
    Continue,
    Close,
}

impl Connection {
    async fn run(mut self, socket: WebSocket) {
        let (ws_sender, mut ws_receiver) = socket.split();
        let (control_tx, control_rx) = mpsc::unbounded_channel::<Downstream>();
        let (sink, sync_rx) = mpsc::unbounded_channel::<Downstream>();
        let mut send_task = tokio::spawn(forward(ws_sender, control_rx, sync_rx));
        // Held until the syncer owns a clone, so a rejected connect can
        // still be reported.
        let mut sink = Some(sink);
        debug!("connection opened");

        loop {
            let frame = tokio::select! {
                _ = &mut send_task => break,
                frame = ws_receiver.next() => frame,
            };
            let text = match frame {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => text,
                    Err(e) => {
                        self.reject(&control_tx, SyncError::InvalidMessage(e.to_string()), &mut sink);
                        break;
                    }
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    debug!(error = %e, "socket error");
                    break;
                }
            };
            let next = match serde_json::from_str::<Upstream>(&text) {
                Ok(message) => self.handle(message, &control_tx, &mut sink).await,
                Err(e) => {
                    self.reject(&control_tx, SyncError::InvalidMessage(e.to_string()), &mut sink);
                    Next::Close
                }
            };
            if matches!(next, Next::Close) {
                break;
            }
        }

        drop(sink);
        drop(control_tx);
        if let Some(handle) = &self.handle {
            let wsid = self.params.wsid.as_deref().unwrap_or_default();
            handle.disconnect(&self.params.client_id, wsid);
            self.state.metrics.active_connections.add(-1, &[]);
        }
        if !send_task.is_finished() {
            let _ = tokio::time::timeout(FLUSH_TIMEOUT, send_task).await;
        }
        debug!("connection closed");
    }

    async fn handle(
        &mut self,
        message: Upstream,
        control: &mpsc::UnboundedSender<Downstream>,
        sink: &mut Option<mpsc::UnboundedSender<Downstream>>,
    ) -> Next {
        match message {
            Upstream::Ping(_) => {
                let _ = control.send(Downstream::Pong(PongBody {}));
                Next::Continue
            }
            Upstream::InitConnection(body) => {
                let Some(own) = sink.take() else {
                    let err = SyncError::InvalidMessage("duplicate initConnection".into());
                    self.reject(control, err, sink);
                    return Next::Close;
                };
                let request = ConnectRequest {
                    params: self.params.clone(),
                    protocol_version: self.protocol_version,
                    desired_queries_patch: body.desired_queries_patch,
                };
                let result = match self.state.dispatcher.handle_for(&self.params.client_group_id).await {
                    Ok(handle) => handle.connect(request, own.clone()).await.map(|()| handle),
                    Err(e) => Err(e),
                };
                match result {
                    Ok(handle) => {
                        info!(client_group = handle.group_id(), "client connected");
                        self.state.metrics.active_connections.add(1, &[]);
                        self.handle = Some(handle);
                        Next::Continue
                    }
                    Err(err) => {
                        warn!(error = %err, kind = %err.error_kind(), "connect rejected");
                        let _ = own.send(Downstream::Error(err.to_body()));
                        Next::Close
                    }
                }
            }
            Upstream::ChangeDesiredQueries(body) => {
                let Some(handle) = &self.handle else {
                    let err = SyncError::InvalidMessage("expected initConnection first".into());
                    self.reject(control, err, sink);
                    return Next::Close;
                };
                match handle
                    .change_desired_queries(&self.params.client_id, body.desired_queries_patch)
                    .await
                {
                    Ok(()) => Next::Continue,
                    Err(err) => {
                        warn!(error = %err, "changeDesiredQueries failed");
                        let _ = control.send(Downstream::Error(err.to_body()));
                        Next::Close
                    }
                }
            }
        }
    }

    /// Report a protocol error. Before the syncer owns the connection the
    /// error goes through the held sink so it is flushed before closing.
    fn reject(
        &self,
        control: &mpsc::UnboundedSender<Downstream>,
        err: SyncError,
        sink: &mut Option<mpsc::UnboundedSender<Downstream>>,
    ) {
        info!(error = %err, "rejecting message");
        let message = Downstream::Error(err.to_body());
        match sink.take() {
            Some(own) => {
                let _ = own.send(message);
            }
            None => {
                let _ = control.send(message);
            }
        }
    }
}

/// Write messages to the socket until the syncer side closes, then flush
/// pending control messages and close the socket.
async fn forward(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut control_rx: mpsc::UnboundedReceiver<Downstream>,
    mut sync_rx: mpsc::UnboundedReceiver<Downstream>,
) {
    loop {
        let message = tokio::select! {
            biased;
            Some(message) = control_rx.recv() => message,
            message = sync_rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        if send(&mut ws_sender, &message).await.is_err() {
            return;
        }
    }
    while let Ok(message) = control_rx.try_recv() {
        if send(&mut ws_sender, &message).await.is_err() {
            return;
        }
    }
    let _ = ws_sender.close().await;
}

async fn send(ws_sender: &mut SplitSink<WebSocket, Message>, message: &Downstream) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(message) {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, tag = message.tag(), "failed to encode message");
            return Ok(());
        }
    };
    ws_sender.send(Message::Text(text)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_protocol_version() {
        assert_eq!(parse_protocol_version("v5"), Some(5));
        assert_eq!(parse_protocol_version("v12"), Some(12));
        assert_eq!(parse_protocol_version("5"), None);
        assert_eq!(parse_protocol_version("vx"), None);
    }
}
