//! Streams carried over WebSocket connections, one connection per stream.
//!
//! Each stream connects to `{endpoint}/listen` or `{endpoint}/write`. The
//! auth token travels as a bearer `Authorization` header and the app-check
//! token as `X-App-Check`. A close frame whose reason is a JSON
//! status `{"code": <rpc code>, "message": ...}` surfaces as that error;
//! any other close is a clean end of stream.

use std::sync::Arc;

use futures::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value as JsonValue;
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use super::{
    box_stream_future, StreamCredentials, StreamHandle, StreamKind, StreamingDatastore,
    StreamingFuture,
};
use crate::error::{invalid_argument, unavailable, SyncError, SyncResult};
use crate::remote::rpc_error::decode_status;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Clone, Debug)]
pub struct WebSocketDatastore {
    endpoint: Url,
}

impl WebSocketDatastore {
    pub fn new(endpoint: Url) -> Self {
        Self { endpoint }
    }

    pub fn parse(endpoint: &str) -> SyncResult<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|err| invalid_argument(format!("Invalid stream endpoint '{endpoint}': {err}")))?;
        match endpoint.scheme() {
            "ws" | "wss" => Ok(Self::new(endpoint)),
            other => Err(invalid_argument(format!(
                "Stream endpoints must use ws or wss, got '{other}'"
            ))),
        }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn stream_url(&self, kind: StreamKind) -> SyncResult<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| invalid_argument(format!("Endpoint {} cannot carry a path", self.endpoint)))?
            .pop_if_empty()
            .push(kind.as_str());
        Ok(url)
    }
}

fn header(value: String) -> SyncResult<HeaderValue> {
    HeaderValue::from_str(&value).map_err(|err| invalid_argument(format!("Invalid header value: {err}")))
}

impl StreamingDatastore for WebSocketDatastore {
    fn open_stream(
        &self,
        kind: StreamKind,
        credentials: StreamCredentials,
    ) -> StreamingFuture<'_, SyncResult<Arc<dyn StreamHandle>>> {
        box_stream_future(async move {
            let url = self.stream_url(kind)?;
            let mut request = url
                .as_str()
                .into_client_request()
                .map_err(|err| invalid_argument(format!("Invalid stream request: {err}")))?;
            if let Some(token) = credentials.auth_token {
                request
                    .headers_mut()
                    .insert("Authorization", header(format!("Bearer {token}"))?);
            }
            if let Some(token) = credentials.app_check_token {
                request
                    .headers_mut()
                    .insert("X-App-Check", header(token)?);
            }

            log::debug!("opening {} stream at {url}", kind.as_str());
            let (socket, _response) = connect_async(request)
                .await
                .map_err(|err| unavailable(format!("Failed to connect {url}: {err}")))?;
            let (sink, reader) = socket.split();
            Ok(Arc::new(WebSocketStreamHandle {
                sink: AsyncMutex::new(sink),
                reader: AsyncMutex::new(reader),
            }) as Arc<dyn StreamHandle>)
        })
    }
}

struct WebSocketStreamHandle {
    sink: AsyncMutex<SplitSink<Socket, Message>>,
    reader: AsyncMutex<SplitStream<Socket>>,
}

fn close_error(frame: Option<CloseFrame<'static>>) -> Option<SyncError> {
    let frame = frame?;
    let status: JsonValue = serde_json::from_str(&frame.reason).ok()?;
    status.get("code")?;
    Some(decode_status(&status))
}

impl StreamHandle for WebSocketStreamHandle {
    fn send(&self, payload: Vec<u8>) -> StreamingFuture<'_, SyncResult<()>> {
        box_stream_future(async move {
            let text = String::from_utf8(payload)
                .map_err(|err| invalid_argument(format!("Stream frames must be UTF-8: {err}")))?;
            self.sink
                .lock()
                .await
                .send(Message::Text(text))
                .await
                .map_err(|err| unavailable(format!("WebSocket send failed: {err}")))
        })
    }

    fn next(&self) -> StreamingFuture<'_, Option<SyncResult<Vec<u8>>>> {
        box_stream_future(async move {
            let mut reader = self.reader.lock().await;
            loop {
                match reader.next().await? {
                    Ok(Message::Text(text)) => return Some(Ok(text.into_bytes())),
                    Ok(Message::Binary(bytes)) => return Some(Ok(bytes)),
                    Ok(Message::Close(frame)) => return close_error(frame).map(Err),
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
                    Err(err) => {
                        return Some(Err(unavailable(format!("WebSocket receive failed: {err}"))))
                    }
                }
            }
        })
    }

    fn close(&self) -> StreamingFuture<'_, SyncResult<()>> {
        box_stream_future(async move {
            self.sink
                .lock()
                .await
                .close()
                .await
                .map_err(|err| unavailable(format!("WebSocket close failed: {err}")))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncErrorCode;
    use std::borrow::Cow;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

    #[test]
    fn stream_urls_append_the_stream_kind() {
        let datastore = WebSocketDatastore::parse("ws://localhost:8080/v1/").unwrap();
        assert_eq!(
            datastore.stream_url(StreamKind::Listen).unwrap().as_str(),
            "ws://localhost:8080/v1/listen"
        );
        assert_eq!(
            datastore.stream_url(StreamKind::Write).unwrap().as_str(),
            "ws://localhost:8080/v1/write"
        );
    }

    #[test]
    fn rejects_non_websocket_endpoints() {
        let err = WebSocketDatastore::parse("https://example.com").unwrap_err();
        assert_eq!(err.code, SyncErrorCode::InvalidArgument);
    }

    #[test]
    fn close_frames_with_status_become_errors() {
        let frame = CloseFrame {
            code: CloseCode::Policy,
            reason: Cow::Owned(r#"{"code":16,"message":"expired"}"#.to_string()),
        };
        let error = close_error(Some(frame)).unwrap();
        assert_eq!(error.code, SyncErrorCode::Unauthenticated);
        assert!(close_error(None).is_none());
    }

    #[tokio::test]
    async fn echoes_frames_through_a_local_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut socket = accept_async(tcp).await.unwrap();
            while let Some(Ok(message)) = socket.next().await {
                if message.is_text() {
                    socket.send(message).await.unwrap();
                }
            }
        });

        let datastore = WebSocketDatastore::parse(&format!("ws://{address}/")).unwrap();
        let stream = datastore
            .open_stream(StreamKind::Listen, StreamCredentials::default())
            .await
            .unwrap();
        stream.send(br#"{"database":"d"}"#.to_vec()).await.unwrap();
        let echoed = stream.next().await.unwrap().unwrap();
        assert_eq!(echoed, br#"{"database":"d"}"#.to_vec());
        stream.close().await.unwrap();
    }
}
