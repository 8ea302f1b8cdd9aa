//! Reconnecting stream state machine shared by the listen and write streams.
//!
//! The machine itself lives on the client's task queue and never awaits.
//! Credential fetches, connects, reads and writes run on spawned tasks that
//! report back through an [`EventSink`]. Every event carries the generation
//! of the connection attempt that produced it; events from a superseded
//! attempt are discarded.

use std::sync::Arc;
use std::time::Duration;

use async_channel::Sender;
use serde_json::Value as JsonValue;

use crate::error::{unavailable, SyncError, SyncErrorCode};
use crate::platform::runtime;
use crate::remote::credentials::StreamCredentialProvider;
use crate::remote::datastore::{StreamHandle, StreamKind, StreamingDatastore};
use crate::settings::SyncSettings;
use crate::util::backoff::ExponentialBackoff;

pub type EventSink<E> = Arc<dyn Fn(E) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    /// Not started, or deliberately closed and ready to start again.
    Initial,
    Authenticating,
    Open,
    /// Waiting out the backoff delay before reconnecting.
    Backoff,
    /// Stopped for good.
    Closed,
}

pub enum StreamEvent {
    Opened {
        kind: StreamKind,
        generation: u64,
        handle: Arc<dyn StreamHandle>,
    },
    Message {
        kind: StreamKind,
        generation: u64,
        payload: Vec<u8>,
    },
    /// The connection attempt or the open stream ended. `None` is a clean
    /// end of stream from the server.
    Closed {
        kind: StreamKind,
        generation: u64,
        error: Option<SyncError>,
    },
    BackoffElapsed {
        kind: StreamKind,
        generation: u64,
    },
    IdleTimeout {
        kind: StreamKind,
        generation: u64,
        idle_token: u64,
    },
}

impl StreamEvent {
    pub fn kind(&self) -> StreamKind {
        match self {
            StreamEvent::Opened { kind, .. }
            | StreamEvent::Message { kind, .. }
            | StreamEvent::Closed { kind, .. }
            | StreamEvent::BackoffElapsed { kind, .. }
            | StreamEvent::IdleTimeout { kind, .. } => *kind,
        }
    }
}

/// How the owner should react to a stream that just closed with an error.
#[derive(Clone, Debug, PartialEq)]
pub struct CloseOutcome {
    pub error: SyncError,
    /// The retry budget is spent (or authentication failed twice in a row);
    /// the error should reach whoever is waiting on this stream.
    pub surface: bool,
}

pub struct PersistentStream {
    kind: StreamKind,
    state: StreamState,
    generation: u64,
    datastore: Arc<dyn StreamingDatastore>,
    credentials: StreamCredentialProvider,
    backoff: ExponentialBackoff,
    idle_timeout: Duration,
    max_retries: u32,
    failures: u32,
    force_refresh: bool,
    auth_retried: bool,
    outbound: Option<Sender<Vec<u8>>>,
    handle: Option<Arc<dyn StreamHandle>>,
    idle_token: Option<u64>,
    next_idle_token: u64,
    sink: Option<EventSink<StreamEvent>>,
}

impl PersistentStream {
    pub fn new(
        kind: StreamKind,
        datastore: Arc<dyn StreamingDatastore>,
        credentials: StreamCredentialProvider,
        settings: &SyncSettings,
    ) -> Self {
        Self {
            kind,
            state: StreamState::Initial,
            generation: 0,
            datastore,
            credentials,
            backoff: ExponentialBackoff::new(settings.backoff.clone()),
            idle_timeout: settings.idle_timeout,
            max_retries: settings.max_stream_retries,
            failures: 0,
            force_refresh: false,
            auth_retried: false,
            outbound: None,
            handle: None,
            idle_token: None,
            next_idle_token: 0,
            sink: None,
        }
    }

    pub fn set_sink(&mut self, sink: EventSink<StreamEvent>) {
        self.sink = Some(sink);
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_open(&self) -> bool {
        self.state == StreamState::Open
    }

    /// Authenticating, open, or waiting to reconnect.
    pub fn is_started(&self) -> bool {
        matches!(
            self.state,
            StreamState::Authenticating | StreamState::Open | StreamState::Backoff
        )
    }

    /// Fetches credentials and opens a new connection. Only valid from
    /// [`StreamState::Initial`].
    pub fn start(&mut self) {
        if self.state != StreamState::Initial {
            log::debug!("{} stream start ignored in state {:?}", self.kind.as_str(), self.state);
            return;
        }
        let Some(sink) = self.sink.clone() else {
            log::warn!("{} stream has no event sink; not starting", self.kind.as_str());
            return;
        };

        self.generation += 1;
        self.state = StreamState::Authenticating;
        let kind = self.kind;
        let generation = self.generation;
        let force_refresh = std::mem::take(&mut self.force_refresh);
        let datastore = Arc::clone(&self.datastore);
        let credentials = self.credentials.clone();
        log::debug!("{} stream authenticating (generation {generation})", kind.as_str());

        runtime::spawn_detached(async move {
            let opened = match credentials.fetch(force_refresh).await {
                Ok(tokens) => datastore.open_stream(kind, tokens).await,
                Err(err) => Err(err),
            };
            match opened {
                Ok(handle) => sink(StreamEvent::Opened {
                    kind,
                    generation,
                    handle,
                }),
                Err(error) => sink(StreamEvent::Closed {
                    kind,
                    generation,
                    error: Some(error),
                }),
            }
        });
    }

    /// Adopts a freshly opened connection. Returns `false` (and closes the
    /// connection) when it belongs to a superseded attempt.
    pub fn handle_opened(&mut self, generation: u64, handle: Arc<dyn StreamHandle>) -> bool {
        if generation != self.generation || self.state != StreamState::Authenticating {
            log::debug!("{} stream discarding stale connection", self.kind.as_str());
            runtime::spawn_detached(async move {
                let _ = handle.close().await;
            });
            return false;
        }
        let Some(sink) = self.sink.clone() else {
            return false;
        };

        let kind = self.kind;
        let (outbound, frames) = async_channel::unbounded::<Vec<u8>>();

        let writer = Arc::clone(&handle);
        let writer_sink = Arc::clone(&sink);
        runtime::spawn_detached(async move {
            while let Ok(frame) = frames.recv().await {
                if let Err(error) = writer.send(frame).await {
                    writer_sink(StreamEvent::Closed {
                        kind,
                        generation,
                        error: Some(error),
                    });
                    return;
                }
            }
        });

        let reader = Arc::clone(&handle);
        runtime::spawn_detached(async move {
            loop {
                match reader.next().await {
                    Some(Ok(payload)) => sink(StreamEvent::Message {
                        kind,
                        generation,
                        payload,
                    }),
                    Some(Err(error)) => {
                        sink(StreamEvent::Closed {
                            kind,
                            generation,
                            error: Some(error),
                        });
                        return;
                    }
                    None => {
                        sink(StreamEvent::Closed {
                            kind,
                            generation,
                            error: None,
                        });
                        return;
                    }
                }
            }
        });

        self.state = StreamState::Open;
        self.outbound = Some(outbound);
        self.handle = Some(handle);
        log::debug!("{} stream open (generation {generation})", kind.as_str());
        true
    }

    /// Queues `frame` for sending. Frames leave in call order.
    pub fn send(&mut self, frame: &JsonValue) {
        self.clear_idle();
        match (&self.outbound, self.state) {
            (Some(outbound), StreamState::Open) => {
                if outbound.try_send(frame.to_string().into_bytes()).is_err() {
                    log::debug!("{} stream writer already gone", self.kind.as_str());
                }
            }
            _ => log::warn!(
                "dropping {} frame: stream is {:?}",
                self.kind.as_str(),
                self.state
            ),
        }
    }

    /// Returns the payload if it belongs to the live connection. Any message
    /// proves the connection healthy and resets the retry budget.
    pub fn handle_message(&mut self, generation: u64, payload: Vec<u8>) -> Option<Vec<u8>> {
        if generation != self.generation || self.state != StreamState::Open {
            log::debug!("{} stream dropping stale message", self.kind.as_str());
            return None;
        }
        self.backoff.reset();
        self.failures = 0;
        self.auth_retried = false;
        Some(payload)
    }

    /// Tears down the connection after an error and classifies it. The
    /// stream returns to [`StreamState::Initial`]; call
    /// [`backoff_and_restart`](Self::backoff_and_restart) to reconnect.
    pub fn handle_closed(
        &mut self,
        generation: u64,
        error: Option<SyncError>,
    ) -> Option<CloseOutcome> {
        if generation != self.generation
            || !matches!(self.state, StreamState::Authenticating | StreamState::Open)
        {
            return None;
        }
        self.tear_down();
        self.state = StreamState::Initial;

        let error = error.unwrap_or_else(|| {
            unavailable(format!("The {} stream was closed by the server", self.kind.as_str()))
        });
        self.failures += 1;
        let mut surface = self.failures > self.max_retries;
        match error.code {
            SyncErrorCode::ResourceExhausted => {
                log::debug!("{} stream throttled; using maximum backoff", self.kind.as_str());
                self.backoff.reset_to_max();
            }
            SyncErrorCode::Unauthenticated => {
                self.credentials.invalidate();
                if self.auth_retried {
                    surface = true;
                } else {
                    self.auth_retried = true;
                    self.force_refresh = true;
                }
            }
            _ => {}
        }
        if surface {
            self.failures = 0;
            self.auth_retried = false;
        }
        log::debug!(
            "{} stream closed with {} (failure {}, surfaced: {surface})",
            self.kind.as_str(),
            error,
            self.failures
        );
        Some(CloseOutcome { error, surface })
    }

    /// Schedules a reconnect after the next backoff delay. A pending forced
    /// credential refresh reconnects immediately.
    pub fn backoff_and_restart(&mut self) {
        if self.state != StreamState::Initial {
            return;
        }
        let Some(sink) = self.sink.clone() else {
            return;
        };
        let delay = if self.force_refresh {
            Duration::ZERO
        } else {
            self.backoff.next_delay()
        };
        self.state = StreamState::Backoff;
        let kind = self.kind;
        let generation = self.generation;
        log::debug!("{} stream backing off for {delay:?}", kind.as_str());
        runtime::spawn_detached(async move {
            runtime::sleep(delay).await;
            sink(StreamEvent::BackoffElapsed { kind, generation });
        });
    }

    pub fn handle_backoff_elapsed(&mut self, generation: u64) {
        if generation == self.generation && self.state == StreamState::Backoff {
            self.state = StreamState::Initial;
            self.start();
        }
    }

    /// Arms the idle timer unless it is already running.
    pub fn mark_idle(&mut self) {
        if self.state != StreamState::Open || self.idle_token.is_some() {
            return;
        }
        let Some(sink) = self.sink.clone() else {
            return;
        };
        self.next_idle_token += 1;
        let idle_token = self.next_idle_token;
        self.idle_token = Some(idle_token);
        let kind = self.kind;
        let generation = self.generation;
        let timeout = self.idle_timeout;
        runtime::spawn_detached(async move {
            runtime::sleep(timeout).await;
            sink(StreamEvent::IdleTimeout {
                kind,
                generation,
                idle_token,
            });
        });
    }

    pub fn clear_idle(&mut self) {
        self.idle_token = None;
    }

    /// Whether an idle timer firing now is still relevant.
    pub fn handle_idle_timeout(&mut self, generation: u64, idle_token: u64) -> bool {
        let live = generation == self.generation
            && self.state == StreamState::Open
            && self.idle_token == Some(idle_token);
        if live {
            self.idle_token = None;
        }
        live
    }

    /// Deliberately closes the stream. It can be started again.
    pub fn close(&mut self) {
        if self.state == StreamState::Closed {
            return;
        }
        if self.state != StreamState::Initial {
            log::debug!("{} stream closing", self.kind.as_str());
        }
        self.generation += 1;
        self.tear_down();
        self.state = StreamState::Initial;
        self.backoff.reset();
        self.failures = 0;
        self.auth_retried = false;
    }

    /// Closes the stream for good.
    pub fn stop(&mut self) {
        self.close();
        self.state = StreamState::Closed;
    }

    fn tear_down(&mut self) {
        self.outbound = None;
        self.idle_token = None;
        if let Some(handle) = self.handle.take() {
            runtime::spawn_detached(async move {
                let _ = handle.close().await;
            });
        }
    }
}
