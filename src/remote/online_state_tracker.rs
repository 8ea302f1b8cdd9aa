use std::fmt;
use std::time::Duration;

use crate::error::SyncError;
use crate::platform::runtime;
use crate::remote::persistent_stream::EventSink;

/// Consecutive watch stream failures tolerated before reporting offline.
pub const MAX_WATCH_STREAM_FAILURES: u32 = 1;

/// Connectivity as observed through the listen stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum OnlineState {
    /// Still trying to establish a healthy connection.
    #[default]
    Unknown,
    Online,
    Offline,
}

impl fmt::Display for OnlineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            OnlineState::Unknown => "unknown",
            OnlineState::Online => "online",
            OnlineState::Offline => "offline",
        };
        f.write_str(label)
    }
}

/// Derives [`OnlineState`] from watch stream activity.
///
/// A stream attempt that neither succeeds nor fails within the grace window,
/// or [`MAX_WATCH_STREAM_FAILURES`] failures in a row, flips `Unknown` to
/// `Offline`. Every method returns the new state when it changed.
pub struct OnlineStateTracker {
    state: OnlineState,
    watch_stream_failures: u32,
    timeout: Duration,
    timer_token: u64,
    timer_armed: bool,
    warned_offline: bool,
    sink: Option<EventSink<u64>>,
}

impl OnlineStateTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: OnlineState::Unknown,
            watch_stream_failures: 0,
            timeout,
            timer_token: 0,
            timer_armed: false,
            warned_offline: false,
            sink: None,
        }
    }

    /// Receives the token of each grace timer when it fires.
    pub fn set_timer_sink(&mut self, sink: EventSink<u64>) {
        self.sink = Some(sink);
    }

    pub fn state(&self) -> OnlineState {
        self.state
    }

    pub fn handle_watch_stream_start(&mut self) -> Option<OnlineState> {
        if self.watch_stream_failures != 0 {
            return None;
        }
        let changed = self.set_and_report(OnlineState::Unknown);
        self.arm_timer();
        changed
    }

    pub fn handle_timer(&mut self, token: u64) -> Option<OnlineState> {
        if !self.timer_armed || token != self.timer_token {
            return None;
        }
        self.timer_armed = false;
        if self.state != OnlineState::Unknown {
            return None;
        }
        self.warn_offline(&format!(
            "backend did not respond within {:?}",
            self.timeout
        ));
        self.set_and_report(OnlineState::Offline)
    }

    pub fn handle_watch_stream_failure(&mut self, error: &SyncError) -> Option<OnlineState> {
        if self.state == OnlineState::Online {
            return self.set_and_report(OnlineState::Unknown);
        }
        self.watch_stream_failures += 1;
        if self.watch_stream_failures >= MAX_WATCH_STREAM_FAILURES {
            self.timer_armed = false;
            self.warn_offline(&format!("connection failed {} times: {error}", self.watch_stream_failures));
            return self.set_and_report(OnlineState::Offline);
        }
        None
    }

    /// Explicit transition, e.g. online on the first watch message or
    /// offline when the network is disabled.
    pub fn set(&mut self, state: OnlineState) -> Option<OnlineState> {
        self.timer_armed = false;
        self.watch_stream_failures = 0;
        if state == OnlineState::Online {
            self.warned_offline = false;
        }
        self.set_and_report(state)
    }

    fn set_and_report(&mut self, state: OnlineState) -> Option<OnlineState> {
        if self.state == state {
            return None;
        }
        log::debug!("online state {} -> {}", self.state, state);
        self.state = state;
        Some(state)
    }

    fn arm_timer(&mut self) {
        let Some(sink) = self.sink.clone() else {
            return;
        };
        self.timer_token += 1;
        self.timer_armed = true;
        let token = self.timer_token;
        let timeout = self.timeout;
        runtime::spawn_detached(async move {
            runtime::sleep(timeout).await;
            sink(token);
        });
    }

    fn warn_offline(&mut self, reason: &str) {
        if !self.warned_offline {
            log::warn!("could not reach the backend ({reason}); operating offline");
            self.warned_offline = true;
        }
    }
}
