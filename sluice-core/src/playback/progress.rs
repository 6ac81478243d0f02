use serde::Serialize;
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};
use tokio::sync::mpsc as tokio_mpsc;
use tracing::info;

/// Periodic engine state report
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub current_track: Option<String>,
    pub current_time_seconds: f64,
    pub waiting_for_data: bool,
    pub user_paused: bool,
    pub playback_running: bool,
    pub duration: f64,
    /// Audio queued in the device but not yet heard
    pub latency_seconds: f64,
}

/// Progress updates produced by the engine and the ingestion side
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PlaybackProgress {
    State(StateSnapshot),
    /// Per-segment readiness, one entry (0 or 1) per segment
    #[serde(rename_all = "camelCase")]
    LoadProgress { segment_progress: Vec<u8> },
    /// Perceptual waveform for the current local track, values in [0, 1]
    Waveform { track: String, peaks: Vec<f32> },
    /// The engine reached the end of the buffer. Repeat/next is up to the listener.
    TrackEnded { track: String },
    LoadFailed { track: String, message: String },
    DeviceError { message: String },
}

type SubscriptionId = u64;

#[derive(Debug, Clone, Copy)]
enum SubscriptionFilter {
    All,
    /// State snapshots and end-of-track
    Transport,
    /// Segment progress, waveform and load failures
    Loading,
}

impl SubscriptionFilter {
    fn matches(&self, progress: &PlaybackProgress) -> bool {
        match self {
            SubscriptionFilter::All => true,
            SubscriptionFilter::Transport => matches!(
                progress,
                PlaybackProgress::State(_)
                    | PlaybackProgress::TrackEnded { .. }
                    | PlaybackProgress::DeviceError { .. }
            ),
            SubscriptionFilter::Loading => matches!(
                progress,
                PlaybackProgress::LoadProgress { .. }
                    | PlaybackProgress::Waveform { .. }
                    | PlaybackProgress::LoadFailed { .. }
            ),
        }
    }
}

struct Subscription {
    filter: SubscriptionFilter,
    tx: tokio_mpsc::UnboundedSender<PlaybackProgress>,
}

type Subscriptions = Arc<Mutex<HashMap<SubscriptionId, Subscription>>>;

/// Fans progress updates out to any number of subscribers
#[derive(Clone)]
pub struct PlaybackProgressHandle {
    subscriptions: Subscriptions,
    next_id: Arc<AtomicU64>,
}

impl PlaybackProgressHandle {
    /// Create a new progress handle and spawn the task that distributes updates
    pub fn new(
        mut progress_rx: tokio_mpsc::UnboundedReceiver<PlaybackProgress>,
        runtime_handle: tokio::runtime::Handle,
    ) -> Self {
        let subscriptions: Subscriptions = Arc::new(Mutex::new(HashMap::new()));
        let subscriptions_clone = subscriptions.clone();
        runtime_handle.spawn(async move {
            while let Some(progress) = progress_rx.recv().await {
                let mut subs = subscriptions_clone
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                subs.retain(|_, subscription| {
                    !subscription.filter.matches(&progress)
                        || subscription.tx.send(progress.clone()).is_ok()
                });
            }
            info!("Progress channel closed, exiting");
        });
        Self {
            subscriptions,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn subscribe(&self, filter: SubscriptionFilter) -> tokio_mpsc::UnboundedReceiver<PlaybackProgress> {
        let (tx, rx) = tokio_mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, Subscription { filter, tx });
        rx
    }

    /// Every update. The subscription is removed when the receiver is dropped.
    pub fn subscribe_all(&self) -> tokio_mpsc::UnboundedReceiver<PlaybackProgress> {
        self.subscribe(SubscriptionFilter::All)
    }

    /// State snapshots, end-of-track and device errors
    pub fn subscribe_transport(&self) -> tokio_mpsc::UnboundedReceiver<PlaybackProgress> {
        self.subscribe(SubscriptionFilter::Transport)
    }

    /// Loading progress, waveforms and load failures
    pub fn subscribe_loading(&self) -> tokio_mpsc::UnboundedReceiver<PlaybackProgress> {
        self.subscribe(SubscriptionFilter::Loading)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> StateSnapshot {
        StateSnapshot {
            current_track: Some("a.flac".to_string()),
            current_time_seconds: 1.5,
            waiting_for_data: false,
            user_paused: false,
            playback_running: true,
            duration: 10.0,
            latency_seconds: 0.02,
        }
    }

    #[test]
    fn test_filters() {
        let state = PlaybackProgress::State(snapshot());
        let load = PlaybackProgress::LoadProgress {
            segment_progress: vec![1, 0],
        };
        assert!(SubscriptionFilter::All.matches(&state));
        assert!(SubscriptionFilter::Transport.matches(&state));
        assert!(!SubscriptionFilter::Transport.matches(&load));
        assert!(SubscriptionFilter::Loading.matches(&load));
        assert!(!SubscriptionFilter::Loading.matches(&state));
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let json = serde_json::to_value(PlaybackProgress::State(snapshot())).unwrap();
        assert_eq!(json["type"], "state");
        assert_eq!(json["currentTrack"], "a.flac");
        assert_eq!(json["waitingForData"], false);
        assert_eq!(json["latencySeconds"], 0.02);

        let json = serde_json::to_value(PlaybackProgress::LoadProgress {
            segment_progress: vec![1, 0, 1],
        })
        .unwrap();
        assert_eq!(json["segmentProgress"], serde_json::json!([1, 0, 1]));
    }

    #[tokio::test]
    async fn test_fan_out_to_subscribers() {
        let (tx, rx) = tokio_mpsc::unbounded_channel();
        let handle = PlaybackProgressHandle::new(rx, tokio::runtime::Handle::current());
        let mut all = handle.subscribe_all();
        let mut loading = handle.subscribe_loading();

        tx.send(PlaybackProgress::State(snapshot())).unwrap();
        tx.send(PlaybackProgress::LoadProgress {
            segment_progress: vec![1],
        })
        .unwrap();

        assert!(matches!(all.recv().await, Some(PlaybackProgress::State(_))));
        assert!(matches!(
            all.recv().await,
            Some(PlaybackProgress::LoadProgress { .. })
        ));
        assert!(matches!(
            loading.recv().await,
            Some(PlaybackProgress::LoadProgress { .. })
        ));
    }
}
