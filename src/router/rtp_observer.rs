//! RTP observers: audio level reporting and dominant speaker detection.
//!
//! Observers never touch media; they consume the ssrc-audio-level header
//! extension value carried by audio packets the router fans out to them.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::channel::registrator::ChannelRequestHandler;
use crate::channel::Shared;
use crate::error::{Error, Result};
use crate::message::{ChannelRequest, Method};

pub enum RtpObserverKind {
    /// Periodic `volumes` / `silence` notifications.
    AudioLevel {
        max_entries: usize,
        /// dBov threshold below which a producer counts as audible.
        threshold: i8,
        interval: Duration,
    },
    /// `dominantspeaker` notifications on speaker change.
    ActiveSpeaker { interval: Duration },
}

struct LevelWindow {
    /// Sum of dBov magnitudes and sample count since the last tick.
    sum: u64,
    count: u64,
    last_seen: Instant,
}

pub struct RtpObserver {
    id: String,
    kind: RtpObserverKind,
    paused: AtomicBool,
    closed: AtomicBool,
    producer_ids: Mutex<HashSet<String>>,
    levels: Mutex<HashMap<String, LevelWindow>>,
    dominant: Mutex<Option<String>>,
    shared: Arc<Shared>,
}

impl RtpObserver {
    pub(crate) fn new(
        id: String,
        kind: RtpObserverKind,
        shared: Arc<Shared>,
    ) -> Result<Arc<RtpObserver>> {
        let interval = match &kind {
            RtpObserverKind::AudioLevel { interval, .. } => *interval,
            RtpObserverKind::ActiveSpeaker { interval } => *interval,
        };

        let observer = Arc::new(RtpObserver {
            id: id.clone(),
            kind,
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            producer_ids: Mutex::new(HashSet::new()),
            levels: Mutex::new(HashMap::new()),
            dominant: Mutex::new(None),
            shared: Arc::clone(&shared),
        });

        shared.registrator.register(
            &id,
            Arc::downgrade(&observer) as Weak<dyn ChannelRequestHandler>,
            None,
            None,
        )?;

        tokio::spawn(tick(Arc::downgrade(&observer), interval));

        Ok(observer)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub(crate) fn watches(&self, producer_id: &str) -> bool {
        self.producer_ids.lock().unwrap().contains(producer_id)
    }

    /// Audio level sample from a fanned-out packet, `dbov` in 0..=127
    /// (larger means quieter).
    pub(crate) fn receive_audio_level(&self, producer_id: &str, dbov: u8) {
        if self.paused() || self.closed() || !self.watches(producer_id) {
            return;
        }

        let mut levels = self.levels.lock().unwrap();
        let window = levels.entry(producer_id.to_string()).or_insert(LevelWindow {
            sum: 0,
            count: 0,
            last_seen: Instant::now(),
        });
        window.sum += u64::from(dbov);
        window.count += 1;
        window.last_seen = Instant::now();
    }

    pub(crate) fn producer_removed(&self, producer_id: &str) {
        self.producer_ids.lock().unwrap().remove(producer_id);
        self.levels.lock().unwrap().remove(producer_id);
    }

    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.registrator.unregister(&self.id);
    }

    fn on_tick(&self) {
        if self.paused() {
            return;
        }

        // Drain the window: (producerId, average dBov).
        let averages: Vec<(String, u8)> = {
            let mut levels = self.levels.lock().unwrap();
            let out = levels
                .iter()
                .filter(|(_, w)| w.count > 0)
                .map(|(id, w)| (id.clone(), (w.sum / w.count) as u8))
                .collect();
            levels.clear();
            out
        };

        match &self.kind {
            RtpObserverKind::AudioLevel {
                max_entries,
                threshold,
                ..
            } => {
                let mut audible: Vec<(String, i16)> = averages
                    .iter()
                    .map(|(id, dbov)| (id.clone(), -i16::from(*dbov)))
                    .filter(|(_, volume)| *volume >= i16::from(*threshold))
                    .collect();

                if audible.is_empty() {
                    self.shared.notifier.emit(&self.id, "silence");
                    return;
                }

                // Loudest first.
                audible.sort_by_key(|(_, volume)| std::cmp::Reverse(*volume));
                audible.truncate(*max_entries);

                let entries: Vec<Value> = audible
                    .into_iter()
                    .map(|(id, volume)| json!({ "producerId": id, "volume": volume }))
                    .collect();
                self.shared
                    .notifier
                    .emit_with_data(&self.id, "volumes", json!(entries));
            }
            RtpObserverKind::ActiveSpeaker { .. } => {
                let Some((loudest, _)) = averages.iter().min_by_key(|(_, dbov)| *dbov) else {
                    return;
                };

                let mut dominant = self.dominant.lock().unwrap();
                if dominant.as_deref() != Some(loudest.as_str()) {
                    *dominant = Some(loudest.clone());
                    self.shared.notifier.emit_with_data(
                        &self.id,
                        "dominantspeaker",
                        json!({ "producerId": loudest }),
                    );
                }
            }
        }
    }
}

#[async_trait]
impl ChannelRequestHandler for RtpObserver {
    async fn handle_channel_request(&self, request: &ChannelRequest) -> Result<Option<Value>> {
        if self.closed() {
            return Err(Error::ErrClosed("RtpObserver"));
        }

        match request.method {
            Method::RtpObserverPause => {
                self.paused.store(true, Ordering::SeqCst);
                Ok(None)
            }
            Method::RtpObserverResume => {
                self.paused.store(false, Ordering::SeqCst);
                Ok(None)
            }
            Method::RtpObserverAddProducer => {
                let producer_id = crate::transport::parse_id_field(&request.data, "producerId")?;
                self.producer_ids.lock().unwrap().insert(producer_id);
                Ok(None)
            }
            Method::RtpObserverRemoveProducer => {
                let producer_id = crate::transport::parse_id_field(&request.data, "producerId")?;
                self.producer_removed(&producer_id);
                Ok(None)
            }
            _ => Err(Error::type_error(format!(
                "unknown method \"{}\" for an RtpObserver",
                request.method
            ))),
        }
    }
}

async fn tick(observer: Weak<RtpObserver>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let Some(observer) = observer.upgrade() else {
            return;
        };
        if observer.closed() {
            return;
        }
        observer.on_tick();
    }
}
