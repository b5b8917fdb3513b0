use chrono::{DateTime, Utc};
use huddle_protocol::{ConsumerScore, DeviceInfo, MediaKind, PeerInfo};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::events::RoomEvent;
use crate::dispatch::ObserverHub;

/// Snapshot of one remote track, keyed by consumer id
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteTrack {
    pub consumer_id: String,
    pub producer_id: String,
    pub peer_id: String,
    pub kind: MediaKind,
    /// simple, simulcast or svc
    pub consumer_type: String,
    /// Paused on our side
    pub paused: bool,
    /// Paused by the sending peer
    pub producer_paused: bool,
    pub score: Option<ConsumerScore>,
    pub spatial_layer: Option<i32>,
    pub temporal_layer: Option<i32>,
}

impl RemoteTrack {
    pub fn is_flowing(&self) -> bool {
        !self.paused && !self.producer_paused
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    pub peer_id: String,
    pub display_name: String,
    pub device: Option<DeviceInfo>,
    /// Current active speaker
    pub active: bool,
    pub audio_muted: bool,
    pub video_muted: bool,
    /// Last reported speaking volume
    pub volume: Option<i32>,
    pub joined_at: DateTime<Utc>,
    pub audio_tracks: BTreeMap<String, RemoteTrack>,
    pub video_tracks: BTreeMap<String, RemoteTrack>,
}

impl Participant {
    fn new(info: PeerInfo) -> Self {
        Self {
            peer_id: info.id,
            display_name: info.display_name,
            device: info.device,
            active: false,
            audio_muted: true,
            video_muted: true,
            volume: None,
            joined_at: Utc::now(),
            audio_tracks: BTreeMap::new(),
            video_tracks: BTreeMap::new(),
        }
    }

    fn tracks_mut(&mut self, kind: MediaKind) -> &mut BTreeMap<String, RemoteTrack> {
        match kind {
            MediaKind::Audio => &mut self.audio_tracks,
            MediaKind::Video => &mut self.video_tracks,
        }
    }

    pub fn tracks(&self, kind: MediaKind) -> &BTreeMap<String, RemoteTrack> {
        match kind {
            MediaKind::Audio => &self.audio_tracks,
            MediaKind::Video => &self.video_tracks,
        }
    }

    /// Muted when there is no track of this kind or none of them flows
    fn derive_muted(&self, kind: MediaKind) -> bool {
        !self.tracks(kind).values().any(RemoteTrack::is_flowing)
    }

    /// Recompute mute flags, recording an event for each one that flipped
    fn refresh_mute(&mut self, events: &mut Vec<RoomEvent>) {
        let audio = self.derive_muted(MediaKind::Audio);
        if audio != self.audio_muted {
            self.audio_muted = audio;
            events.push(RoomEvent::AudioStateChanged {
                peer_id: self.peer_id.clone(),
                muted: audio,
            });
        }

        let video = self.derive_muted(MediaKind::Video);
        if video != self.video_muted {
            self.video_muted = video;
            events.push(RoomEvent::VideoStateChanged {
                peer_id: self.peer_id.clone(),
                muted: video,
            });
        }
    }
}

#[derive(Default)]
struct Registry {
    peers: HashMap<String, Participant>,
    /// consumer id -> (peer id, kind)
    tracks: HashMap<String, (String, MediaKind)>,
    active_speaker: Option<String>,
}

impl Registry {
    fn track_mut(&mut self, consumer_id: &str) -> Option<(&mut Participant, MediaKind)> {
        let (peer_id, kind) = self.tracks.get(consumer_id)?;
        let kind = *kind;
        let participant = self.peers.get_mut(peer_id)?;
        Some((participant, kind))
    }
}

/// Remote peers and their tracks
///
/// Every externally visible change produces exactly one event on the room
/// hub. Events are published after the registry lock is released.
pub struct ParticipantRegistry {
    state: Mutex<Registry>,
    events: Arc<ObserverHub<RoomEvent>>,
}

impl ParticipantRegistry {
    pub fn new(events: Arc<ObserverHub<RoomEvent>>) -> Self {
        Self {
            state: Mutex::new(Registry::default()),
            events,
        }
    }

    fn publish(&self, events: Vec<RoomEvent>) {
        for event in events {
            self.events.notify(event);
        }
    }

    /// Returns false if the peer is already known
    pub fn add_peer(&self, info: PeerInfo) -> bool {
        let participant = {
            let mut state = self.state.lock();
            if state.peers.contains_key(&info.id) {
                return false;
            }
            let participant = Participant::new(info);
            state
                .peers
                .insert(participant.peer_id.clone(), participant.clone());
            participant
        };

        tracing::info!(
            peer_id = %participant.peer_id,
            display_name = %participant.display_name,
            "Participant joined"
        );
        self.publish(vec![RoomEvent::ParticipantJoined(participant)]);
        true
    }

    /// Add every peer of a join response; known peers are skipped
    pub fn set_peers(&self, peers: Vec<PeerInfo>) -> usize {
        peers.into_iter().filter(|p| self.add_peer(p.clone())).count()
    }

    /// Drop a peer and its tracks. Unknown ids are ignored.
    pub fn remove_peer(&self, peer_id: &str) -> bool {
        let events = {
            let mut state = self.state.lock();
            let Some(participant) = state.peers.remove(peer_id) else {
                return false;
            };

            let mut events = Vec::new();
            for track in participant
                .audio_tracks
                .into_values()
                .chain(participant.video_tracks.into_values())
            {
                state.tracks.remove(&track.consumer_id);
                events.push(RoomEvent::TrackRemoved(track));
            }
            if state.active_speaker.as_deref() == Some(peer_id) {
                state.active_speaker = None;
            }
            events.push(RoomEvent::ParticipantLeft {
                peer_id: peer_id.to_string(),
            });
            events
        };

        tracing::info!(peer_id, "Participant left");
        self.publish(events);
        true
    }

    pub fn change_display_name(&self, peer_id: &str, display_name: &str) -> bool {
        let event = {
            let mut state = self.state.lock();
            let Some(participant) = state.peers.get_mut(peer_id) else {
                return false;
            };
            if participant.display_name == display_name {
                return false;
            }
            let old = std::mem::replace(&mut participant.display_name, display_name.to_string());
            RoomEvent::DisplayNameChanged {
                peer_id: peer_id.to_string(),
                display_name: display_name.to_string(),
                old_display_name: old,
            }
        };

        self.publish(vec![event]);
        true
    }

    /// Attach a consumed track to its peer
    pub fn add_track(&self, track: RemoteTrack) -> bool {
        let events = {
            let mut state = self.state.lock();
            if state.tracks.contains_key(&track.consumer_id) {
                return false;
            }
            let Some(participant) = state.peers.get_mut(&track.peer_id) else {
                tracing::warn!(
                    peer_id = %track.peer_id,
                    consumer_id = %track.consumer_id,
                    "Track for unknown peer"
                );
                return false;
            };

            participant
                .tracks_mut(track.kind)
                .insert(track.consumer_id.clone(), track.clone());
            let mut events = vec![RoomEvent::TrackCreated(track.clone())];
            participant.refresh_mute(&mut events);
            state
                .tracks
                .insert(track.consumer_id.clone(), (track.peer_id.clone(), track.kind));
            events
        };

        self.publish(events);
        true
    }

    pub fn remove_track(&self, consumer_id: &str) -> Option<RemoteTrack> {
        let (track, events) = {
            let mut state = self.state.lock();
            let (participant, kind) = state.track_mut(consumer_id)?;
            let track = participant.tracks_mut(kind).remove(consumer_id)?;
            let mut events = vec![RoomEvent::TrackRemoved(track.clone())];
            participant.refresh_mute(&mut events);
            state.tracks.remove(consumer_id);
            (track, events)
        };

        self.publish(events);
        Some(track)
    }

    fn update_track(
        &self,
        consumer_id: &str,
        update: impl FnOnce(&mut RemoteTrack) -> Option<RoomEvent>,
    ) -> bool {
        let events = {
            let mut state = self.state.lock();
            let Some((participant, kind)) = state.track_mut(consumer_id) else {
                return false;
            };
            let Some(track) = participant.tracks_mut(kind).get_mut(consumer_id) else {
                return false;
            };
            let mut events: Vec<RoomEvent> = update(track).into_iter().collect();
            participant.refresh_mute(&mut events);
            events
        };

        self.publish(events);
        true
    }

    /// The sending peer paused or resumed its producer
    pub fn set_producer_paused(&self, consumer_id: &str, paused: bool) -> bool {
        self.update_track(consumer_id, |track| {
            if track.producer_paused == paused {
                return None;
            }
            track.producer_paused = paused;
            Some(paused_event(track))
        })
    }

    /// We paused or resumed our consumer
    pub fn set_track_paused(&self, consumer_id: &str, paused: bool) -> bool {
        self.update_track(consumer_id, |track| {
            if track.paused == paused {
                return None;
            }
            track.paused = paused;
            Some(paused_event(track))
        })
    }

    pub fn set_track_score(&self, consumer_id: &str, score: ConsumerScore) -> bool {
        self.update_track(consumer_id, |track| {
            track.score = Some(score.clone());
            Some(RoomEvent::ConsumerScore {
                peer_id: track.peer_id.clone(),
                consumer_id: track.consumer_id.clone(),
                score,
            })
        })
    }

    pub fn set_track_layers(
        &self,
        consumer_id: &str,
        spatial_layer: Option<i32>,
        temporal_layer: Option<i32>,
    ) -> bool {
        self.update_track(consumer_id, |track| {
            track.spatial_layer = spatial_layer;
            track.temporal_layer = temporal_layer;
            Some(RoomEvent::LayersChanged {
                consumer_id: track.consumer_id.clone(),
                spatial_layer,
                temporal_layer,
            })
        })
    }

    /// Mark `peer_id` as the active speaker, or nobody when `None`.
    /// Unknown peers are ignored.
    pub fn set_active_speaker(&self, peer_id: Option<&str>, volume: Option<i32>) -> bool {
        {
            let mut state = self.state.lock();
            if let Some(id) = peer_id {
                if !state.peers.contains_key(id) {
                    tracing::debug!(peer_id = %id, "Active speaker is not in the room");
                    return false;
                }
            }

            if let Some(previous) = state.active_speaker.take() {
                if let Some(p) = state.peers.get_mut(&previous) {
                    p.active = false;
                }
            }
            if let Some(p) = peer_id.and_then(|id| state.peers.get_mut(id)) {
                p.active = true;
                if volume.is_some() {
                    p.volume = volume;
                }
            }
            state.active_speaker = peer_id.map(str::to_string);
        }

        self.publish(vec![RoomEvent::ActiveSpeaker {
            peer_id: peer_id.map(str::to_string),
            volume,
        }]);
        true
    }

    /// Remove everyone, one leave event per peer
    pub fn clear(&self) -> usize {
        let peer_ids: Vec<String> = {
            let mut state = self.state.lock();
            state.tracks.clear();
            state.active_speaker = None;
            state.peers.drain().map(|(id, _)| id).collect()
        };

        let count = peer_ids.len();
        self.publish(
            peer_ids
                .into_iter()
                .map(|peer_id| RoomEvent::ParticipantLeft { peer_id })
                .collect(),
        );
        count
    }

    pub fn get(&self, peer_id: &str) -> Option<Participant> {
        self.state.lock().peers.get(peer_id).cloned()
    }

    /// All participants, oldest first
    pub fn participants(&self) -> Vec<Participant> {
        let mut participants: Vec<Participant> =
            self.state.lock().peers.values().cloned().collect();
        participants.sort_by(|a, b| {
            a.joined_at
                .cmp(&b.joined_at)
                .then_with(|| a.peer_id.cmp(&b.peer_id))
        });
        participants
    }

    pub fn len(&self) -> usize {
        self.state.lock().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn speaking_volume(&self, peer_id: &str) -> Option<i32> {
        self.state.lock().peers.get(peer_id).and_then(|p| p.volume)
    }

    pub fn active_speaker(&self) -> Option<String> {
        self.state.lock().active_speaker.clone()
    }

    pub fn find_track(&self, consumer_id: &str) -> Option<RemoteTrack> {
        let mut state = self.state.lock();
        let (participant, kind) = state.track_mut(consumer_id)?;
        participant.tracks(kind).get(consumer_id).cloned()
    }
}

fn paused_event(track: &RemoteTrack) -> RoomEvent {
    RoomEvent::TrackPaused {
        peer_id: track.peer_id.clone(),
        consumer_id: track.consumer_id.clone(),
        paused: track.paused,
        producer_paused: track.producer_paused,
    }
}
