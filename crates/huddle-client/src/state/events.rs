use huddle_protocol::{ConsumerScore, MediaKind, ProducerScoreEntry};

use super::participants::{Participant, RemoteTrack};
use crate::room::RoomState;

/// Everything observers of a room can be told about
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    RoomStateChanged(RoomState),

    ParticipantJoined(Participant),

    ParticipantLeft {
        peer_id: String,
    },

    DisplayNameChanged {
        peer_id: String,
        display_name: String,
        old_display_name: String,
    },

    TrackCreated(RemoteTrack),

    TrackRemoved(RemoteTrack),

    /// Our consumer or the sender's producer of a track was paused or resumed
    TrackPaused {
        peer_id: String,
        consumer_id: String,
        paused: bool,
        producer_paused: bool,
    },

    AudioStateChanged {
        peer_id: String,
        muted: bool,
    },

    VideoStateChanged {
        peer_id: String,
        muted: bool,
    },

    /// `peer_id` is `None` when nobody is speaking
    ActiveSpeaker {
        peer_id: Option<String>,
        volume: Option<i32>,
    },

    /// A local producer appeared, paused, resumed or went away
    LocalTrackChanged {
        kind: MediaKind,
        producer_id: Option<String>,
        paused: bool,
    },

    ProducerScore {
        producer_id: String,
        score: Vec<ProducerScoreEntry>,
    },

    ConsumerScore {
        peer_id: String,
        consumer_id: String,
        score: ConsumerScore,
    },

    LayersChanged {
        consumer_id: String,
        spatial_layer: Option<i32>,
        temporal_layer: Option<i32>,
    },
}

impl RoomEvent {
    /// Peer the event is about, if any
    pub fn peer_id(&self) -> Option<&str> {
        match self {
            RoomEvent::ParticipantJoined(p) => Some(&p.peer_id),
            RoomEvent::ParticipantLeft { peer_id }
            | RoomEvent::DisplayNameChanged { peer_id, .. }
            | RoomEvent::AudioStateChanged { peer_id, .. }
            | RoomEvent::VideoStateChanged { peer_id, .. }
            | RoomEvent::TrackPaused { peer_id, .. }
            | RoomEvent::ConsumerScore { peer_id, .. } => Some(peer_id),
            RoomEvent::TrackCreated(t) | RoomEvent::TrackRemoved(t) => Some(&t.peer_id),
            RoomEvent::ActiveSpeaker { peer_id, .. } => peer_id.as_deref(),
            _ => None,
        }
    }
}
