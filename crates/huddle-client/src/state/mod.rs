mod events;
mod participants;

pub use events::RoomEvent;
pub use participants::{Participant, ParticipantRegistry, RemoteTrack};
