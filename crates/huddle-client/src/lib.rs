//! Huddle room client
//!
//! Joins a mediasoup-style room over a protoo signaling connection, keeps
//! track of who is in the room and what they are sending, and hands media
//! negotiation to a pluggable [`media::MediaEngine`].

pub mod config;
pub mod dispatch;
pub mod error;
pub mod media;
pub mod network;
pub mod room;
pub mod state;

pub use config::ClientSettings;
pub use error::{DeviceError, SessionError, SignalingError};
pub use room::{JoinOptions, JoinParams, RoomClient, RoomState};
pub use state::{Participant, RemoteTrack, RoomEvent};
