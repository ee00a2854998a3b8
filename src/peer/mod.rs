//! Media endpoints and local/remote stream types

pub mod connection;
pub mod media;

pub use connection::{
    EndpointEvent, EndpointFactory, EndpointState, MediaEndpoint, RtcEndpoint, RtcEndpointFactory,
};
pub use media::{LocalStream, MediaSource, RemoteStream, SampleMediaSource, StaticMediaSource};
