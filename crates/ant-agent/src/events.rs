//! Controller events received on the stream

use ant_proto::stream_response::Event;
use ant_proto::StreamResponse;

/// An inbound stream message, classified
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControllerEvent {
    /// marabunta asks for a status report
    Ping { message: String },
    /// Liveness notice, nothing to do
    Pulse { message: String },
    /// A variant this agent doesn't know (newer controller)
    Unknown { raw: String },
}

impl ControllerEvent {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ControllerEvent::Ping { .. } => "ping",
            ControllerEvent::Pulse { .. } => "pulse",
            ControllerEvent::Unknown { .. } => "unknown",
        }
    }
}

impl From<StreamResponse> for ControllerEvent {
    fn from(response: StreamResponse) -> Self {
        match response.event {
            Some(Event::EPing(ping)) => ControllerEvent::Ping { message: ping.msg },
            Some(Event::EPulse(pulse)) => ControllerEvent::Pulse { message: pulse.msg },
            // Unset oneof, or a field number added after this build
            None => ControllerEvent::Unknown {
                raw: format!("{:?}", response),
            },
        }
    }
}
