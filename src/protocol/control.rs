use bincode::{Decode, Encode};

/// Kind of announcement carried by a [`ControlMessage`].
#[derive(Debug, Clone, Copy, Encode, Decode, PartialEq, Eq)]
pub enum ControlAction {
    /// Side channel ports for the raw data of the preceding message.
    RawDataPorts,
    /// The peer failed to handle the preceding message.
    InternalError,
}

/// Where and how to connect for one raw data id.
#[derive(Debug, Clone, Copy, Encode, Decode, PartialEq, Eq)]
pub struct RawDataPort {
    pub id: i64,
    pub call_number: i64,
    pub port: u16,
}

/// In-band message sent right after a business message that referenced raw
/// data, or in place of a response when the server could not produce one.
#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct ControlMessage {
    pub action: ControlAction,
    pub ports: Vec<RawDataPort>,
    pub message: Option<String>,
}

impl ControlMessage {
    pub fn raw_data_ports(ports: Vec<RawDataPort>) -> Self {
        Self {
            action: ControlAction::RawDataPorts,
            ports,
            message: None,
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self {
            action: ControlAction::InternalError,
            ports: Vec::new(),
            message: Some(message.into()),
        }
    }

    pub fn port_for(&self, id: i64) -> Option<&RawDataPort> {
        self.ports.iter().find(|p| p.id == id)
    }
}
