// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Envelope wire codec
//!
//! Frames are bincode-encoded [`Envelope`]s. The version is the first field,
//! so it occupies the first two bytes (little-endian) of every frame and is
//! checked before the body is decoded.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::command::Command;
use crate::error::{IpcError, Result};
use crate::role::Role;

pub const WIRE_VERSION: u16 = 1;

/// Who sent an envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Source {
    Manager(Role),
    Orchestrator,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Manager(role) => write!(f, "{}", role),
            Source::Orchestrator => f.write_str("orchestrator"),
        }
    }
}

/// Resolved destination of a command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Delivery {
    Direct(Role),
    Broadcast,
    Local,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u16,
    pub source: Source,
    pub destination: Delivery,
    pub payload: Command,
}

impl Envelope {
    pub fn new(source: Source, destination: Delivery, payload: Command) -> Self {
        Self {
            version: WIRE_VERSION,
            source,
            destination,
            payload,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        let found = peek_version(frame)?;
        if found != WIRE_VERSION {
            return Err(IpcError::VersionMismatch {
                expected: WIRE_VERSION,
                found,
            });
        }
        Ok(bincode::deserialize(frame)?)
    }
}

fn peek_version(frame: &[u8]) -> Result<u16> {
    match frame {
        [lo, hi, ..] => Ok(u16::from_le_bytes([*lo, *hi])),
        _ => Err(IpcError::Codec(format!("frame of {} bytes has no version", frame.len()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{BeadMove, ScriptStep};
    use scopelink_config::ScopeConfig;

    #[test]
    fn test_envelope_round_trip() {
        let envelope = Envelope::new(
            Source::Manager(Role::LockController),
            Delivery::Direct(Role::Presentation),
            Command::MoveBeads {
                moves: vec![BeadMove { bead_id: 3, dx: 2.0, dy: -0.2 }],
            },
        );
        let frame = envelope.encode().unwrap();
        assert_eq!(&frame[..2], &WIRE_VERSION.to_le_bytes());
        assert_eq!(Envelope::decode(&frame).unwrap(), envelope);
    }

    #[test]
    fn test_nested_payloads_survive_encoding() {
        let envelope = Envelope::new(
            Source::Orchestrator,
            Delivery::Broadcast,
            Command::SetConfig { config: Box::new(ScopeConfig::default()) },
        );
        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded, envelope);

        let script = Envelope::new(
            Source::Manager(Role::Presentation),
            Delivery::Direct(Role::Scripting),
            Command::LoadScript { steps: vec![ScriptStep::waiting(Command::Sleep { seconds: 1.0 })] },
        );
        assert_eq!(Envelope::decode(&script.encode().unwrap()).unwrap(), script);
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mut envelope = Envelope::new(Source::Orchestrator, Delivery::Broadcast, Command::Quit);
        envelope.version = WIRE_VERSION + 1;
        let frame = envelope.encode().unwrap();
        assert_eq!(
            Envelope::decode(&frame),
            Err(IpcError::VersionMismatch {
                expected: WIRE_VERSION,
                found: WIRE_VERSION + 1
            })
        );
    }

    #[test]
    fn test_short_and_garbage_frames_rejected() {
        assert!(matches!(Envelope::decode(&[1]), Err(IpcError::Codec(_))));
        let mut garbage = WIRE_VERSION.to_le_bytes().to_vec();
        garbage.extend_from_slice(&[0xff; 3]);
        assert!(matches!(Envelope::decode(&garbage), Err(IpcError::Codec(_))));
    }
}
