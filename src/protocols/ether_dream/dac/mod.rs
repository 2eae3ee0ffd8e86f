//! Typed view of a single Ether Dream DAC and its reported status.

pub mod stream;

pub use self::stream::Stream;
use crate::protocols::ether_dream::protocol;
use bitflags::bitflags;
use std::error::Error;
use std::{fmt, ops};

/// A DAC along with its broadcasted MAC address.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Addressed {
    pub mac_address: MacAddress,
    pub dac: Dac,
}

/// Static capabilities of a DAC plus its latest status.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Dac {
    pub hw_revision: u16,
    pub sw_revision: u16,
    pub buffer_capacity: u16,
    pub max_point_rate: u32,
    pub status: Status,
}

/// The fixed-size array used to represent the MAC address of a DAC.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct MacAddress(pub [u8; 6]);

/// DAC status information.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub struct Status {
    pub protocol: u8,
    pub light_engine: LightEngine,
    pub playback: Playback,
    pub data_source: DataSource,
    pub light_engine_flags: LightEngineFlags,
    pub playback_flags: PlaybackFlags,
    pub buffer_fullness: u16,
    pub point_rate: u32,
    pub point_count: u32,
}

#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum LightEngine {
    Ready,
    Warmup,
    Cooldown,
    EmergencyStop,
}

#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum Playback {
    Idle,
    Prepared,
    Playing,
}

#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum DataSource {
    NetworkStreaming,
    IldaPlayback(IldaPlaybackFlags),
    InternalAbstractGenerator(InternalAbstractGeneratorFlags),
}

bitflags! {
    #[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
    pub struct LightEngineFlags: u16 {
        const EMERGENCY_STOP_PACKET_OR_INVALID_COMMAND = 0b00000001;
        const EMERGENCY_STOP_PROJECTOR_INPUT = 0b00000010;
        const EMERGENCY_STOP_PROJECTOR_INPUT_ACTIVE = 0b00000100;
        const EMERGENCY_STOP_OVER_TEMPERATURE = 0b00001000;
        const EMERGENCY_STOP_OVER_TEMPERATURE_ACTIVE = 0b00010000;
        const EMERGENCY_STOP_LOST_ETHERNET_LINK = 0b00100000;
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
    pub struct PlaybackFlags: u16 {
        const SHUTTER_OPEN = 0b00000001;
        const UNDERFLOWED = 0b00000010;
        const EMERGENCY_STOP = 0b00000100;
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
    pub struct IldaPlaybackFlags: u16 {
        const PLAYING = 0b0;
        const REPEAT = 0b1;
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
    pub struct InternalAbstractGeneratorFlags: u16 {
        const PLAYING = 0;
    }
}

/// A status field held a value the protocol does not define.
#[derive(Debug)]
pub enum ProtocolError {
    UnknownLightEngineState(u8),
    UnknownPlaybackState(u8),
    UnknownDataSource(u8),
}

impl Addressed {
    pub fn from_broadcast(dac_broadcast: &protocol::DacBroadcast) -> Result<Self, ProtocolError> {
        let protocol::DacBroadcast {
            mac_address,
            hw_revision,
            sw_revision,
            buffer_capacity,
            max_point_rate,
            dac_status,
        } = *dac_broadcast;
        let dac = Dac {
            hw_revision,
            sw_revision,
            buffer_capacity,
            max_point_rate,
            status: Status::from_protocol(&dac_status)?,
        };
        Ok(Addressed {
            mac_address: MacAddress(mac_address),
            dac,
        })
    }
}

impl Dac {
    pub fn update_status(&mut self, status: &protocol::DacStatus) -> Result<(), ProtocolError> {
        self.status = Status::from_protocol(status)?;
        Ok(())
    }
}

impl Status {
    pub fn from_protocol(status: &protocol::DacStatus) -> Result<Self, ProtocolError> {
        let light_engine = LightEngine::from_protocol(status.light_engine_state)
            .ok_or(ProtocolError::UnknownLightEngineState(status.light_engine_state))?;
        let playback = Playback::from_protocol(status.playback_state)
            .ok_or(ProtocolError::UnknownPlaybackState(status.playback_state))?;
        let data_source = DataSource::from_protocol(status.source, status.source_flags)
            .ok_or(ProtocolError::UnknownDataSource(status.source))?;
        Ok(Status {
            protocol: status.protocol,
            light_engine,
            playback,
            data_source,
            light_engine_flags: LightEngineFlags::from_bits_truncate(status.light_engine_flags),
            playback_flags: PlaybackFlags::from_bits_truncate(status.playback_flags),
            buffer_fullness: status.buffer_fullness,
            point_rate: status.point_rate,
            point_count: status.point_count,
        })
    }

    pub fn to_protocol(&self) -> protocol::DacStatus {
        let (source, source_flags) = self.data_source.to_protocol();
        protocol::DacStatus {
            protocol: self.protocol,
            light_engine_state: self.light_engine.to_protocol(),
            playback_state: self.playback.to_protocol(),
            source,
            light_engine_flags: self.light_engine_flags.bits(),
            playback_flags: self.playback_flags.bits(),
            source_flags,
            buffer_fullness: self.buffer_fullness,
            point_rate: self.point_rate,
            point_count: self.point_count,
        }
    }

    /// True once the device needs `prepare` before it will accept data again.
    pub fn needs_prepare(&self) -> bool {
        self.playback == Playback::Idle
    }
}

impl LightEngine {
    pub fn from_protocol(state: u8) -> Option<Self> {
        Some(match state {
            protocol::DacStatus::LIGHT_ENGINE_READY => LightEngine::Ready,
            protocol::DacStatus::LIGHT_ENGINE_WARMUP => LightEngine::Warmup,
            protocol::DacStatus::LIGHT_ENGINE_COOLDOWN => LightEngine::Cooldown,
            protocol::DacStatus::LIGHT_ENGINE_EMERGENCY_STOP => LightEngine::EmergencyStop,
            _ => return None,
        })
    }

    pub fn to_protocol(&self) -> u8 {
        match *self {
            LightEngine::Ready => protocol::DacStatus::LIGHT_ENGINE_READY,
            LightEngine::Warmup => protocol::DacStatus::LIGHT_ENGINE_WARMUP,
            LightEngine::Cooldown => protocol::DacStatus::LIGHT_ENGINE_COOLDOWN,
            LightEngine::EmergencyStop => protocol::DacStatus::LIGHT_ENGINE_EMERGENCY_STOP,
        }
    }
}

impl Playback {
    pub fn from_protocol(state: u8) -> Option<Self> {
        Some(match state {
            protocol::DacStatus::PLAYBACK_IDLE => Playback::Idle,
            protocol::DacStatus::PLAYBACK_PREPARED => Playback::Prepared,
            protocol::DacStatus::PLAYBACK_PLAYING => Playback::Playing,
            _ => return None,
        })
    }

    pub fn to_protocol(&self) -> u8 {
        match *self {
            Playback::Idle => protocol::DacStatus::PLAYBACK_IDLE,
            Playback::Prepared => protocol::DacStatus::PLAYBACK_PREPARED,
            Playback::Playing => protocol::DacStatus::PLAYBACK_PLAYING,
        }
    }
}

impl DataSource {
    pub fn from_protocol(source: u8, flags: u16) -> Option<Self> {
        Some(match source {
            protocol::DacStatus::SOURCE_NETWORK_STREAMING => DataSource::NetworkStreaming,
            protocol::DacStatus::SOURCE_ILDA_PLAYBACK_SD => {
                DataSource::IldaPlayback(IldaPlaybackFlags::from_bits_truncate(flags))
            }
            protocol::DacStatus::SOURCE_INTERNAL_ABSTRACT_GENERATOR => {
                DataSource::InternalAbstractGenerator(
                    InternalAbstractGeneratorFlags::from_bits_truncate(flags),
                )
            }
            _ => return None,
        })
    }

    pub fn to_protocol(&self) -> (u8, u16) {
        match *self {
            DataSource::NetworkStreaming => (protocol::DacStatus::SOURCE_NETWORK_STREAMING, 0),
            DataSource::IldaPlayback(ref flags) => {
                (protocol::DacStatus::SOURCE_ILDA_PLAYBACK_SD, flags.bits())
            }
            DataSource::InternalAbstractGenerator(ref flags) => (
                protocol::DacStatus::SOURCE_INTERNAL_ABSTRACT_GENERATOR,
                flags.bits(),
            ),
        }
    }
}

impl ops::Deref for Addressed {
    type Target = Dac;
    fn deref(&self) -> &Self::Target {
        &self.dac
    }
}

impl ops::DerefMut for Addressed {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.dac
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(bytes: [u8; 6]) -> Self {
        MacAddress(bytes)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let a = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a[0], a[1], a[2], a[3], a[4], a[5]
        )
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ProtocolError::UnknownLightEngineState(v) => {
                write!(f, "unknown light engine state {}", v)
            }
            ProtocolError::UnknownPlaybackState(v) => write!(f, "unknown playback state {}", v),
            ProtocolError::UnknownDataSource(v) => write!(f, "unknown data source {}", v),
        }
    }
}

impl Error for ProtocolError {}
