//! Wire types and constants of the Ether Dream protocol.
//!
//! All multi-byte fields are little-endian.

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use std::io;

use crate::types::ChannelPoint;

pub use self::command::Command;

/// Communication with the DAC happens over TCP on port 7765.
pub const COMMUNICATION_PORT: u16 = 7765;

/// The DAC sends UDP broadcast messages on port 7654.
pub const BROADCAST_PORT: u16 = 7654;

/// A trait for writing any of the Ether Dream protocol types to little-endian bytes.
pub trait WriteBytes {
    fn write_bytes<P: WriteToBytes>(&mut self, protocol: P) -> io::Result<()>;
}

/// A trait for reading any of the Ether Dream protocol types from little-endian bytes.
pub trait ReadBytes {
    fn read_bytes<P: ReadFromBytes>(&mut self) -> io::Result<P>;
}

/// Protocol types that may be written to little endian bytes.
pub trait WriteToBytes {
    fn write_to_bytes<W: WriteBytesExt>(&self, writer: W) -> io::Result<()>;
}

/// Protocol types that may be read from little endian bytes.
pub trait ReadFromBytes: Sized {
    fn read_from_bytes<R: ReadBytesExt>(reader: R) -> io::Result<Self>;
}

/// Types that have a constant size when written to or read from bytes.
pub trait SizeBytes {
    const SIZE_BYTES: usize;
}

/// Periodically, and as part of ACK packets, the DAC sends its current playback status.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct DacStatus {
    pub protocol: u8,
    pub light_engine_state: u8,
    pub playback_state: u8,
    pub source: u8,
    pub light_engine_flags: u16,
    pub playback_flags: u16,
    pub source_flags: u16,
    pub buffer_fullness: u16,
    pub point_rate: u32,
    pub point_count: u32,
}

/// Each DAC broadcasts a status/ID datagram over UDP once per second.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct DacBroadcast {
    pub mac_address: [u8; 6],
    pub hw_revision: u16,
    pub sw_revision: u16,
    pub buffer_capacity: u16,
    pub max_point_rate: u32,
    pub dac_status: DacStatus,
}

/// A single point as it travels on the wire.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct DacPoint {
    pub control: u16,
    pub x: i16,
    pub y: i16,
    pub r: u16,
    pub g: u16,
    pub b: u16,
    pub i: u16,
    pub u1: u16,
    pub u2: u16,
}

/// A response from a DAC.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct DacResponse {
    pub response: u8,
    pub command: u8,
    pub dac_status: DacStatus,
}

impl DacStatus {
    pub const LIGHT_ENGINE_READY: u8 = 0;
    pub const LIGHT_ENGINE_WARMUP: u8 = 1;
    pub const LIGHT_ENGINE_COOLDOWN: u8 = 2;
    pub const LIGHT_ENGINE_EMERGENCY_STOP: u8 = 3;

    pub const PLAYBACK_IDLE: u8 = 0;
    pub const PLAYBACK_PREPARED: u8 = 1;
    pub const PLAYBACK_PLAYING: u8 = 2;

    pub const SOURCE_NETWORK_STREAMING: u8 = 0;
    pub const SOURCE_ILDA_PLAYBACK_SD: u8 = 1;
    pub const SOURCE_INTERNAL_ABSTRACT_GENERATOR: u8 = 2;
}

impl DacResponse {
    pub const ACK: u8 = 0x61;
    pub const NAK_FULL: u8 = 0x46;
    pub const NAK_INVALID: u8 = 0x49;
    pub const NAK_STOP_CONDITION: u8 = 0x21;
}

impl DacPoint {
    /// Marks the point at which a queued point-rate change takes effect.
    pub const CONTROL_CHANGE_RATE: u16 = 0x8000;
}

impl WriteToBytes for DacStatus {
    fn write_to_bytes<W: WriteBytesExt>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u8(self.protocol)?;
        writer.write_u8(self.light_engine_state)?;
        writer.write_u8(self.playback_state)?;
        writer.write_u8(self.source)?;
        writer.write_u16::<LE>(self.light_engine_flags)?;
        writer.write_u16::<LE>(self.playback_flags)?;
        writer.write_u16::<LE>(self.source_flags)?;
        writer.write_u16::<LE>(self.buffer_fullness)?;
        writer.write_u32::<LE>(self.point_rate)?;
        writer.write_u32::<LE>(self.point_count)?;
        Ok(())
    }
}

impl WriteToBytes for DacBroadcast {
    fn write_to_bytes<W: WriteBytesExt>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(&self.mac_address)?;
        writer.write_u16::<LE>(self.hw_revision)?;
        writer.write_u16::<LE>(self.sw_revision)?;
        writer.write_u16::<LE>(self.buffer_capacity)?;
        writer.write_u32::<LE>(self.max_point_rate)?;
        writer.write_bytes(self.dac_status)?;
        Ok(())
    }
}

impl WriteToBytes for DacPoint {
    fn write_to_bytes<W: WriteBytesExt>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u16::<LE>(self.control)?;
        writer.write_i16::<LE>(self.x)?;
        writer.write_i16::<LE>(self.y)?;
        for channel in [self.r, self.g, self.b, self.i, self.u1, self.u2] {
            writer.write_u16::<LE>(channel)?;
        }
        Ok(())
    }
}

impl WriteToBytes for DacResponse {
    fn write_to_bytes<W: WriteBytesExt>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u8(self.response)?;
        writer.write_u8(self.command)?;
        writer.write_bytes(self.dac_status)?;
        Ok(())
    }
}

impl ReadFromBytes for DacStatus {
    fn read_from_bytes<R: ReadBytesExt>(mut reader: R) -> io::Result<Self> {
        Ok(DacStatus {
            protocol: reader.read_u8()?,
            light_engine_state: reader.read_u8()?,
            playback_state: reader.read_u8()?,
            source: reader.read_u8()?,
            light_engine_flags: reader.read_u16::<LE>()?,
            playback_flags: reader.read_u16::<LE>()?,
            source_flags: reader.read_u16::<LE>()?,
            buffer_fullness: reader.read_u16::<LE>()?,
            point_rate: reader.read_u32::<LE>()?,
            point_count: reader.read_u32::<LE>()?,
        })
    }
}

impl ReadFromBytes for DacBroadcast {
    fn read_from_bytes<R: ReadBytesExt>(mut reader: R) -> io::Result<Self> {
        let mut mac_address = [0u8; 6];
        reader.read_exact(&mut mac_address)?;
        Ok(DacBroadcast {
            mac_address,
            hw_revision: reader.read_u16::<LE>()?,
            sw_revision: reader.read_u16::<LE>()?,
            buffer_capacity: reader.read_u16::<LE>()?,
            max_point_rate: reader.read_u32::<LE>()?,
            dac_status: reader.read_bytes::<DacStatus>()?,
        })
    }
}

impl ReadFromBytes for DacPoint {
    fn read_from_bytes<R: ReadBytesExt>(mut reader: R) -> io::Result<Self> {
        Ok(DacPoint {
            control: reader.read_u16::<LE>()?,
            x: reader.read_i16::<LE>()?,
            y: reader.read_i16::<LE>()?,
            r: reader.read_u16::<LE>()?,
            g: reader.read_u16::<LE>()?,
            b: reader.read_u16::<LE>()?,
            i: reader.read_u16::<LE>()?,
            u1: reader.read_u16::<LE>()?,
            u2: reader.read_u16::<LE>()?,
        })
    }
}

impl ReadFromBytes for DacResponse {
    fn read_from_bytes<R: ReadBytesExt>(mut reader: R) -> io::Result<Self> {
        Ok(DacResponse {
            response: reader.read_u8()?,
            command: reader.read_u8()?,
            dac_status: reader.read_bytes::<DacStatus>()?,
        })
    }
}

impl SizeBytes for DacStatus {
    const SIZE_BYTES: usize = 20;
}

impl SizeBytes for DacBroadcast {
    const SIZE_BYTES: usize = DacStatus::SIZE_BYTES + 16;
}

impl SizeBytes for DacPoint {
    const SIZE_BYTES: usize = 18;
}

impl SizeBytes for DacResponse {
    const SIZE_BYTES: usize = DacStatus::SIZE_BYTES + 2;
}

impl From<&ChannelPoint> for DacPoint {
    /// Convert a frame tuple to its wire form.
    ///
    /// The x/y channels already hold the signed coordinate's bit pattern, so
    /// they are reinterpreted rather than rescaled.
    fn from(p: &ChannelPoint) -> Self {
        DacPoint {
            control: 0,
            x: p.x as i16,
            y: p.y as i16,
            r: p.r,
            g: p.g,
            b: p.b,
            i: p.i,
            u1: p.u1,
            u2: p.u2,
        }
    }
}

impl<P> WriteToBytes for &P
where
    P: WriteToBytes,
{
    fn write_to_bytes<W: WriteBytesExt>(&self, writer: W) -> io::Result<()> {
        (*self).write_to_bytes(writer)
    }
}

impl<W> WriteBytes for W
where
    W: WriteBytesExt,
{
    fn write_bytes<P: WriteToBytes>(&mut self, protocol: P) -> io::Result<()> {
        protocol.write_to_bytes(self)
    }
}

impl<R> ReadBytes for R
where
    R: ReadBytesExt,
{
    fn read_bytes<P: ReadFromBytes>(&mut self) -> io::Result<P> {
        P::read_from_bytes(self)
    }
}

/// Commands that can be sent to the DAC.
pub mod command {
    use super::{DacPoint, ReadBytes, ReadFromBytes, SizeBytes, WriteBytes, WriteToBytes};
    use byteorder::{ReadBytesExt, WriteBytesExt, LE};
    use std::borrow::Cow;
    use std::io;

    /// Types that may be submitted as commands to the DAC.
    pub trait Command {
        const START_BYTE: u8;
        fn start_byte(&self) -> u8 {
            Self::START_BYTE
        }
    }

    /// `p`: move the playback engine from idle to prepared.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct PrepareStream;

    /// `b`: start playback once points are buffered.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct Begin {
        pub low_water_mark: u16,
        pub point_rate: u32,
    }

    /// `q`: queue a point rate change, applied at the next point carrying
    /// [`DacPoint::CONTROL_CHANGE_RATE`].
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct PointRate(pub u32);

    /// `d`: append points to the device buffer.
    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    pub struct Data<'a> {
        pub points: Cow<'a, [DacPoint]>,
    }

    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct Stop;

    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct EmergencyStop;

    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct EmergencyStopAlt;

    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct ClearEmergencyStop;

    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct Ping;

    fn expect_start_byte<R: ReadBytesExt>(mut reader: R, start_byte: u8) -> io::Result<()> {
        let command = reader.read_u8()?;
        if command != start_byte {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid command byte 0x{:02x}", command),
            ));
        }
        Ok(())
    }

    /// Commands consisting of nothing but their start byte.
    macro_rules! single_byte_commands {
        ($($ty:ident => $byte:expr),* $(,)?) => {
            $(
                impl Command for $ty {
                    const START_BYTE: u8 = $byte;
                }

                impl SizeBytes for $ty {
                    const SIZE_BYTES: usize = 1;
                }

                impl WriteToBytes for $ty {
                    fn write_to_bytes<W: WriteBytesExt>(&self, mut writer: W) -> io::Result<()> {
                        writer.write_u8(Self::START_BYTE)
                    }
                }
            )*
        };
    }

    single_byte_commands! {
        PrepareStream => b'p',
        Stop => b's',
        EmergencyStop => 0x00,
        EmergencyStopAlt => 0xff,
        ClearEmergencyStop => b'c',
        Ping => b'?',
    }

    impl Command for Begin {
        const START_BYTE: u8 = b'b';
    }
    impl Command for PointRate {
        const START_BYTE: u8 = b'q';
    }
    impl<'a> Command for Data<'a> {
        const START_BYTE: u8 = b'd';
    }

    impl<C> Command for &C
    where
        C: Command,
    {
        const START_BYTE: u8 = C::START_BYTE;
    }

    impl SizeBytes for Begin {
        const SIZE_BYTES: usize = 7;
    }
    impl SizeBytes for PointRate {
        const SIZE_BYTES: usize = 5;
    }

    impl Begin {
        pub fn read_fields<R: ReadBytesExt>(mut reader: R) -> io::Result<Self> {
            Ok(Begin {
                low_water_mark: reader.read_u16::<LE>()?,
                point_rate: reader.read_u32::<LE>()?,
            })
        }
    }

    impl PointRate {
        pub fn read_fields<R: ReadBytesExt>(mut reader: R) -> io::Result<Self> {
            Ok(PointRate(reader.read_u32::<LE>()?))
        }
    }

    impl Data<'static> {
        /// Read the point count and points following a `d` start byte.
        pub fn read_fields<R: ReadBytesExt>(mut reader: R) -> io::Result<Self> {
            let n_points = reader.read_u16::<LE>()?;
            let mut points = Vec::with_capacity(n_points as usize);
            for _ in 0..n_points {
                points.push(reader.read_bytes::<DacPoint>()?);
            }
            Ok(Data {
                points: Cow::Owned(points),
            })
        }
    }

    impl<'a> Data<'a> {
        /// Encoded size of this command in bytes.
        pub fn size_bytes(&self) -> usize {
            3 + self.points.len() * DacPoint::SIZE_BYTES
        }
    }

    impl WriteToBytes for Begin {
        fn write_to_bytes<W: WriteBytesExt>(&self, mut writer: W) -> io::Result<()> {
            writer.write_u8(Self::START_BYTE)?;
            writer.write_u16::<LE>(self.low_water_mark)?;
            writer.write_u32::<LE>(self.point_rate)?;
            Ok(())
        }
    }

    impl WriteToBytes for PointRate {
        fn write_to_bytes<W: WriteBytesExt>(&self, mut writer: W) -> io::Result<()> {
            writer.write_u8(Self::START_BYTE)?;
            writer.write_u32::<LE>(self.0)?;
            Ok(())
        }
    }

    impl<'a> WriteToBytes for Data<'a> {
        fn write_to_bytes<W: WriteBytesExt>(&self, mut writer: W) -> io::Result<()> {
            if self.points.len() > u16::MAX as usize {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "too many points"));
            }
            writer.write_u8(Self::START_BYTE)?;
            writer.write_u16::<LE>(self.points.len() as u16)?;
            for point in self.points.iter() {
                writer.write_bytes(point)?;
            }
            Ok(())
        }
    }

    impl ReadFromBytes for Begin {
        fn read_from_bytes<R: ReadBytesExt>(mut reader: R) -> io::Result<Self> {
            expect_start_byte(&mut reader, Self::START_BYTE)?;
            Self::read_fields(reader)
        }
    }

    impl ReadFromBytes for PointRate {
        fn read_from_bytes<R: ReadBytesExt>(mut reader: R) -> io::Result<Self> {
            expect_start_byte(&mut reader, Self::START_BYTE)?;
            Self::read_fields(reader)
        }
    }

    impl ReadFromBytes for Data<'static> {
        fn read_from_bytes<R: ReadBytesExt>(mut reader: R) -> io::Result<Self> {
            expect_start_byte(&mut reader, Self::START_BYTE)?;
            Self::read_fields(reader)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;

    fn sample_status() -> DacStatus {
        DacStatus {
            protocol: 0,
            light_engine_state: DacStatus::LIGHT_ENGINE_READY,
            playback_state: DacStatus::PLAYBACK_PLAYING,
            source: DacStatus::SOURCE_NETWORK_STREAMING,
            light_engine_flags: 0,
            playback_flags: 0x0001,
            source_flags: 0,
            buffer_fullness: 1234,
            point_rate: 30_000,
            point_count: 0xDEAD_BEEF,
        }
    }

    #[test]
    fn test_status_layout_is_little_endian() {
        let mut bytes = Vec::new();
        bytes.write_bytes(sample_status()).unwrap();

        assert_eq!(bytes.len(), DacStatus::SIZE_BYTES);
        assert_eq!(&bytes[0..4], &[0, 0, 2, 0]);
        // buffer_fullness at offset 10
        assert_eq!(&bytes[10..12], &1234u16.to_le_bytes());
        // point_rate at offset 12
        assert_eq!(&bytes[12..16], &30_000u32.to_le_bytes());
        assert_eq!(&bytes[16..20], &[0xEF, 0xBE, 0xAD, 0xDE]);
    }

    #[test]
    fn test_broadcast_decodes_from_wire_bytes() {
        let mut bytes = vec![0x00, 0x04, 0xA3, 0x11, 0x22, 0x33];
        bytes.extend_from_slice(&2u16.to_le_bytes());
        bytes.extend_from_slice(&3u16.to_le_bytes());
        bytes.extend_from_slice(&1800u16.to_le_bytes());
        bytes.extend_from_slice(&100_000u32.to_le_bytes());
        bytes.write_bytes(sample_status()).unwrap();
        assert_eq!(bytes.len(), DacBroadcast::SIZE_BYTES);

        let broadcast = (&bytes[..]).read_bytes::<DacBroadcast>().unwrap();
        assert_eq!(broadcast.mac_address, [0x00, 0x04, 0xA3, 0x11, 0x22, 0x33]);
        assert_eq!(broadcast.hw_revision, 2);
        assert_eq!(broadcast.sw_revision, 3);
        assert_eq!(broadcast.buffer_capacity, 1800);
        assert_eq!(broadcast.max_point_rate, 100_000);
        assert_eq!(broadcast.dac_status, sample_status());
    }

    #[test]
    fn test_truncated_response_is_an_error() {
        let bytes = [DacResponse::ACK, b'?', 0, 0];
        assert!((&bytes[..]).read_bytes::<DacResponse>().is_err());
    }

    #[test]
    fn test_command_start_bytes() {
        assert_eq!(command::PrepareStream::START_BYTE, 0x70);
        assert_eq!(command::Begin::START_BYTE, 0x62);
        assert_eq!(command::PointRate::START_BYTE, 0x71);
        assert_eq!(command::Data::START_BYTE, 0x64);
        assert_eq!(command::Stop::START_BYTE, 0x73);
        assert_eq!(command::ClearEmergencyStop::START_BYTE, 0x63);
        assert_eq!(command::Ping::START_BYTE, 0x3f);
    }

    #[test]
    fn test_begin_encoding() {
        let mut bytes = Vec::new();
        bytes
            .write_bytes(command::Begin {
                low_water_mark: 0,
                point_rate: 30_000,
            })
            .unwrap();
        assert_eq!(bytes.len(), command::Begin::SIZE_BYTES);
        assert_eq!(bytes[0], b'b');
        assert_eq!(&bytes[3..7], &30_000u32.to_le_bytes());

        let begin = (&bytes[..]).read_bytes::<command::Begin>().unwrap();
        assert_eq!(begin.point_rate, 30_000);
    }

    #[test]
    fn test_data_command_encodes_count_and_points() {
        let points = vec![
            DacPoint {
                control: DacPoint::CONTROL_CHANGE_RATE,
                x: -32767,
                y: 32767,
                r: 65535,
                ..Default::default()
            },
            DacPoint::default(),
        ];
        let data = command::Data {
            points: Cow::Borrowed(&points[..]),
        };
        let mut bytes = Vec::new();
        bytes.write_bytes(&data).unwrap();

        assert_eq!(bytes.len(), data.size_bytes());
        assert_eq!(bytes[0], b'd');
        assert_eq!(&bytes[1..3], &2u16.to_le_bytes());
        assert_eq!(&bytes[3..5], &0x8000u16.to_le_bytes());
        assert_eq!(&bytes[5..7], &(-32767i16).to_le_bytes());

        let decoded = (&bytes[..]).read_bytes::<command::Data>().unwrap();
        assert_eq!(&*decoded.points, &points[..]);
    }

    #[test]
    fn test_data_command_rejects_wrong_start_byte() {
        let bytes = [b's', 0, 0];
        assert!((&bytes[..]).read_bytes::<command::Data>().is_err());
    }

    #[test]
    fn test_channel_point_reinterprets_signed_coordinates() {
        let tuple = ChannelPoint {
            x: (-32767i16) as u16,
            y: 32767,
            r: 65535,
            g: 21626,
            b: 7208,
            i: 0,
            u1: 0,
            u2: 0,
        };
        let point: DacPoint = (&tuple).into();

        assert_eq!(point.control, 0);
        assert_eq!(point.x, -32767);
        assert_eq!(point.y, 32767);
        assert_eq!(point.r, 65535);
        assert_eq!(point.g, 21626);
        assert_eq!(point.b, 7208);
    }
}
