//! Ether Dream TCP command stream.
//!
//! Commands are queued with [`Stream::queue_commands`] and written back to
//! back on [`CommandQueue::submit`]; the DAC answers every command with one
//! response carrying its current status, which is folded into the stream's
//! view of the DAC before any NAK is reported.

use super::{Addressed, ProtocolError};
use crate::protocols::ether_dream::protocol::{
    self, Command, ReadBytes, SizeBytes, WriteBytes, WriteToBytes,
};
use std::borrow::Cow;
use std::error::Error;
use std::io::{self, BufReader, Read, Write};
use std::{fmt, mem, net, ops, time};

/// A bi-directional communication stream between the host and a `Dac`.
pub struct Stream {
    dac: Addressed,
    tcp_reader: BufReader<net::TcpStream>,
    tcp_writer: net::TcpStream,
    command_buffer: Vec<QueuedCommand>,
    point_buffer: Vec<protocol::DacPoint>,
    bytes: Vec<u8>,
    responses: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum QueuedCommand {
    PrepareStream,
    Begin(protocol::command::Begin),
    PointRate(protocol::command::PointRate),
    Data(ops::Range<usize>),
    Stop,
    EmergencyStop,
    ClearEmergencyStop,
    Ping,
}

/// Builder for a batch of commands, created by [`Stream::queue_commands`].
pub struct CommandQueue<'a> {
    stream: &'a mut Stream,
}

#[derive(Debug)]
pub enum CommunicationError {
    Io(io::Error),
    Protocol(ProtocolError),
    Response(ResponseError),
}

#[derive(Debug)]
pub struct ResponseError {
    pub response: protocol::DacResponse,
    pub kind: ResponseErrorKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ResponseErrorKind {
    UnexpectedCommand(u8),
    UnknownResponse(u8),
    Nak(Nak),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Nak {
    Full,
    Invalid,
    StopCondition,
}

impl Stream {
    fn send_command<C>(&mut self, command: C) -> io::Result<()>
    where
        C: Command + WriteToBytes,
    {
        send_command(&mut self.bytes, &mut self.tcp_writer, command)
    }

    fn recv_response(&mut self, expected_command: u8) -> Result<(), CommunicationError> {
        self.responses += 1;
        recv_response_buffered(
            &mut self.bytes,
            &mut self.tcp_reader,
            &mut self.dac,
            expected_command,
        )
    }

    /// The DAC as of the most recent response.
    pub fn dac(&self) -> &Addressed {
        &self.dac
    }

    /// Number of responses read from the DAC so far, including the greeting.
    ///
    /// Serves as a monotonically increasing acknowledgment sequence number.
    pub fn responses_received(&self) -> u64 {
        self.responses
    }

    pub fn queue_commands(&mut self) -> CommandQueue<'_> {
        self.command_buffer.clear();
        self.point_buffer.clear();
        CommandQueue { stream: self }
    }

    pub fn set_read_timeout(&self, duration: Option<time::Duration>) -> io::Result<()> {
        self.tcp_reader.get_ref().set_read_timeout(duration)
    }

    pub fn set_write_timeout(&self, duration: Option<time::Duration>) -> io::Result<()> {
        self.tcp_writer.set_write_timeout(duration)
    }

    pub fn set_timeout(&self, duration: Option<time::Duration>) -> io::Result<()> {
        self.set_read_timeout(duration)?;
        self.set_write_timeout(duration)
    }

    /// Shut down both directions of the connection.
    pub fn shutdown(&self) -> io::Result<()> {
        self.tcp_writer.shutdown(net::Shutdown::Both)
    }
}

impl<'a> CommandQueue<'a> {
    pub fn prepare_stream(self) -> Self {
        self.stream
            .command_buffer
            .push(QueuedCommand::PrepareStream);
        self
    }

    pub fn begin(self, low_water_mark: u16, point_rate: u32) -> Self {
        let begin = protocol::command::Begin {
            low_water_mark,
            point_rate,
        };
        self.stream.command_buffer.push(QueuedCommand::Begin(begin));
        self
    }

    pub fn point_rate(self, point_rate: u32) -> Self {
        let point_rate = protocol::command::PointRate(point_rate);
        self.stream
            .command_buffer
            .push(QueuedCommand::PointRate(point_rate));
        self
    }

    pub fn data<I>(self, points: I) -> Self
    where
        I: IntoIterator<Item = protocol::DacPoint>,
    {
        let start = self.stream.point_buffer.len();
        self.stream.point_buffer.extend(points);
        let end = self.stream.point_buffer.len();
        assert!(end - start < u16::MAX as usize, "too many points");
        self.stream
            .command_buffer
            .push(QueuedCommand::Data(start..end));
        self
    }

    pub fn stop(self) -> Self {
        self.stream.command_buffer.push(QueuedCommand::Stop);
        self
    }

    pub fn emergency_stop(self) -> Self {
        self.stream
            .command_buffer
            .push(QueuedCommand::EmergencyStop);
        self
    }

    pub fn clear_emergency_stop(self) -> Self {
        self.stream
            .command_buffer
            .push(QueuedCommand::ClearEmergencyStop);
        self
    }

    pub fn ping(self) -> Self {
        self.stream.command_buffer.push(QueuedCommand::Ping);
        self
    }

    /// Write every queued command, then read one response per command.
    ///
    /// Responses are all drained even if an earlier one is a NAK, so the
    /// connection stays in step; the first error is returned.
    pub fn submit(self) -> Result<(), CommunicationError> {
        use protocol::command;

        let CommandQueue { stream } = self;

        let mut command_bytes = Vec::with_capacity(stream.command_buffer.len());
        let mut command_buffer = mem::take(&mut stream.command_buffer);

        for queued in command_buffer.drain(..) {
            let start_byte = match queued {
                QueuedCommand::PrepareStream => {
                    stream.send_command(command::PrepareStream)?;
                    command::PrepareStream::START_BYTE
                }
                QueuedCommand::Begin(begin) => {
                    stream.send_command(begin)?;
                    command::Begin::START_BYTE
                }
                QueuedCommand::PointRate(point_rate) => {
                    stream.send_command(point_rate)?;
                    command::PointRate::START_BYTE
                }
                QueuedCommand::Data(range) => {
                    let points = Cow::Borrowed(&stream.point_buffer[range]);
                    let data = command::Data { points };
                    send_command(&mut stream.bytes, &mut stream.tcp_writer, data)?;
                    command::Data::START_BYTE
                }
                QueuedCommand::Stop => {
                    stream.send_command(command::Stop)?;
                    command::Stop::START_BYTE
                }
                QueuedCommand::EmergencyStop => {
                    stream.send_command(command::EmergencyStop)?;
                    command::EmergencyStop::START_BYTE
                }
                QueuedCommand::ClearEmergencyStop => {
                    stream.send_command(command::ClearEmergencyStop)?;
                    command::ClearEmergencyStop::START_BYTE
                }
                QueuedCommand::Ping => {
                    stream.send_command(command::Ping)?;
                    command::Ping::START_BYTE
                }
            };
            command_bytes.push(start_byte);
        }

        mem::swap(&mut stream.command_buffer, &mut command_buffer);

        let mut first_err = None;
        for command_byte in command_bytes {
            match stream.recv_response(command_byte) {
                Ok(()) => {}
                // Framing is lost; nothing after this can be trusted.
                Err(CommunicationError::Io(e)) => return Err(CommunicationError::Io(e)),
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl protocol::DacResponse {
    fn check_errors(&self, expected_command: u8) -> Result<(), ResponseError> {
        if self.command != expected_command {
            return Err(ResponseError {
                response: *self,
                kind: ResponseErrorKind::UnexpectedCommand(self.command),
            });
        }

        if self.response == protocol::DacResponse::ACK {
            return Ok(());
        }

        let kind = match Nak::from_protocol(self.response) {
            Some(nak) => ResponseErrorKind::Nak(nak),
            None => ResponseErrorKind::UnknownResponse(self.response),
        };
        Err(ResponseError {
            response: *self,
            kind,
        })
    }
}

impl Nak {
    pub fn from_protocol(nak: u8) -> Option<Self> {
        Some(match nak {
            protocol::DacResponse::NAK_FULL => Nak::Full,
            protocol::DacResponse::NAK_INVALID => Nak::Invalid,
            protocol::DacResponse::NAK_STOP_CONDITION => Nak::StopCondition,
            _ => return None,
        })
    }

    pub fn to_protocol(&self) -> u8 {
        match *self {
            Nak::Full => protocol::DacResponse::NAK_FULL,
            Nak::Invalid => protocol::DacResponse::NAK_INVALID,
            Nak::StopCondition => protocol::DacResponse::NAK_STOP_CONDITION,
        }
    }
}

impl CommunicationError {
    /// The NAK carried by this error, if the DAC answered with one.
    pub fn nak(&self) -> Option<Nak> {
        match self {
            CommunicationError::Response(ResponseError {
                kind: ResponseErrorKind::Nak(nak),
                ..
            }) => Some(*nak),
            _ => None,
        }
    }
}

impl Error for CommunicationError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CommunicationError::Io(err) => Some(err),
            CommunicationError::Protocol(err) => Some(err),
            CommunicationError::Response(err) => Some(err),
        }
    }
}

impl Error for ResponseError {}

impl fmt::Display for CommunicationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CommunicationError::Io(err) => err.fmt(f),
            CommunicationError::Protocol(err) => err.fmt(f),
            CommunicationError::Response(err) => err.fmt(f),
        }
    }
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.kind {
            ResponseErrorKind::UnexpectedCommand(cmd) => {
                write!(f, "received response to unexpected command 0x{:02x}", cmd)
            }
            ResponseErrorKind::UnknownResponse(byte) => {
                write!(f, "unknown response byte 0x{:02x}", byte)
            }
            ResponseErrorKind::Nak(nak) => match nak {
                Nak::Full => write!(f, "DAC responded with \"NAK - Full\""),
                Nak::Invalid => write!(f, "DAC responded with \"NAK - Invalid\""),
                Nak::StopCondition => write!(f, "DAC responded with \"NAK - Stop Condition\""),
            },
        }
    }
}

impl From<io::Error> for CommunicationError {
    fn from(err: io::Error) -> Self {
        CommunicationError::Io(err)
    }
}

impl From<ProtocolError> for CommunicationError {
    fn from(err: ProtocolError) -> Self {
        CommunicationError::Protocol(err)
    }
}

impl From<ResponseError> for CommunicationError {
    fn from(err: ResponseError) -> Self {
        CommunicationError::Response(err)
    }
}

/// Establishes a TCP stream with the DAC at `addr`, bounding both the TCP
/// connect and the wait for the DAC's greeting status by `timeout`.
///
/// Both steps share one deadline. The read timeout is left at whatever time
/// remained; callers may change it.
pub fn connect_timeout(
    broadcast: &protocol::DacBroadcast,
    addr: net::SocketAddr,
    timeout: time::Duration,
) -> Result<Stream, CommunicationError> {
    let mut dac = Addressed::from_broadcast(broadcast)?;
    let deadline = time::Instant::now() + timeout;

    let tcp_stream = net::TcpStream::connect_timeout(&addr, timeout)?;
    let remaining = deadline
        .saturating_duration_since(time::Instant::now())
        .max(time::Duration::from_millis(1));
    tcp_stream.set_nodelay(true)?;
    tcp_stream.set_read_timeout(Some(remaining))?;
    tcp_stream.set_write_timeout(Some(remaining))?;

    let tcp_writer = tcp_stream.try_clone()?;
    let mut tcp_reader = BufReader::new(tcp_stream);

    let mut bytes = vec![];

    // On connect the DAC sends a status as if answering a ping.
    recv_response_buffered(
        &mut bytes,
        &mut tcp_reader,
        &mut dac,
        protocol::command::Ping::START_BYTE,
    )?;

    Ok(Stream {
        dac,
        tcp_reader,
        tcp_writer,
        command_buffer: vec![],
        point_buffer: vec![],
        bytes,
        responses: 1,
    })
}

fn send_command<C>(bytes: &mut Vec<u8>, tcp_stream: &mut net::TcpStream, command: C) -> io::Result<()>
where
    C: Command + WriteToBytes,
{
    bytes.clear();
    bytes.write_bytes(command)?;
    tcp_stream.write_all(bytes)?;
    Ok(())
}

fn recv_response_buffered(
    bytes: &mut Vec<u8>,
    tcp_reader: &mut BufReader<net::TcpStream>,
    dac: &mut Addressed,
    expected_command: u8,
) -> Result<(), CommunicationError> {
    bytes.resize(protocol::DacResponse::SIZE_BYTES, 0);
    tcp_reader.read_exact(bytes)?;
    let response = (&bytes[..]).read_bytes::<protocol::DacResponse>()?;

    // Update status before returning errors so callers can react to DAC state
    // changes even when the response is a NAK.
    dac.update_status(&response.dac_status)?;
    response.check_errors(expected_command)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::ether_dream::protocol::DacResponse;

    fn response(response: u8, command: u8) -> DacResponse {
        DacResponse {
            response,
            command,
            dac_status: Default::default(),
        }
    }

    #[test]
    fn test_ack_for_expected_command_passes() {
        assert!(response(DacResponse::ACK, b'd').check_errors(b'd').is_ok());
    }

    #[test]
    fn test_mismatched_command_is_reported() {
        let err = response(DacResponse::ACK, b'p').check_errors(b'd').unwrap_err();
        assert_eq!(err.kind, ResponseErrorKind::UnexpectedCommand(b'p'));
    }

    #[test]
    fn test_nak_full_is_classified() {
        let err = response(DacResponse::NAK_FULL, b'd')
            .check_errors(b'd')
            .unwrap_err();
        assert_eq!(err.kind, ResponseErrorKind::Nak(Nak::Full));
        assert_eq!(CommunicationError::from(err).nak(), Some(Nak::Full));
    }

    #[test]
    fn test_garbage_response_byte_is_not_an_ack() {
        let err = response(0x7a, b'?').check_errors(b'?').unwrap_err();
        assert_eq!(err.kind, ResponseErrorKind::UnknownResponse(0x7a));
    }
}
