//! Remote countdown display protocol.
//!
//! Every notification is a single 4-byte datagram: a big-endian command
//! code followed by a big-endian time value in deciseconds. Nothing is
//! acknowledged and nothing is retried; the match clock stays authoritative.

use std::{
    fmt,
    net::{SocketAddr, ToSocketAddrs, UdpSocket},
    time::Duration,
};

use crate::{ArenaError, DisplayConfig, Result};

pub const PACKET_LEN: usize = 4;

/// Largest time value that fits the wire field, in milliseconds.
pub const MAX_TIME_MS: u64 = u16::MAX as u64 * 100;

/// Closed set of display commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum RemoteCommand {
    Reset = 0,
    Start = 1,
    Pause = 2,
    Resume = 3,
    AddTime = 4,
    End = 5,
}

impl RemoteCommand {
    pub fn code(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for RemoteCommand {
    type Error = ArenaError;

    fn try_from(code: u16) -> Result<Self> {
        match code {
            0 => Ok(Self::Reset),
            1 => Ok(Self::Start),
            2 => Ok(Self::Pause),
            3 => Ok(Self::Resume),
            4 => Ok(Self::AddTime),
            5 => Ok(Self::End),
            other => Err(ArenaError::UnknownCommandCode(other)),
        }
    }
}

impl std::str::FromStr for RemoteCommand {
    type Err = ArenaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reset" | "cancel" => Ok(Self::Reset),
            "start" => Ok(Self::Start),
            "pause" => Ok(Self::Pause),
            "resume" => Ok(Self::Resume),
            "add" | "add_time" | "add-time" => Ok(Self::AddTime),
            "end" => Ok(Self::End),
            other => match other.parse::<u16>() {
                Ok(code) => Self::try_from(code),
                Err(_) => Err(ArenaError::msg(format!("unknown display command `{s}`"))),
            },
        }
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Reset => "RESET",
            Self::Start => "START",
            Self::Pause => "PAUSE",
            Self::Resume => "RESUME",
            Self::AddTime => "ADD_TIME",
            Self::End => "END",
        };
        f.write_str(name)
    }
}

/// One decoded display datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockPacket {
    pub command: RemoteCommand,
    pub deciseconds: u16,
}

impl ClockPacket {
    /// Truncates `time_ms` to whole deciseconds, saturating at the field
    /// maximum.
    pub fn new(command: RemoteCommand, time_ms: u64) -> Self {
        Self {
            command,
            deciseconds: (time_ms.min(MAX_TIME_MS) / 100) as u16,
        }
    }

    pub fn from_duration(command: RemoteCommand, time: Duration) -> Self {
        let millis = u64::try_from(time.as_millis()).unwrap_or(u64::MAX);
        Self::new(command, millis)
    }

    pub fn encode(&self) -> [u8; PACKET_LEN] {
        let code = self.command.code().to_be_bytes();
        let time = self.deciseconds.to_be_bytes();
        [code[0], code[1], time[0], time[1]]
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; PACKET_LEN] = bytes
            .try_into()
            .map_err(|_| ArenaError::MalformedPacket { len: bytes.len() })?;
        let command = RemoteCommand::try_from(u16::from_be_bytes([bytes[0], bytes[1]]))?;
        Ok(Self {
            command,
            deciseconds: u16::from_be_bytes([bytes[2], bytes[3]]),
        })
    }

    pub fn time_ms(&self) -> u64 {
        u64::from(self.deciseconds) * 100
    }
}

/// Fire-and-forget sender for the remote display.
#[derive(Debug)]
pub struct RemoteClockClient {
    socket: UdpSocket,
    target: SocketAddr,
}

impl RemoteClockClient {
    pub fn connect(target: &str, bind: &str) -> Result<Self> {
        let target = target
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| ArenaError::msg(format!("could not resolve display `{target}`")))?;
        let socket = UdpSocket::bind(bind)?;
        Ok(Self { socket, target })
    }

    pub fn from_config(config: &DisplayConfig) -> Result<Self> {
        Self::connect(&config.address, &config.bind)
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Sends one command. Failures are logged, never returned.
    pub fn send(&self, command: RemoteCommand, time: Duration) {
        let packet = ClockPacket::from_duration(command, time);
        match self.socket.send_to(&packet.encode(), self.target) {
            Ok(_) => tracing::debug!(
                %command,
                time_ms = packet.time_ms(),
                target = %self.target,
                "display command sent"
            ),
            Err(err) => tracing::warn!(%command, target = %self.target, %err, "display command lost"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_layout_is_big_endian() {
        let packet = ClockPacket::new(RemoteCommand::Start, 180_000);
        assert_eq!(packet.encode(), [0x00, 0x01, 0x07, 0x08]);
    }

    #[test]
    fn time_is_truncated_and_clamped() {
        for (millis, expected) in [
            (0, 0),
            (999, 9),
            (1_000, 10),
            (180_000, 1_800),
            (6_553_500, 65_535),
            (10_000_000, 65_535),
        ] {
            let packet = ClockPacket::new(RemoteCommand::AddTime, millis);
            let decoded = ClockPacket::decode(&packet.encode()).unwrap();
            assert_eq!(decoded.deciseconds, expected, "for {millis} ms");
            assert_eq!(decoded.command, RemoteCommand::AddTime);
        }
    }

    #[test]
    fn rejects_bad_datagrams() {
        assert!(matches!(
            ClockPacket::decode(&[0, 1, 2]),
            Err(ArenaError::MalformedPacket { len: 3 })
        ));
        assert!(matches!(
            ClockPacket::decode(&[0, 9, 0, 0]),
            Err(ArenaError::UnknownCommandCode(9))
        ));
    }

    #[test]
    fn parses_command_names_and_codes() {
        assert_eq!("pause".parse::<RemoteCommand>().unwrap(), RemoteCommand::Pause);
        assert_eq!("ADD_TIME".parse::<RemoteCommand>().unwrap(), RemoteCommand::AddTime);
        assert_eq!("5".parse::<RemoteCommand>().unwrap(), RemoteCommand::End);
        assert!("7".parse::<RemoteCommand>().is_err());
    }

    #[test]
    fn sends_datagrams_to_display() {
        let display = UdpSocket::bind("127.0.0.1:0").unwrap();
        display
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let client = RemoteClockClient::connect(
            &display.local_addr().unwrap().to_string(),
            "127.0.0.1:0",
        )
        .unwrap();

        client.send(RemoteCommand::Pause, Duration::from_millis(120_050));

        let mut buf = [0u8; 16];
        let (len, _) = display.recv_from(&mut buf).unwrap();
        let packet = ClockPacket::decode(&buf[..len]).unwrap();
        assert_eq!(packet.command, RemoteCommand::Pause);
        assert_eq!(packet.deciseconds, 1_200);
    }
}
