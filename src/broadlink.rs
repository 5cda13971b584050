use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};

use chrono::{DateTime, Datelike, Local, Offset, TimeZone, Timelike};
use error_stack::{Report, Result, ResultExt};
use tokio::net::UdpSocket;
use tokio::time::{Duration, Instant};

use log::{debug, info};

use crate::error::DiscoveryError;

pub const DEVICE_PORT: u16 = 80;

const HELLO_PACKET_LEN: usize = 0x30;
const HELLO_COMMAND: u8 = 0x06;
const CHECKSUM_SEED: u32 = 0xbeaf;
const MIN_REPLY_LEN: usize = 0x40;

/// Device types answering as air-conditioner controllers.
pub const AC_DEVICE_TYPES: &[u16] = &[0x4e2a];

/// What a device tells about itself in reply to a hello packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloReply {
    pub address: SocketAddr,
    pub device_type: u16,
    pub mac: [u8; 6],
    pub name: String,
    pub locked: bool,
}

impl HelloReply {
    pub fn mac_string(&self) -> String {
        self.mac.iter().map(|b| format!("{b:02x}")).collect()
    }

    pub fn is_air_conditioner(&self) -> bool {
        AC_DEVICE_TYPES.contains(&self.device_type)
    }
}

pub fn model_name(device_type: u16) -> String {
    if AC_DEVICE_TYPES.contains(&device_type) {
        "Air Conditioner".to_string()
    } else {
        format!("Unknown (0x{device_type:04x})")
    }
}

pub fn hello_packet<Tz: TimeZone>(local: SocketAddrV4, now: &DateTime<Tz>) -> [u8; HELLO_PACKET_LEN] {
    let mut packet = [0u8; HELLO_PACKET_LEN];

    let timezone = now.offset().fix().local_minus_utc() / 3600;
    if timezone < 0 {
        packet[0x08] = (0xff + timezone - 1) as u8;
        packet[0x09] = 0xff;
        packet[0x0a] = 0xff;
        packet[0x0b] = 0xff;
    } else {
        packet[0x08] = timezone as u8;
    }

    let year = now.year();
    packet[0x0c] = (year & 0xff) as u8;
    packet[0x0d] = ((year >> 8) & 0xff) as u8;
    packet[0x0e] = now.minute() as u8;
    packet[0x0f] = now.hour() as u8;
    packet[0x10] = (year % 100) as u8;
    packet[0x11] = now.weekday().number_from_monday() as u8;
    packet[0x12] = now.day() as u8;
    packet[0x13] = now.month() as u8;

    packet[0x18..0x1c].copy_from_slice(&local.ip().octets());
    packet[0x1c..0x1e].copy_from_slice(&local.port().to_le_bytes());
    packet[0x26] = HELLO_COMMAND;

    let checksum = checksum(&packet);
    packet[0x20..0x22].copy_from_slice(&checksum.to_le_bytes());

    packet
}

fn checksum(data: &[u8]) -> u16 {
    (data.iter().fold(CHECKSUM_SEED, |sum, b| sum + u32::from(*b)) & 0xffff) as u16
}

pub fn parse_hello_reply(data: &[u8], from: SocketAddr) -> Option<HelloReply> {
    if data.len() < MIN_REPLY_LEN {
        return None;
    }

    let device_type = u16::from_le_bytes([data[0x34], data[0x35]]);

    let mut mac = [0u8; 6];
    mac.copy_from_slice(&data[0x3a..0x40]);
    mac.reverse();

    let name = data[0x40..].split(|b| *b == 0).next().unwrap_or_default();
    let name = String::from_utf8_lossy(name).trim().to_string();

    let locked = data.get(0x7f).is_some_and(|b| *b != 0);

    Some(HelloReply {
        address: from,
        device_type,
        mac,
        name,
        locked,
    })
}

async fn bind_socket(bind_to: Option<IpAddr>) -> Result<UdpSocket, DiscoveryError> {
    let ip = bind_to.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    UdpSocket::bind(SocketAddr::new(ip, 0))
        .await
        .change_context(DiscoveryError::Socket("binding"))
}

/// The IPv4 address and port devices should answer to.
async fn local_address(socket: &UdpSocket) -> Result<SocketAddrV4, DiscoveryError> {
    let bound = socket
        .local_addr()
        .change_context(DiscoveryError::Socket("reading local address"))?;

    let ip = match bound.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() => ip,
        IpAddr::V4(_) => outbound_ipv4().await?,
        IpAddr::V6(_) => return Err(Report::new(DiscoveryError::NoLocalAddress)),
    };

    Ok(SocketAddrV4::new(ip, bound.port()))
}

// Connecting a UDP socket only selects a route, nothing is sent.
async fn outbound_ipv4() -> Result<Ipv4Addr, DiscoveryError> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .await
        .change_context(DiscoveryError::Socket("binding"))?;
    socket
        .connect((Ipv4Addr::new(8, 8, 8, 8), 53))
        .await
        .change_context(DiscoveryError::NoLocalAddress)?;

    match socket.local_addr().change_context(DiscoveryError::NoLocalAddress)?.ip() {
        IpAddr::V4(ip) => Ok(ip),
        IpAddr::V6(_) => Err(Report::new(DiscoveryError::NoLocalAddress)),
    }
}

/// Broadcast a hello packet and collect every reply received before `timeout` expires.
pub async fn discover(bind_to: Option<IpAddr>, timeout: Duration) -> Result<Vec<HelloReply>, DiscoveryError> {
    let socket = bind_socket(bind_to).await?;
    socket
        .set_broadcast(true)
        .change_context(DiscoveryError::Socket("enabling broadcast"))?;

    let local = local_address(&socket).await?;
    let packet = hello_packet(local, &Local::now());

    info!("Discovering devices from {local}");
    socket
        .send_to(&packet, (Ipv4Addr::BROADCAST, DEVICE_PORT))
        .await
        .change_context(DiscoveryError::Socket("sending hello broadcast"))?;

    let deadline = Instant::now() + timeout;
    let mut replies: Vec<HelloReply> = Vec::new();
    let mut buffer = [0u8; 1024];

    loop {
        let received = match tokio::time::timeout_at(deadline, socket.recv_from(&mut buffer)).await {
            Err(_) => break,
            Ok(received) => received.change_context(DiscoveryError::Socket("receiving hello reply"))?,
        };

        let (len, from) = received;
        match parse_hello_reply(&buffer[..len], from) {
            Some(reply) if !replies.iter().any(|r| r.mac == reply.mac) => {
                debug!("Hello reply from {from}: {reply:?}");
                replies.push(reply);
            }
            Some(_) => {}
            None => debug!("Ignoring {len} byte datagram from {from}"),
        }
    }

    Ok(replies)
}

/// Send a hello packet to a single device. `Ok(None)` means no reply within `timeout`.
pub async fn probe(
    bind_to: Option<IpAddr>,
    target: SocketAddr,
    timeout: Duration,
) -> Result<Option<HelloReply>, DiscoveryError> {
    if !target.is_ipv4() {
        return Err(Report::new(DiscoveryError::NotIpv4(target.to_string())));
    }

    let socket = bind_socket(bind_to).await?;
    // Connected, the socket reports the address on the route to the device
    socket
        .connect(target)
        .await
        .change_context(DiscoveryError::Socket("connecting to device"))?;
    let local = local_address(&socket).await?;
    let packet = hello_packet(local, &Local::now());

    socket
        .send(&packet)
        .await
        .change_context(DiscoveryError::Socket("sending hello"))?;

    let deadline = Instant::now() + timeout;
    let mut buffer = [0u8; 1024];

    loop {
        let len = match tokio::time::timeout_at(deadline, socket.recv(&mut buffer)).await {
            Err(_) => return Ok(None),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => return Ok(None),
            Ok(received) => received.change_context(DiscoveryError::Socket("receiving hello reply"))?,
        };

        if let Some(reply) = parse_hello_reply(&buffer[..len], target) {
            return Ok(Some(reply));
        }
    }
}
