//! Non-blocking MQTT client over TCP.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, info, trace, warn};

use super::packet::{self, Packet, QoS};
use super::{MqttError, MqttResult};

/// Default broker port.
pub const DEFAULT_PORT: u16 = 1883;

/// Keepalive announced in CONNECT.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(300);

/// Capacity of the send and receive buffers.
const BUFFER_SIZE: usize = 4096;

/// Upper bound on the initial blocking TCP connect and on waiting for CONNACK.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on the TCP connect of a reconnect made from [`MqttClient::sync`],
/// which runs inside the acquisition wait loop.
const SYNC_CONNECT_TIMEOUT: Duration = Duration::from_millis(250);

const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// Incoming messages kept before the oldest are dropped.
const MAX_INBOX: usize = 1024;

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keepalive: Duration,
    /// Minimum spacing between reconnect attempts.
    pub reconnect_interval: Duration,
}

impl MqttConfig {
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id.into(),
            keepalive: DEFAULT_KEEPALIVE,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
        }
    }

    /// `host:port` for logging.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Connection state of an [`MqttClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    /// Created but never connected; the first `sync` connects.
    Initial,
    /// CONNECT sent, waiting for CONNACK.
    Connecting,
    Connected,
    /// Connection lost; the next `sync` reconnects. Holds the error text.
    Error(String),
    Closed,
}

/// A message received on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
}

/// MQTT client pumped from the caller's loop.
pub struct MqttClient {
    config: MqttConfig,
    stream: Option<TcpStream>,
    send_buf: BytesMut,
    recv_buf: BytesMut,
    state: ClientState,
    last_send: Instant,
    ping_sent: Option<Instant>,
    last_attempt: Option<Instant>,
    subscriptions: Vec<String>,
    next_packet_id: u16,
    inbox: VecDeque<Message>,
    reconnects: u32,
}

impl MqttClient {
    /// Create a client without connecting. The first [`sync`](Self::sync)
    /// opens the connection.
    pub fn new(config: MqttConfig) -> Self {
        Self {
            config,
            stream: None,
            send_buf: BytesMut::with_capacity(BUFFER_SIZE),
            recv_buf: BytesMut::with_capacity(BUFFER_SIZE),
            state: ClientState::Initial,
            last_send: Instant::now(),
            ping_sent: None,
            last_attempt: None,
            subscriptions: Vec::new(),
            next_packet_id: 1,
            inbox: VecDeque::new(),
            reconnects: 0,
        }
    }

    /// Create a client and open the connection immediately.
    ///
    /// # Errors
    ///
    /// Returns [`MqttError::ConnectionFailed`] if the broker cannot be reached.
    /// CONNACK is processed by later calls to [`sync`](Self::sync).
    pub fn connect(config: MqttConfig) -> MqttResult<Self> {
        let mut client = Self::new(config);
        client.reconnect(CONNECT_TIMEOUT)?;
        Ok(client)
    }

    pub fn config(&self) -> &MqttConfig {
        &self.config
    }

    pub fn state(&self) -> &ClientState {
        &self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ClientState::Connected
    }

    /// Number of reconnects after a connection error.
    pub fn reconnect_count(&self) -> u32 {
        self.reconnects
    }

    /// Text describing the client's last error, or its state when healthy.
    pub fn error_str(&self) -> String {
        match &self.state {
            ClientState::Initial => "initial reconnect".to_string(),
            ClientState::Connecting | ClientState::Connected => "ok".to_string(),
            ClientState::Error(reason) => reason.clone(),
            ClientState::Closed => "closed".to_string(),
        }
    }

    fn open_socket(&self, timeout: Duration) -> MqttResult<TcpStream> {
        let address = self.config.address();
        let addrs = (self.config.host.as_str(), self.config.port)
            .to_socket_addrs()
            .map_err(|e| MqttError::ConnectionFailed(format!("Failed to resolve {address}: {e}")))?;

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    stream.set_nonblocking(true)?;
                    return Ok(stream);
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(MqttError::ConnectionFailed(match last_error {
            Some(e) => format!("Failed to open socket to {address}: {e}"),
            None => format!("No addresses found for {address}"),
        }))
    }

    fn reconnect(&mut self, timeout: Duration) -> MqttResult<()> {
        if let ClientState::Error(reason) = &self.state {
            warn!("Reconnecting MQTT publisher. Client was in error state \"{reason}\"");
            self.reconnects += 1;
        }
        self.last_attempt = Some(Instant::now());

        if let Some(old) = self.stream.take() {
            let _ = old.shutdown(Shutdown::Both);
        }
        self.stream = Some(self.open_socket(timeout)?);
        self.send_buf.clear();
        self.recv_buf.clear();
        self.ping_sent = None;

        let keepalive = self.config.keepalive.as_secs().min(u64::from(u16::MAX)) as u16;
        packet::encode_connect(&mut self.send_buf, &self.config.client_id, keepalive)?;
        for topic in self.subscriptions.clone() {
            self.queue_subscribe(&topic)?;
        }
        self.state = ClientState::Connecting;
        self.flush()?;
        debug!("MQTT CONNECT sent to {}", self.config.address());
        Ok(())
    }

    fn reconnect_due(&self) -> bool {
        self.last_attempt
            .map_or(true, |t| t.elapsed() >= self.config.reconnect_interval)
    }

    /// Drop the connection and remember why.
    fn fail(&mut self, error: &MqttError) {
        warn!("MQTT connection error: {error}");
        self.state = ClientState::Error(error.to_string());
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    /// Run one iteration of the client: reconnect if needed, flush queued
    /// output, read and dispatch input, and service the keepalive.
    ///
    /// Does not wait on the broker, except that a due reconnect may block for
    /// up to 250 ms in the TCP connect. Transient connection errors are
    /// absorbed into the error state and retried on a later call.
    ///
    /// # Errors
    ///
    /// Returns [`MqttError::ConnectionRefused`] when the broker rejects the
    /// CONNECT; retrying with the same settings would not help.
    pub fn sync(&mut self) -> MqttResult<()> {
        if self.state == ClientState::Closed {
            return Ok(());
        }

        if matches!(self.state, ClientState::Initial | ClientState::Error(_)) {
            if !self.reconnect_due() {
                return Ok(());
            }
            if let Err(e) = self.reconnect(SYNC_CONNECT_TIMEOUT) {
                self.fail(&e);
                return Ok(());
            }
        }

        match self.sync_io() {
            Ok(()) => Ok(()),
            Err(e @ MqttError::ConnectionRefused { .. }) => {
                self.fail(&e);
                Err(e)
            }
            Err(e) => {
                self.fail(&e);
                Ok(())
            }
        }
    }

    fn sync_io(&mut self) -> MqttResult<()> {
        self.flush()?;
        self.receive()?;
        self.service_keepalive()
    }

    fn flush(&mut self) -> MqttResult<()> {
        while !self.send_buf.is_empty() {
            let result = match self.stream.as_mut() {
                Some(stream) => stream.write(&self.send_buf),
                None => return Err(MqttError::NotConnected(self.error_str())),
            };
            match result {
                Ok(0) => return Err(MqttError::ConnectionClosed),
                Ok(n) => {
                    trace!("MQTT wrote {n} bytes");
                    self.send_buf.advance(n);
                    self.last_send = Instant::now();
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn receive(&mut self) -> MqttResult<()> {
        let mut chunk = [0u8; 1024];
        loop {
            let result = match self.stream.as_mut() {
                Some(stream) => stream.read(&mut chunk),
                None => return Err(MqttError::NotConnected(self.error_str())),
            };
            match result {
                Ok(0) => return Err(MqttError::ConnectionClosed),
                Ok(n) => {
                    self.recv_buf.extend_from_slice(&chunk[..n]);
                    while let Some(packet) = packet::decode(&mut self.recv_buf)? {
                        self.handle_packet(packet)?;
                    }
                    if self.recv_buf.len() > BUFFER_SIZE {
                        return Err(MqttError::MalformedPacket(format!(
                            "incoming packet larger than {BUFFER_SIZE} bytes"
                        )));
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn handle_packet(&mut self, packet: Packet) -> MqttResult<()> {
        match packet {
            Packet::ConnAck {
                return_code: 0,
                session_present,
            } => {
                info!(
                    "Connected to MQTT broker at {} (session present: {session_present})",
                    self.config.address()
                );
                self.state = ClientState::Connected;
            }
            Packet::ConnAck { return_code, .. } => {
                return Err(MqttError::ConnectionRefused {
                    code: return_code,
                    message: packet::connack_message(return_code),
                });
            }
            Packet::Publish { topic, payload } => {
                trace!("MQTT recv {} bytes on {topic:?}", payload.len());
                if self.inbox.len() >= MAX_INBOX {
                    warn!("MQTT inbox full, dropping oldest message");
                    self.inbox.pop_front();
                }
                self.inbox.push_back(Message { topic, payload });
            }
            Packet::SubAck {
                packet_id,
                return_codes,
            } => {
                if return_codes.contains(&0x80) {
                    warn!("Broker rejected subscription (packet {packet_id})");
                } else {
                    debug!("Subscription {packet_id} acknowledged");
                }
            }
            Packet::PingResp => {
                trace!("MQTT PINGRESP");
                self.ping_sent = None;
            }
            Packet::PingReq | Packet::Other(_) => {
                trace!("Ignoring MQTT packet {packet:?}");
            }
        }
        Ok(())
    }

    fn service_keepalive(&mut self) -> MqttResult<()> {
        match self.state {
            ClientState::Connecting => {
                let waited = self.last_attempt.map_or(Duration::ZERO, |t| t.elapsed());
                if waited >= CONNECT_TIMEOUT {
                    return Err(MqttError::Timeout("CONNACK"));
                }
                Ok(())
            }
            ClientState::Connected if !self.config.keepalive.is_zero() => {
                if let Some(sent) = self.ping_sent {
                    if sent.elapsed() >= self.config.keepalive {
                        return Err(MqttError::Timeout("PINGRESP"));
                    }
                } else if self.last_send.elapsed() >= self.config.keepalive {
                    packet::encode_pingreq(&mut self.send_buf);
                    self.ping_sent = Some(Instant::now());
                    self.flush()?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Queue a PUBLISH and try to send it straight away.
    ///
    /// # Errors
    ///
    /// - [`MqttError::UnsupportedQos`] for QoS above 0
    /// - [`MqttError::NotConnected`] while the client is in an error state
    /// - [`MqttError::SendBufferFull`] if the packet cannot be buffered
    /// - any socket error hit while flushing; the client enters the error state
    pub fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS) -> MqttResult<()> {
        if qos != QoS::AtMostOnce {
            return Err(MqttError::UnsupportedQos(qos.level()));
        }
        if !matches!(
            self.state,
            ClientState::Connecting | ClientState::Connected
        ) {
            return Err(MqttError::NotConnected(self.error_str()));
        }

        let needed = packet::publish_len(topic, payload.len());
        if self.send_buf.len() + needed > BUFFER_SIZE {
            if let Err(e) = self.flush() {
                self.fail(&e);
                return Err(e);
            }
        }
        let free = BUFFER_SIZE.saturating_sub(self.send_buf.len());
        if needed > free {
            return Err(MqttError::SendBufferFull { needed, free });
        }

        packet::encode_publish(&mut self.send_buf, topic, payload)?;
        trace!("MQTT publish {} bytes on {topic:?}", payload.len());
        if let Err(e) = self.flush() {
            self.fail(&e);
            return Err(e);
        }
        Ok(())
    }

    fn queue_subscribe(&mut self, topic: &str) -> MqttResult<()> {
        let packet_id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.checked_add(1).unwrap_or(1);
        packet::encode_subscribe(&mut self.send_buf, packet_id, topic)
    }

    /// Subscribe to `topic` at QoS 0. The subscription is renewed on every
    /// reconnect.
    pub fn subscribe(&mut self, topic: &str) -> MqttResult<()> {
        self.subscriptions.push(topic.to_string());
        if matches!(
            self.state,
            ClientState::Connecting | ClientState::Connected
        ) {
            self.queue_subscribe(topic)?;
            if let Err(e) = self.flush() {
                self.fail(&e);
            }
        }
        Ok(())
    }

    /// Next received message, if any.
    pub fn take_message(&mut self) -> Option<Message> {
        self.inbox.pop_front()
    }

    /// Send DISCONNECT (when connected) and close the socket. Idempotent.
    pub fn close(&mut self) {
        if self.state == ClientState::Closed {
            return;
        }
        if let Some(mut stream) = self.stream.take() {
            if self.state == ClientState::Connected {
                let mut buf = BytesMut::new();
                packet::encode_disconnect(&mut buf);
                let _ = stream.write_all(&buf);
            }
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.state = ClientState::Closed;
        info!("MQTT connection to {} closed", self.config.address());
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        self.close();
    }
}
