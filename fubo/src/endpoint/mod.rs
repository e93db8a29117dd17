// Copyright (c) 2022 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Async driver binding one [`Connection`] to one duplex byte stream.
//!
//! The endpoint runs the connection inside its own task: it pumps bytes
//! in both directions, schedules the timers the connection asks for and
//! serializes concurrent senders through a command channel, so packets
//! reach the peer in send-call order.

use codec::{v5, EncodePacket, Packet, PacketId};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::connection::{Connection, Event, Role, StoredPacket, TimerKind, TimerOp};
use crate::error::{Error, ErrorKind};

/// Default size of the read buffer in front of the packet reader.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

const COMMAND_QUEUE_SIZE: usize = 64;
const PACKET_QUEUE_SIZE: usize = 64;

/// Behaviour knobs applied to the wrapped connection at construction.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub auto_pub_response: bool,
    pub auto_ping_response: bool,
    pub auto_map_topic_alias_send: bool,
    pub auto_replace_topic_alias_send: bool,
    pub offline_publish: bool,
    pub pingresp_recv_timeout: Option<Duration>,
    pub pingreq_send_interval: Option<Duration>,
    pub read_buffer_size: usize,

    /// Gather all queued outgoing packets into one stream write.
    pub bulk_write: bool,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            auto_pub_response: false,
            auto_ping_response: false,
            auto_map_topic_alias_send: false,
            auto_replace_topic_alias_send: false,
            offline_publish: false,
            pingresp_recv_timeout: None,
            pingreq_send_interval: None,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            bulk_write: false,
        }
    }
}

impl EndpointConfig {
    /// Config used by the broker for accepted connections.
    #[must_use]
    pub fn broker() -> Self {
        Self {
            auto_ping_response: true,
            ..Self::default()
        }
    }
}

enum Command {
    Send(Packet, oneshot::Sender<Result<(), Error>>),
    AcquireId(oneshot::Sender<Option<PacketId>>),
    AcquireIdWait(oneshot::Sender<PacketId>),
    RegisterId(PacketId, oneshot::Sender<bool>),
    ReleaseId(PacketId, oneshot::Sender<bool>),
    RestorePackets(Vec<StoredPacket>, oneshot::Sender<()>),
    RestoreQos2Handled(Vec<PacketId>, oneshot::Sender<()>),
    GetStoredPackets(oneshot::Sender<Vec<StoredPacket>>),
    GetQos2Handled(oneshot::Sender<Vec<PacketId>>),
    RegulateForStore(
        Box<v5::PublishPacket>,
        oneshot::Sender<Result<v5::PublishPacket, Error>>,
    ),
    Close(oneshot::Sender<()>),
}

/// Cheap cloneable handle for issuing sends from other tasks, e.g. the
/// broker dispatch path.
#[derive(Clone, Debug)]
pub struct EndpointSender {
    cmd_tx: mpsc::Sender<Command>,
}

impl EndpointSender {
    /// Send one packet; completes once the endpoint accepted it.
    ///
    /// # Errors
    ///
    /// Returns error if the endpoint is gone or refused the packet.
    pub async fn send(&self, packet: Packet) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Send(packet, tx)).await?;
        rx.await?
    }

    /// Ask the endpoint to shut the stream down.
    ///
    /// # Errors
    ///
    /// Returns error if the endpoint is already gone.
    pub async fn close(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Close(tx)).await?;
        // The endpoint may exit without answering once the stream is torn
        // down; that still counts as closed.
        let _ = rx.await;
        Ok(())
    }

    /// Return `packet_id` to the pool.
    ///
    /// # Errors
    ///
    /// Returns error if the endpoint is gone.
    pub async fn release_id(&self, packet_id: PacketId) -> Result<bool, Error> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::ReleaseId(packet_id, tx))
            .await?;
        Ok(rx.await?)
    }

    /// Take the lowest free packet id without waiting.
    ///
    /// # Errors
    ///
    /// Returns `PacketIdExhausted` when every id is in flight.
    pub async fn acquire_unique_id(&self) -> Result<PacketId, Error> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::AcquireId(tx)).await?;
        rx.await?.ok_or_else(|| {
            Error::new(
                ErrorKind::PacketIdExhausted,
                "packet identifier fully used",
            )
        })
    }

    /// Copy of all in-flight packets, used when a session migrates away
    /// from this endpoint.
    ///
    /// # Errors
    ///
    /// Returns error if the endpoint is gone.
    pub async fn get_stored_packets(&self) -> Result<Vec<StoredPacket>, Error> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::GetStoredPackets(tx)).await?;
        Ok(rx.await?)
    }

    /// Receiver-side `QoS` 2 ids not yet released.
    ///
    /// # Errors
    ///
    /// Returns error if the endpoint is gone.
    pub async fn get_qos2_handled(&self) -> Result<Vec<PacketId>, Error> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::GetQos2Handled(tx)).await?;
        Ok(rx.await?)
    }
}

/// One mqtt endpoint: a connection bound to a byte stream.
///
/// Receiving is single-consumer and borrows the endpoint mutably; every
/// other operation goes through cloneable command handles and may be
/// issued concurrently. Dropping the endpoint cancels all pending
/// operations and closes the connection.
#[derive(Debug)]
pub struct Endpoint {
    cmd_tx: mpsc::Sender<Command>,
    packet_rx: mpsc::Receiver<Result<Packet, Error>>,
}

impl Endpoint {
    /// Bind `stream` and start the driver task.
    pub fn new<S>(stream: S, role: Role, config: EndpointConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut conn = Connection::new(role);
        conn.set_auto_pub_response(config.auto_pub_response);
        conn.set_auto_ping_response(config.auto_ping_response);
        conn.set_auto_map_topic_alias_send(config.auto_map_topic_alias_send);
        conn.set_auto_replace_topic_alias_send(config.auto_replace_topic_alias_send);
        conn.set_offline_publish(config.offline_publish);
        conn.set_pingresp_recv_timeout(config.pingresp_recv_timeout);
        if config.pingreq_send_interval.is_some() {
            conn.set_pingreq_send_interval(config.pingreq_send_interval);
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let (packet_tx, packet_rx) = mpsc::channel(PACKET_QUEUE_SIZE);

        let driver = Driver {
            conn,
            stream,
            cmd_rx,
            packet_tx: Some(packet_tx),
            id_waiters: VecDeque::new(),
            deadlines: [None; 3],
            out_buf: Vec::new(),
            read_buffer_size: config.read_buffer_size.max(1),
            bulk_write: config.bulk_write,
            closing: false,
            stream_alive: true,
        };
        tokio::spawn(driver.run());

        Self { cmd_tx, packet_rx }
    }

    /// Get a cloneable handle for concurrent senders.
    #[must_use]
    pub fn sender(&self) -> EndpointSender {
        EndpointSender {
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    /// Send one packet in FIFO order with all other senders.
    ///
    /// # Errors
    ///
    /// Returns error if the connection refuses the packet or is gone.
    pub async fn send(&self, packet: Packet) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Send(packet, tx)).await?;
        rx.await?
    }

    /// Receive the next packet.
    ///
    /// # Errors
    ///
    /// Returns error if the stream failed or the connection closed.
    pub async fn recv(&mut self) -> Result<Packet, Error> {
        match self.packet_rx.recv().await {
            Some(result) => result,
            None => Err(Error::new(ErrorKind::NotConnected, "connection closed")),
        }
    }

    /// Receive the next packet accepted by `filter`; skipped packets are
    /// dropped and the receive re-arms.
    ///
    /// # Errors
    ///
    /// Returns error if the stream failed or the connection closed.
    pub async fn recv_filter<F>(&mut self, mut filter: F) -> Result<Packet, Error>
    where
        F: FnMut(&Packet) -> bool,
    {
        loop {
            let packet = self.recv().await?;
            if filter(&packet) {
                return Ok(packet);
            }
            log::debug!("endpoint: recv filter skipped {:?}", packet.packet_type());
        }
    }

    /// Shut the stream down and cancel pending operations.
    ///
    /// # Errors
    ///
    /// Returns error if the endpoint is already gone.
    pub async fn close(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Close(tx)).await?;
        let _ = rx.await;
        Ok(())
    }

    /// Take the lowest free packet id without waiting.
    ///
    /// # Errors
    ///
    /// Returns `PacketIdExhausted` when every id is in flight.
    pub async fn acquire_unique_id(&self) -> Result<PacketId, Error> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::AcquireId(tx)).await?;
        rx.await?.ok_or_else(|| {
            Error::new(
                ErrorKind::PacketIdExhausted,
                "packet identifier fully used",
            )
        })
    }

    /// Take the lowest free packet id, waiting in FIFO order for a
    /// release when the pool is exhausted. Dropping the future unlinks
    /// the waiter without touching pool state.
    ///
    /// # Errors
    ///
    /// Returns error if the endpoint is gone.
    pub async fn acquire_unique_id_wait(&self) -> Result<PacketId, Error> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::AcquireIdWait(tx)).await?;
        Ok(rx.await?)
    }

    /// Reserve a peer-chosen id, used during restore.
    ///
    /// # Errors
    ///
    /// Returns error if the endpoint is gone.
    pub async fn register_id(&self, packet_id: PacketId) -> Result<bool, Error> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::RegisterId(packet_id, tx))
            .await?;
        Ok(rx.await?)
    }

    /// Return `packet_id` to the pool, waking one waiter.
    ///
    /// # Errors
    ///
    /// Returns error if the endpoint is gone.
    pub async fn release_id(&self, packet_id: PacketId) -> Result<bool, Error> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::ReleaseId(packet_id, tx))
            .await?;
        Ok(rx.await?)
    }

    /// Inject persisted in-flight packets before the first connect.
    ///
    /// # Errors
    ///
    /// Returns error if the endpoint is gone.
    pub async fn restore_packets(&self, packets: Vec<StoredPacket>) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::RestorePackets(packets, tx))
            .await?;
        Ok(rx.await?)
    }

    /// Inject persisted receiver-side `QoS` 2 ids before the first
    /// connect.
    ///
    /// # Errors
    ///
    /// Returns error if the endpoint is gone.
    pub async fn restore_qos2_handled(&self, ids: Vec<PacketId>) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::RestoreQos2Handled(ids, tx))
            .await?;
        Ok(rx.await?)
    }

    /// Copy of all in-flight packets, for host-side persistence.
    ///
    /// # Errors
    ///
    /// Returns error if the endpoint is gone.
    pub async fn get_stored_packets(&self) -> Result<Vec<StoredPacket>, Error> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::GetStoredPackets(tx)).await?;
        Ok(rx.await?)
    }

    /// Receiver-side `QoS` 2 ids not yet released.
    ///
    /// # Errors
    ///
    /// Returns error if the endpoint is gone.
    pub async fn get_qos2_handled(&self) -> Result<Vec<PacketId>, Error> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::GetQos2Handled(tx)).await?;
        Ok(rx.await?)
    }

    /// Resolve any topic alias in `publish` so the packet can be stored
    /// outside this connection.
    ///
    /// # Errors
    ///
    /// Returns error if the alias is unknown or the endpoint is gone.
    pub async fn regulate_for_store(
        &self,
        publish: v5::PublishPacket,
    ) -> Result<v5::PublishPacket, Error> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::RegulateForStore(Box::new(publish), tx))
            .await?;
        rx.await?
    }
}

/// A sender not backed by any endpoint; every operation fails with a
/// channel error. Only used by table bookkeeping tests.
#[cfg(test)]
pub(crate) fn detached_sender() -> EndpointSender {
    let (cmd_tx, _cmd_rx) = mpsc::channel(1);
    EndpointSender { cmd_tx }
}

struct Driver<S> {
    conn: Connection,
    stream: S,
    cmd_rx: mpsc::Receiver<Command>,

    /// `None` once the stream is gone; receivers observe end of stream.
    packet_tx: Option<mpsc::Sender<Result<Packet, Error>>>,

    /// FIFO of callers suspended in `acquire_unique_id_wait`.
    id_waiters: VecDeque<oneshot::Sender<PacketId>>,

    /// Pending deadline per timer kind, indexed by [`timer_index`].
    deadlines: [Option<Instant>; 3],

    out_buf: Vec<u8>,
    read_buffer_size: usize,
    bulk_write: bool,
    closing: bool,
    stream_alive: bool,
}

const fn timer_index(kind: TimerKind) -> usize {
    match kind {
        TimerKind::PingreqSend => 0,
        TimerKind::PingreqRecv => 1,
        TimerKind::PingrespRecv => 2,
    }
}

const TIMER_KINDS: [TimerKind; 3] = [
    TimerKind::PingreqSend,
    TimerKind::PingreqRecv,
    TimerKind::PingrespRecv,
];

impl<S> Driver<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn run(mut self) {
        let mut read_buf = vec![0u8; self.read_buffer_size];
        loop {
            if let Err(err) = self.flush().await {
                log::warn!("endpoint: write failed: {err}");
                self.teardown().await;
            }
            if self.closing {
                self.teardown().await;
            }

            let next_deadline = self.deadlines.iter().flatten().min().copied();

            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            self.handle_command(cmd).await;
                            if self.bulk_write {
                                while let Ok(cmd) = self.cmd_rx.try_recv() {
                                    self.handle_command(cmd).await;
                                }
                            }
                        }
                        // Every handle dropped; nothing can ask for
                        // session state any more.
                        None => {
                            self.teardown().await;
                            return;
                        }
                    }
                }
                read = self.stream.read(&mut read_buf), if self.stream_alive => {
                    match read {
                        Ok(0) => {
                            self.teardown().await;
                        }
                        Ok(n) => {
                            let events = self.conn.recv_bytes(&read_buf[..n]);
                            self.process_events(events).await;
                        }
                        Err(err) => {
                            if let Some(tx) = &self.packet_tx {
                                let _ = tx.send(Err(Error::from(err))).await;
                            }
                            self.teardown().await;
                        }
                    }
                }
                () = tokio::time::sleep_until(next_deadline.unwrap_or_else(Instant::now)),
                        if next_deadline.is_some() => {
                    let now = Instant::now();
                    for kind in TIMER_KINDS {
                        let idx = timer_index(kind);
                        if self.deadlines[idx].is_some_and(|deadline| deadline <= now) {
                            self.deadlines[idx] = None;
                            let events = self.conn.notify_timer_fired(kind);
                            self.process_events(events).await;
                        }
                    }
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Send(packet, reply) => {
                match self.conn.send(packet) {
                    Ok(events) => {
                        self.process_events(events).await;
                        let _ = reply.send(Ok(()));
                    }
                    Err(err) => {
                        let _ = reply.send(Err(err));
                    }
                }
            }
            Command::AcquireId(reply) => {
                let _ = reply.send(self.conn.acquire_packet_id());
            }
            Command::AcquireIdWait(reply) => {
                if let Some(id) = self.conn.acquire_packet_id() {
                    if let Err(id) = reply.send(id) {
                        // Caller went away between asking and answering.
                        self.conn.release_packet_id(id);
                    }
                } else {
                    self.id_waiters.push_back(reply);
                }
            }
            Command::RegisterId(id, reply) => {
                let _ = reply.send(self.conn.register_packet_id(id));
            }
            Command::ReleaseId(id, reply) => {
                let was_used = self.conn.release_packet_id(id);
                self.wake_id_waiter();
                let _ = reply.send(was_used);
            }
            Command::RestorePackets(packets, reply) => {
                self.conn.restore_packets(packets);
                let _ = reply.send(());
            }
            Command::RestoreQos2Handled(ids, reply) => {
                self.conn.restore_qos2_handled(ids);
                let _ = reply.send(());
            }
            Command::GetStoredPackets(reply) => {
                let _ = reply.send(self.conn.get_stored_packets());
            }
            Command::GetQos2Handled(reply) => {
                let _ = reply.send(self.conn.get_qos2_handled());
            }
            Command::RegulateForStore(publish, reply) => {
                let _ = reply.send(self.conn.regulate_publish_for_store(*publish));
            }
            Command::Close(reply) => {
                self.closing = true;
                let _ = reply.send(());
            }
        }
    }

    async fn process_events(&mut self, events: Vec<Event>) {
        for event in events {
            match event {
                Event::RecvPacket(packet) => {
                    // A closed receive side only means nobody cares.
                    if let Some(tx) = &self.packet_tx {
                        let _ = tx.send(Ok(packet)).await;
                    }
                }
                Event::SendPacket(packet) => {
                    if let Err(err) = packet.encode(&mut self.out_buf) {
                        log::error!("endpoint: failed to encode packet: {err:?}");
                    }
                }
                Event::Timer(TimerOp::Reset(kind, duration)) => {
                    self.deadlines[timer_index(kind)] = Some(Instant::now() + duration);
                }
                Event::Timer(TimerOp::Cancel(kind)) => {
                    self.deadlines[timer_index(kind)] = None;
                }
                Event::ReleasePacketId(_id) => {
                    self.wake_id_waiter();
                }
                Event::Error(err) => {
                    if let Some(tx) = &self.packet_tx {
                        let _ = tx.send(Err(err)).await;
                    }
                }
                Event::Close => {
                    self.closing = true;
                }
            }
        }
    }

    /// Hand a freshly freed id to the first still-alive waiter.
    fn wake_id_waiter(&mut self) {
        while let Some(waiter) = self.id_waiters.pop_front() {
            let Some(id) = self.conn.acquire_packet_id() else {
                self.id_waiters.push_front(waiter);
                return;
            };
            match waiter.send(id) {
                Ok(()) => return,
                Err(_id) => {
                    // Cancelled waiter; free the id and try the next one.
                    self.conn.release_packet_id(id);
                }
            }
        }
    }

    async fn flush(&mut self) -> Result<(), Error> {
        if self.out_buf.is_empty() {
            return Ok(());
        }
        if !self.stream_alive {
            self.out_buf.clear();
            return Ok(());
        }
        let buf = std::mem::take(&mut self.out_buf);
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Stream is done: flush what we can, shut it down and drop the
    /// packet channel, but keep serving state commands so the host can
    /// snapshot the session before dropping the endpoint.
    async fn teardown(&mut self) {
        if self.stream_alive {
            let _ = self.flush().await;
            let _ = self.stream.shutdown().await;
        }
        self.stream_alive = false;
        self.closing = false;
        self.out_buf.clear();
        self.packet_tx = None;
        if !matches!(
            self.conn.status(),
            crate::connection::Status::Disconnected
        ) {
            let events = self.conn.notify_closed();
            self.process_events(events).await;
        }
        self.id_waiters.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::{v3, QoS};

    #[tokio::test]
    async fn test_endpoint_handshake_over_duplex() {
        let (client_stream, server_stream) = tokio::io::duplex(4096);
        let client = Endpoint::new(client_stream, Role::Client, EndpointConfig::default());
        let mut server = Endpoint::new(
            server_stream,
            Role::Server,
            EndpointConfig::broker(),
        );

        let mut connect = v3::ConnectPacket::new("c1").unwrap();
        let mut flags = codec::ConnectFlags::default();
        flags.set_clean_session(true);
        connect.set_connect_flags(flags);
        client.send(connect.into()).await.unwrap();

        let packet = server.recv().await.unwrap();
        assert!(matches!(packet, Packet::ConnectV3(_)));
    }

    #[tokio::test]
    async fn test_acquire_unique_id_wait_fifo() {
        let (stream, _other) = tokio::io::duplex(64);
        let endpoint = Endpoint::new(stream, Role::Client, EndpointConfig::default());

        let first = endpoint.acquire_unique_id().await.unwrap();
        assert_eq!(first, PacketId::new(1));

        // Exhaust the pool artificially by registering everything else.
        for id in 2..=u16::MAX {
            assert!(endpoint.register_id(PacketId::new(id)).await.unwrap());
        }
        assert!(endpoint.acquire_unique_id().await.is_err());

        let sender = endpoint.sender();
        let waiter = tokio::spawn(async move {
            let (tx, rx) = oneshot::channel();
            sender
                .cmd_tx
                .send(Command::AcquireIdWait(tx))
                .await
                .map_err(Error::from)?;
            rx.await.map_err(Error::from)
        });

        // Give the waiter time to enqueue, then release.
        tokio::time::sleep(Duration::from_millis(20)).await;
        endpoint.release_id(first).await.unwrap();
        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got, PacketId::new(1));
    }

    #[tokio::test]
    async fn test_send_requires_connect_first() {
        let (stream, _other) = tokio::io::duplex(64);
        let endpoint = Endpoint::new(stream, Role::Client, EndpointConfig::default());
        let publish = v3::PublishPacket::new("t", QoS::AtMostOnce, b"x").unwrap();
        let err = endpoint.send(publish.into()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotConnected);
    }
}
