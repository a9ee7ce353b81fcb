//! Selective Forwarding Unit Session Manager
//!
//! Owns rooms (one router each) and every transport, producer and consumer,
//! indexed by id and by owning connection.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use super::engine::{DtlsParameters, IceParameters, MediaEngine, TransportOptions};
use super::error::VoiceError;
use super::router::MediaRouter;
use super::rtp::{MediaKind, RtpCapabilities, RtpParameters};
use super::{ConsumerId, ProducerId, RoomId, TransportId};
use crate::config::Config;
use crate::ws::{ConnId, ServerEvent, Session};

/// Default maximum participants per room.
pub const DEFAULT_MAX_PARTICIPANTS: usize = 25;

/// A connection joined to a room's broadcast group.
#[derive(Debug, Clone)]
pub struct RoomMember {
    /// Identity of the connection when it joined, if it had one.
    pub username: Option<String>,
    signal_tx: mpsc::Sender<ServerEvent>,
}

/// Media room with its router and broadcast group.
#[derive(Debug)]
pub struct Room {
    /// Room ID.
    pub room_id: RoomId,
    /// Codec authority for this room.
    pub router: MediaRouter,
    /// Joined connections.
    members: RwLock<HashMap<ConnId, RoomMember>>,
    /// Maximum participants allowed.
    pub max_participants: usize,
}

impl Room {
    /// Create a new room.
    #[must_use]
    pub fn new(room_id: RoomId, max_participants: usize) -> Self {
        Self {
            router: MediaRouter::new(),
            room_id,
            members: RwLock::new(HashMap::new()),
            max_participants,
        }
    }

    /// Join a connection. Re-joining refreshes its entry.
    pub async fn add_member(
        &self,
        conn_id: ConnId,
        username: Option<String>,
        signal_tx: mpsc::Sender<ServerEvent>,
    ) -> Result<bool, VoiceError> {
        let mut members = self.members.write().await;

        if !members.contains_key(&conn_id) && members.len() >= self.max_participants {
            return Err(VoiceError::RoomFull {
                max_participants: self.max_participants,
            });
        }

        let added = members
            .insert(conn_id, RoomMember { username, signal_tx })
            .is_none();
        Ok(added)
    }

    /// Remove a connection from the broadcast group.
    pub async fn remove_member(&self, conn_id: ConnId) -> bool {
        self.members.write().await.remove(&conn_id).is_some()
    }

    /// Whether a connection is joined.
    pub async fn is_member(&self, conn_id: ConnId) -> bool {
        self.members.read().await.contains_key(&conn_id)
    }

    /// Username a member joined with.
    pub async fn member_name(&self, conn_id: ConnId) -> Option<String> {
        self.members
            .read()
            .await
            .get(&conn_id)
            .and_then(|m| m.username.clone())
    }

    /// Broadcast an event to all members except one.
    ///
    /// Never waits on a member's queue: a full queue drops the event for that
    /// member only.
    pub async fn broadcast_except(&self, exclude: ConnId, event: ServerEvent) -> usize {
        let senders: Vec<(ConnId, mpsc::Sender<ServerEvent>)> = {
            let members = self.members.read().await;
            members
                .iter()
                .filter(|(id, _)| **id != exclude)
                .map(|(id, member)| (*id, member.signal_tx.clone()))
                .collect()
        };

        let mut delivered = 0;
        for (conn_id, tx) in senders {
            match tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(conn_id = %conn_id, "Room member queue full, dropping event");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(conn_id = %conn_id, "Room member channel closed");
                }
            }
        }
        delivered
    }

    /// Get member count.
    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    /// Check if room has no members.
    pub async fn is_empty(&self) -> bool {
        self.members.read().await.is_empty()
    }
}

/// Result of a successful `consume`, sent back to the subscriber.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerOptions {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

/// What a teardown released.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Teardown {
    pub producers: usize,
    pub consumers: usize,
    pub transports: usize,
}

struct TransportEntry {
    room_id: RoomId,
    owner: ConnId,
    next_mid: u32,
    producers: HashSet<ProducerId>,
    consumers: HashSet<ConsumerId>,
}

struct ProducerEntry {
    room_id: RoomId,
    owner: ConnId,
    transport_id: TransportId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    consumers: HashSet<ConsumerId>,
}

struct ConsumerEntry {
    owner: ConnId,
    transport_id: TransportId,
    producer_id: ProducerId,
    paused: bool,
}

/// Id lookup for every live resource plus the per-connection cascade index.
#[derive(Default)]
struct MediaIndex {
    transports: HashMap<TransportId, TransportEntry>,
    producers: HashMap<ProducerId, ProducerEntry>,
    consumers: HashMap<ConsumerId, ConsumerEntry>,
    by_connection: HashMap<ConnId, HashSet<TransportId>>,
}

impl MediaIndex {
    fn owned_transport(&self, conn_id: ConnId, transport_id: TransportId) -> Option<&TransportEntry> {
        self.transports
            .get(&transport_id)
            .filter(|t| t.owner == conn_id)
    }

    fn room_in_use(&self, room_id: &str) -> bool {
        self.transports.values().any(|t| t.room_id == room_id)
    }

    /// Resources owned by `conn_id`, optionally limited to one room.
    fn owned_by(
        &self,
        conn_id: ConnId,
        room_id: Option<&str>,
    ) -> (Vec<ProducerId>, Vec<ConsumerId>, Vec<TransportId>) {
        let mut producers = Vec::new();
        let mut consumers = Vec::new();
        let mut transports = Vec::new();

        for transport_id in self.by_connection.get(&conn_id).into_iter().flatten() {
            let Some(entry) = self.transports.get(transport_id) else {
                continue;
            };
            if room_id.is_some_and(|r| r != entry.room_id) {
                continue;
            }
            producers.extend(entry.producers.iter().copied());
            consumers.extend(entry.consumers.iter().copied());
            transports.push(*transport_id);
        }

        (producers, consumers, transports)
    }

    fn unlink_consumer(&mut self, consumer_id: ConsumerId) -> Option<ConsumerEntry> {
        let entry = self.consumers.remove(&consumer_id)?;
        if let Some(transport) = self.transports.get_mut(&entry.transport_id) {
            transport.consumers.remove(&consumer_id);
        }
        if let Some(producer) = self.producers.get_mut(&entry.producer_id) {
            producer.consumers.remove(&consumer_id);
        }
        Some(entry)
    }
}

/// SFU server managing all media rooms.
pub struct SfuServer {
    /// Active rooms.
    rooms: RwLock<HashMap<RoomId, Arc<Room>>>,
    /// Resource index. Lock order: `rooms`, then `index`, then a room's members.
    index: RwLock<MediaIndex>,
    /// Allocation backend.
    engine: Arc<dyn MediaEngine>,
    /// Broadcast group capacity.
    max_participants: usize,
}

impl SfuServer {
    /// Create a new SFU server.
    pub fn new(engine: Arc<dyn MediaEngine>, max_participants: usize) -> Self {
        info!(max_participants, "SFU server initialized");
        Self {
            rooms: RwLock::new(HashMap::new()),
            index: RwLock::new(MediaIndex::default()),
            engine,
            max_participants,
        }
    }

    /// Create an SFU server sized from configuration.
    pub fn from_config(engine: Arc<dyn MediaEngine>, config: &Config) -> Self {
        Self::new(engine, config.max_room_participants)
    }

    /// Get or create a room.
    pub async fn get_or_create_room(&self, room_id: &str) -> Arc<Room> {
        if let Some(room) = self.rooms.read().await.get(room_id) {
            return room.clone();
        }

        let mut rooms = self.rooms.write().await;
        rooms
            .entry(room_id.to_string())
            .or_insert_with(|| {
                debug!(room_id = %room_id, "Created new media room");
                Arc::new(Room::new(room_id.to_string(), self.max_participants))
            })
            .clone()
    }

    /// Get a room by ID.
    pub async fn get_room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Router capabilities of a room. Asking does not create the room.
    pub async fn rtp_capabilities(&self, room_id: &str) -> RtpCapabilities {
        match self.get_room(room_id).await {
            Some(room) => room.router.rtp_capabilities().clone(),
            None => MediaRouter::new().rtp_capabilities().clone(),
        }
    }

    /// Join a connection to a room's broadcast group.
    pub async fn join_room(&self, session: &Session, room_id: &str) -> Result<Arc<Room>, VoiceError> {
        loop {
            let room = self.get_or_create_room(room_id).await;
            let added = room
                .add_member(
                    session.conn_id,
                    session.identity().map(str::to_string),
                    session.tx.clone(),
                )
                .await?;

            // The room may have been torn down between lookup and join.
            let current = self
                .rooms
                .read()
                .await
                .get(room_id)
                .is_some_and(|r| Arc::ptr_eq(r, &room));
            if current {
                if added {
                    info!(room_id = %room_id, conn_id = %session.conn_id, "Joined media room");
                }
                return Ok(room);
            }
            room.remove_member(session.conn_id).await;
        }
    }

    /// Allocate a transport in `room_id` for the session.
    pub async fn create_transport(
        &self,
        session: &Session,
        room_id: &str,
    ) -> Result<TransportOptions, VoiceError> {
        let room = self.join_room(session, room_id).await?;
        let conn_id = session.conn_id;

        let options = self.engine.create_transport(room_id).await?;

        let committed = {
            let mut index = self.index.write().await;
            if room.is_member(conn_id).await {
                index.transports.insert(
                    options.id,
                    TransportEntry {
                        room_id: room_id.to_string(),
                        owner: conn_id,
                        next_mid: 0,
                        producers: HashSet::new(),
                        consumers: HashSet::new(),
                    },
                );
                index
                    .by_connection
                    .entry(conn_id)
                    .or_default()
                    .insert(options.id);
                true
            } else {
                false
            }
        };

        if !committed {
            self.engine.close_transport(options.id).await;
            return Err(VoiceError::ConnectionClosed);
        }

        debug!(room_id = %room_id, conn_id = %conn_id, transport_id = %options.id, "Transport created");
        Ok(options)
    }

    /// Complete the DTLS handshake of an owned transport.
    pub async fn connect_transport(
        &self,
        conn_id: ConnId,
        transport_id: TransportId,
        dtls_parameters: &DtlsParameters,
        ice_parameters: Option<&IceParameters>,
    ) -> Result<(), VoiceError> {
        if self.index.read().await.owned_transport(conn_id, transport_id).is_none() {
            return Err(VoiceError::TransportNotFound(transport_id));
        }

        self.engine
            .connect_transport(transport_id, dtls_parameters, ice_parameters)
            .await?;

        debug!(conn_id = %conn_id, transport_id = %transport_id, "Transport connected");
        Ok(())
    }

    /// Publish a stream on an owned transport and announce it to the room.
    pub async fn produce(
        &self,
        conn_id: ConnId,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, VoiceError> {
        let room_id = self
            .index
            .read()
            .await
            .owned_transport(conn_id, transport_id)
            .map(|t| t.room_id.clone())
            .ok_or(VoiceError::TransportNotFound(transport_id))?;
        let room = self
            .get_room(&room_id)
            .await
            .ok_or(VoiceError::TransportNotFound(transport_id))?;

        room.router.validate_producer(kind, &rtp_parameters)?;

        let producer_id = self
            .engine
            .create_producer(transport_id, kind, &rtp_parameters)
            .await?;

        let committed = {
            let mut index = self.index.write().await;
            match index.transports.get_mut(&transport_id) {
                Some(transport) => {
                    transport.producers.insert(producer_id);
                    index.producers.insert(
                        producer_id,
                        ProducerEntry {
                            room_id: room_id.clone(),
                            owner: conn_id,
                            transport_id,
                            kind,
                            rtp_parameters,
                            consumers: HashSet::new(),
                        },
                    );
                    true
                }
                None => false,
            }
        };

        if !committed {
            self.engine.close_producer(producer_id).await;
            return Err(VoiceError::TransportNotFound(transport_id));
        }

        info!(room_id = %room_id, conn_id = %conn_id, producer_id = %producer_id, "Producer created");

        // Announce only once the producer is consumable.
        room.broadcast_except(
            conn_id,
            ServerEvent::NewProducer {
                room_id: room_id.clone(),
                producer_id,
                kind,
                username: room.member_name(conn_id).await,
            },
        )
        .await;

        Ok(producer_id)
    }

    /// Forward `producer_id` to the owner of a receive transport. Starts paused.
    pub async fn consume(
        &self,
        conn_id: ConnId,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerOptions, VoiceError> {
        let (room_id, kind, producer_parameters, mid) = {
            let mut index = self.index.write().await;
            let room_id = index
                .owned_transport(conn_id, transport_id)
                .map(|t| t.room_id.clone())
                .ok_or(VoiceError::TransportNotFound(transport_id))?;

            let (kind, parameters) = index
                .producers
                .get(&producer_id)
                .filter(|p| p.room_id == room_id)
                .map(|p| (p.kind, p.rtp_parameters.clone()))
                .ok_or(VoiceError::ProducerNotFound(producer_id))?;

            let mid = index.transports.get_mut(&transport_id).map_or(0, |t| {
                let mid = t.next_mid;
                t.next_mid += 1;
                mid
            });
            (room_id, kind, parameters, mid)
        };

        let room = self
            .get_room(&room_id)
            .await
            .ok_or(VoiceError::TransportNotFound(transport_id))?;

        let rtp_parameters = room
            .router
            .consumer_parameters(kind, &producer_parameters, rtp_capabilities, mid.to_string())
            .ok_or(VoiceError::CannotConsume { producer_id })?;

        let consumer_id = self
            .engine
            .create_consumer(transport_id, producer_id, &rtp_parameters)
            .await?;

        let outcome = {
            let mut index = self.index.write().await;
            if !index.transports.contains_key(&transport_id) {
                Err(VoiceError::TransportNotFound(transport_id))
            } else if let Some(producer) = index.producers.get_mut(&producer_id) {
                producer.consumers.insert(consumer_id);
                if let Some(transport) = index.transports.get_mut(&transport_id) {
                    transport.consumers.insert(consumer_id);
                }
                index.consumers.insert(
                    consumer_id,
                    ConsumerEntry {
                        owner: conn_id,
                        transport_id,
                        producer_id,
                        paused: true,
                    },
                );
                Ok(())
            } else {
                Err(VoiceError::ProducerNotFound(producer_id))
            }
        };

        if let Err(e) = outcome {
            // Parent went away during allocation.
            self.engine.close_consumer(consumer_id).await;
            return Err(e);
        }

        debug!(
            room_id = %room_id,
            conn_id = %conn_id,
            producer_id = %producer_id,
            consumer_id = %consumer_id,
            "Consumer created (paused)"
        );

        Ok(ConsumerOptions {
            id: consumer_id,
            producer_id,
            kind,
            rtp_parameters,
        })
    }

    /// Unpause an owned consumer.
    pub async fn resume_consumer(&self, conn_id: ConnId, consumer_id: ConsumerId) -> Result<(), VoiceError> {
        let owned = self
            .index
            .read()
            .await
            .consumers
            .get(&consumer_id)
            .is_some_and(|c| c.owner == conn_id);
        if !owned {
            return Err(VoiceError::ConsumerNotFound(consumer_id));
        }

        self.engine.resume_consumer(consumer_id).await?;

        match self.index.write().await.consumers.get_mut(&consumer_id) {
            Some(consumer) => consumer.paused = false,
            None => return Err(VoiceError::ConsumerNotFound(consumer_id)),
        }

        debug!(conn_id = %conn_id, consumer_id = %consumer_id, "Consumer resumed");
        Ok(())
    }

    /// Close an owned producer.
    pub async fn close_producer(&self, conn_id: ConnId, producer_id: ProducerId) -> Result<(), VoiceError> {
        let owned = self
            .index
            .read()
            .await
            .producers
            .get(&producer_id)
            .is_some_and(|p| p.owner == conn_id);
        if !owned {
            return Err(VoiceError::ProducerNotFound(producer_id));
        }

        self.release_producer(producer_id).await;
        Ok(())
    }

    /// Close this connection's resources in one room and leave its broadcast group.
    pub async fn leave_room(&self, conn_id: ConnId, room_id: &str) -> Teardown {
        let teardown = self.release_owned(conn_id, Some(room_id)).await;

        if let Some(room) = self.get_room(room_id).await {
            if room.remove_member(conn_id).await {
                info!(room_id = %room_id, conn_id = %conn_id, "Left media room");
            }
        }
        self.cleanup_room_if_empty(room_id).await;

        teardown
    }

    /// Close everything a connection owns, in producer, consumer, transport
    /// order, and drop it from every room. Safe to call repeatedly.
    pub async fn close_connection(&self, conn_id: ConnId) -> Teardown {
        let teardown = self.release_owned(conn_id, None).await;

        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        for room in rooms {
            if room.remove_member(conn_id).await {
                debug!(room_id = %room.room_id, conn_id = %conn_id, "Removed connection from room");
            }
            self.cleanup_room_if_empty(&room.room_id).await;
        }

        if teardown != Teardown::default() {
            info!(
                conn_id = %conn_id,
                producers = teardown.producers,
                consumers = teardown.consumers,
                transports = teardown.transports,
                "Released media resources"
            );
        }
        teardown
    }

    async fn release_owned(&self, conn_id: ConnId, room_id: Option<&str>) -> Teardown {
        let (producers, consumers, transports) = self.index.read().await.owned_by(conn_id, room_id);
        let mut teardown = Teardown::default();

        for producer_id in producers {
            if self.release_producer(producer_id).await {
                teardown.producers += 1;
            }
        }
        for consumer_id in consumers {
            if self.release_consumer(consumer_id).await {
                teardown.consumers += 1;
            }
        }
        for transport_id in transports {
            if self.release_transport(transport_id).await {
                teardown.transports += 1;
            }
        }

        teardown
    }

    /// Drop a producer and its consumers, then tell the room. Returns false if
    /// another path already closed it.
    async fn release_producer(&self, producer_id: ProducerId) -> bool {
        let (entry, consumers) = {
            let mut index = self.index.write().await;
            let Some(entry) = index.producers.remove(&producer_id) else {
                return false;
            };
            if let Some(transport) = index.transports.get_mut(&entry.transport_id) {
                transport.producers.remove(&producer_id);
            }
            let consumers: Vec<ConsumerId> = entry
                .consumers
                .iter()
                .copied()
                .filter(|c| index.unlink_consumer(*c).is_some())
                .collect();
            (entry, consumers)
        };

        for consumer_id in &consumers {
            self.engine.close_consumer(*consumer_id).await;
        }
        self.engine.close_producer(producer_id).await;

        info!(
            room_id = %entry.room_id,
            producer_id = %producer_id,
            consumers = consumers.len(),
            "Producer closed"
        );

        if let Some(room) = self.get_room(&entry.room_id).await {
            room.broadcast_except(
                entry.owner,
                ServerEvent::ProducerClosed {
                    room_id: entry.room_id.clone(),
                    producer_id,
                },
            )
            .await;
        }
        true
    }

    async fn release_consumer(&self, consumer_id: ConsumerId) -> bool {
        let removed = self.index.write().await.unlink_consumer(consumer_id).is_some();
        if removed {
            self.engine.close_consumer(consumer_id).await;
        }
        removed
    }

    async fn release_transport(&self, transport_id: TransportId) -> bool {
        let leftovers = {
            let mut index = self.index.write().await;
            let Some(entry) = index.transports.remove(&transport_id) else {
                return false;
            };
            if let Some(owned) = index.by_connection.get_mut(&entry.owner) {
                owned.remove(&transport_id);
                if owned.is_empty() {
                    index.by_connection.remove(&entry.owner);
                }
            }
            let consumers: Vec<ConsumerId> = entry
                .consumers
                .iter()
                .copied()
                .filter(|c| index.unlink_consumer(*c).is_some())
                .collect();
            consumers
        };

        for consumer_id in leftovers {
            self.engine.close_consumer(consumer_id).await;
        }
        self.engine.close_transport(transport_id).await;
        true
    }

    /// Remove a room once nobody is joined and nothing in it is allocated.
    pub async fn cleanup_room_if_empty(&self, room_id: &str) {
        let mut rooms = self.rooms.write().await;

        let Some(room) = rooms.get(room_id).cloned() else {
            return;
        };
        let in_use = self.index.read().await.room_in_use(room_id);
        if !in_use && room.is_empty().await {
            rooms.remove(room_id);
            debug!(room_id = %room_id, "Removed empty media room");
        }
    }

    /// Close every resource and drop every room.
    pub async fn shutdown(&self) {
        let index = std::mem::take(&mut *self.index.write().await);
        let room_count = {
            let mut rooms = self.rooms.write().await;
            let count = rooms.len();
            rooms.clear();
            count
        };

        for consumer_id in index.consumers.keys() {
            self.engine.close_consumer(*consumer_id).await;
        }
        for producer_id in index.producers.keys() {
            self.engine.close_producer(*producer_id).await;
        }
        for transport_id in index.transports.keys() {
            self.engine.close_transport(*transport_id).await;
        }

        info!(
            rooms = room_count,
            transports = index.transports.len(),
            producers = index.producers.len(),
            consumers = index.consumers.len(),
            "SFU drained"
        );
    }

    /// Get active room count.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Whether a transport is indexed.
    pub async fn has_transport(&self, transport_id: TransportId) -> bool {
        self.index.read().await.transports.contains_key(&transport_id)
    }

    /// Whether a producer is indexed.
    pub async fn has_producer(&self, producer_id: ProducerId) -> bool {
        self.index.read().await.producers.contains_key(&producer_id)
    }

    /// Whether a consumer is indexed.
    pub async fn has_consumer(&self, consumer_id: ConsumerId) -> bool {
        self.index.read().await.consumers.contains_key(&consumer_id)
    }

    /// Whether a consumer is indexed and still paused.
    pub async fn is_consumer_paused(&self, consumer_id: ConsumerId) -> Option<bool> {
        self.index
            .read()
            .await
            .consumers
            .get(&consumer_id)
            .map(|c| c.paused)
    }
}
