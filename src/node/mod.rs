//! Control plane: one [`VoiceConnection`] per guild plus the event loop that
//! tears connections down when they ask for it.

pub mod connection;

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use tokio::{
    sync::mpsc::{self, UnboundedReceiver},
    task::JoinHandle,
};
use tracing::{debug, info};

pub use connection::{LoopCommand, VoiceConnection};

use crate::{
    audio::{decoder::MediaOpener, filters::Filters},
    common::{
        errors::NodeError,
        types::{GuildId, SessionId, UserId},
    },
    configs::Config,
    playback::QueueItem,
    protocol::{EventEmitter, NodeEvent, TrackRef},
    sources::MetadataProvider,
    track::TrackDescriptor,
    voice::VoiceServerInfo,
};

type ConnectionMap = DashMap<GuildId, Arc<VoiceConnection>>;

pub struct Node {
    config: Config,
    user_id: UserId,
    opener: Arc<dyn MediaOpener>,
    metadata: Arc<dyn MetadataProvider>,
    emitter: EventEmitter,
    connections: Arc<ConnectionMap>,
    next_id: AtomicU64,
    loop_tx: mpsc::UnboundedSender<LoopCommand>,
    event_loop: JoinHandle<()>,
}

impl Node {
    /// Must be called inside a tokio runtime. Returns the node and the
    /// stream of everything it reports.
    pub fn new(
        config: Config,
        user_id: UserId,
        opener: Arc<dyn MediaOpener>,
        metadata: Arc<dyn MetadataProvider>,
    ) -> (Self, UnboundedReceiver<NodeEvent>) {
        let (emitter, events) = EventEmitter::channel();
        let (loop_tx, loop_rx) = mpsc::unbounded_channel();
        let connections = Arc::new(ConnectionMap::new());
        let event_loop = tokio::spawn(event_loop(connections.clone(), loop_rx));

        let node = Self {
            config,
            user_id,
            opener,
            metadata,
            emitter,
            connections,
            next_id: AtomicU64::new(1),
            loop_tx,
            event_loop,
        };
        (node, events)
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn connection(&self, guild_id: &GuildId) -> Result<Arc<VoiceConnection>, NodeError> {
        self.connections
            .get(guild_id)
            .map(|c| c.value().clone())
            .ok_or(NodeError::NotConnected)
    }

    pub fn guilds(&self) -> Vec<GuildId> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    /// Create the guild's connection if needed and (re)connect its voice
    /// transport to `endpoint`.
    pub fn voice_server_update(
        &self,
        guild_id: GuildId,
        session_id: SessionId,
        token: String,
        endpoint: String,
    ) -> Result<(), NodeError> {
        let connection = match self.connections.get(&guild_id) {
            Some(existing) => existing.value().clone(),
            None => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let created = Arc::new(VoiceConnection::new(
                    id,
                    guild_id.clone(),
                    &self.config.player,
                    self.config.voice.clone(),
                    self.opener.clone(),
                    self.emitter.clone(),
                    self.loop_tx.clone(),
                )?);
                self.connections
                    .entry(guild_id.clone())
                    .or_insert(created)
                    .value()
                    .clone()
            }
        };

        connection.voice_server_update(VoiceServerInfo {
            guild_id,
            user_id: self.user_id,
            session_id,
            token,
            endpoint,
        });
        Ok(())
    }

    pub fn enqueue(&self, guild_id: &GuildId, descriptor: TrackDescriptor) -> Result<usize, NodeError> {
        Ok(self.connection(guild_id)?.enqueue(descriptor))
    }

    /// Look the locator up and queue the result.
    pub async fn enqueue_locator(&self, guild_id: &GuildId, locator: &str) -> Result<usize, NodeError> {
        let connection = self.connection(guild_id)?;
        let descriptor = self.metadata.get_metadata(locator).await?;
        debug!("[{}] Resolved {} to '{}'", guild_id, locator, descriptor.title);
        Ok(connection.enqueue(descriptor))
    }

    pub fn insert(
        &self,
        guild_id: &GuildId,
        index: usize,
        descriptor: TrackDescriptor,
    ) -> Result<usize, NodeError> {
        Ok(self.connection(guild_id)?.insert(index, descriptor))
    }

    pub fn remove(&self, guild_id: &GuildId, index: usize) -> Result<TrackDescriptor, NodeError> {
        self.connection(guild_id)?.remove(index)
    }

    pub fn queue(&self, guild_id: &GuildId) -> Result<Vec<QueueItem>, NodeError> {
        Ok(self.connection(guild_id)?.snapshot())
    }

    pub fn now_playing(&self, guild_id: &GuildId) -> Result<(TrackRef, f64), NodeError> {
        self.connection(guild_id)?
            .now_playing()
            .ok_or(NodeError::NotPlaying)
    }

    pub fn skip(&self, guild_id: &GuildId) -> Result<TrackRef, NodeError> {
        self.connection(guild_id)?.skip()
    }

    pub fn stop(&self, guild_id: &GuildId) -> Result<(), NodeError> {
        self.connection(guild_id)?.stop()
    }

    /// False if already paused.
    pub fn pause(&self, guild_id: &GuildId) -> Result<bool, NodeError> {
        Ok(self.connection(guild_id)?.scheduler().pause())
    }

    pub fn resume(&self, guild_id: &GuildId) -> Result<bool, NodeError> {
        Ok(self.connection(guild_id)?.scheduler().resume())
    }

    pub fn seek(&self, guild_id: &GuildId, seconds: f64) -> Result<f64, NodeError> {
        self.connection(guild_id)?.seek(seconds)
    }

    pub fn set_volume(&self, guild_id: &GuildId, volume: f32) -> Result<(), NodeError> {
        self.connection(guild_id)?.scheduler().set_volume(volume);
        Ok(())
    }

    pub fn set_track_gain(&self, guild_id: &GuildId, gain: f32) -> Result<(), NodeError> {
        self.connection(guild_id)?.set_track_gain(gain)
    }

    pub fn set_filters(&self, guild_id: &GuildId, filters: Filters) -> Result<(), NodeError> {
        self.connection(guild_id)?.set_filters(filters)
    }

    pub fn latency(&self, guild_id: &GuildId) -> Result<Option<Duration>, NodeError> {
        Ok(self.connection(guild_id)?.latency())
    }

    pub fn destroy(&self, guild_id: &GuildId) -> bool {
        match self.connections.remove(guild_id) {
            Some((_, connection)) => {
                info!("[{}] Destroying voice connection", guild_id);
                connection.shutdown();
                true
            }
            None => false,
        }
    }

    pub fn destroy_all(&self) {
        for guild_id in self.guilds() {
            self.destroy(&guild_id);
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.destroy_all();
        self.event_loop.abort();
    }
}

async fn event_loop(connections: Arc<ConnectionMap>, mut commands: UnboundedReceiver<LoopCommand>) {
    while let Some(command) = commands.recv().await {
        match command {
            LoopCommand::Teardown {
                guild_id,
                connection_id,
            } => {
                if let Some((_, connection)) =
                    connections.remove_if(&guild_id, |_, c| c.id() == connection_id)
                {
                    info!("[{}] Tearing down lost voice connection", guild_id);
                    connection.shutdown();
                }
            }
        }
    }
}
