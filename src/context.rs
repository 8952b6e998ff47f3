//! Per-call client and server contexts.
//!
//! The drivers only touch the metadata containers, the metadata
//! sent/received flags and the compression override kept here.

use crate::metadata::Metadata;

use parking_lot::Mutex;
use std::sync::Arc;

/// Flags attached to a send-initial-metadata operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InitialMetadataFlags(u32);

impl InitialMetadataFlags {
    pub const IDEMPOTENT_REQUEST: u32 = 0x10;
    pub const WAIT_FOR_READY: u32 = 0x20;
    pub const CACHEABLE_REQUEST: u32 = 0x40;
    pub const WAIT_FOR_READY_EXPLICITLY_SET: u32 = 0x80;

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, flag: u32) -> bool {
        self.0 & flag == flag
    }

    fn set(&mut self, flag: u32, enabled: bool) {
        if enabled {
            self.0 |= flag;
        } else {
            self.0 &= !flag;
        }
    }
}

/// Compression level requested by a server handler for its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionLevel {
    None,
    Low,
    Medium,
    High,
}

#[derive(Debug, Default)]
struct ClientState {
    send_initial_metadata: Metadata,
    flags: InitialMetadataFlags,
    initial_metadata_received: bool,
    recv_initial_metadata: Metadata,
    trailing_metadata: Metadata,
}

/// Client side call context.
///
/// Cloning yields another handle to the same context: batches that receive
/// metadata keep a handle so they can record it when they complete.
#[derive(Debug, Clone, Default)]
pub struct ClientContext {
    state: Arc<Mutex<ClientState>>,
}

impl ClientContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key-value pair to the initial metadata sent with the request.
    pub fn add_metadata(&self, key: impl Into<String>, value: impl Into<String>) {
        self.state.lock().send_initial_metadata.insert(key, value);
    }

    pub fn set_wait_for_ready(&self, wait_for_ready: bool) {
        let mut state = self.state.lock();
        state
            .flags
            .set(InitialMetadataFlags::WAIT_FOR_READY, wait_for_ready);
        state
            .flags
            .set(InitialMetadataFlags::WAIT_FOR_READY_EXPLICITLY_SET, true);
    }

    pub fn set_idempotent(&self, idempotent: bool) {
        self.state
            .lock()
            .flags
            .set(InitialMetadataFlags::IDEMPOTENT_REQUEST, idempotent);
    }

    pub fn initial_metadata_flags(&self) -> InitialMetadataFlags {
        self.state.lock().flags
    }

    /// Whether the server's initial metadata has been received.
    pub fn initial_metadata_received(&self) -> bool {
        self.state.lock().initial_metadata_received
    }

    /// Initial metadata received from the server.
    pub fn server_initial_metadata(&self) -> Metadata {
        self.state.lock().recv_initial_metadata.clone()
    }

    /// Trailing metadata received with the final status.
    pub fn server_trailing_metadata(&self) -> Metadata {
        self.state.lock().trailing_metadata.clone()
    }

    pub(crate) fn send_initial_metadata(&self) -> (Metadata, InitialMetadataFlags) {
        let state = self.state.lock();
        (state.send_initial_metadata.clone(), state.flags)
    }

    /// Record the server's initial metadata. Only the first delivery flips
    /// the received flag; later ones are ignored.
    pub(crate) fn record_initial_metadata(&self, metadata: Metadata) -> bool {
        let mut state = self.state.lock();
        if state.initial_metadata_received {
            return false;
        }
        state.recv_initial_metadata = metadata;
        state.initial_metadata_received = true;
        true
    }

    pub(crate) fn record_trailing_metadata(&self, metadata: Metadata) {
        self.state.lock().trailing_metadata = metadata;
    }
}

/// Server side call context.
#[derive(Debug, Default)]
pub struct ServerContext {
    client_metadata: Metadata,
    initial_metadata: Metadata,
    trailing_metadata: Metadata,
    compression_level: Option<CompressionLevel>,
    sent_initial_metadata: bool,
}

impl ServerContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context for a call whose client sent `client_metadata`.
    pub fn with_client_metadata(client_metadata: Metadata) -> Self {
        Self {
            client_metadata,
            ..Self::default()
        }
    }

    /// Initial metadata the client sent with the request.
    pub fn client_metadata(&self) -> &Metadata {
        &self.client_metadata
    }

    pub fn add_initial_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.initial_metadata.insert(key, value);
    }

    pub fn add_trailing_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.trailing_metadata.insert(key, value);
    }

    /// Override the compression level used for the response.
    pub fn set_compression_level(&mut self, level: CompressionLevel) {
        self.compression_level = Some(level);
    }

    pub fn compression_level(&self) -> Option<CompressionLevel> {
        self.compression_level
    }

    pub fn sent_initial_metadata(&self) -> bool {
        self.sent_initial_metadata
    }

    pub(crate) fn initial_metadata(&self) -> Metadata {
        self.initial_metadata.clone()
    }

    pub(crate) fn trailing_metadata(&self) -> Metadata {
        self.trailing_metadata.clone()
    }

    pub(crate) fn mark_initial_metadata_sent(&mut self) {
        debug_assert!(!self.sent_initial_metadata);
        self.sent_initial_metadata = true;
    }
}
