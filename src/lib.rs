//! async-unary - drivers for asynchronous unary RPC calls.
//!
//! A unary call carries one request message and yields one response message
//! or an error status. This crate drives such calls against a completion
//! queue without async/await: every step submits a batch of wire operations
//! and the caller learns about its completion by pulling a tag out of a
//! [`CompletionQueue`].
//!
//! # Features
//!
//! - [`ClientAsyncResponseReader`]: sends the request on creation, then
//!   optionally reads the server's initial metadata and finishes the call
//! - [`ServerAsyncResponseWriter`]: optionally sends initial metadata, then
//!   finishes with a response or an error status
//! - Per-call arena holding all driver state for the call's lifetime
//! - An in-process transport connecting both sides
//!
//! # Architecture
//!
//! Drivers build [`Batch`]es and submit them through a [`Call`]. The
//! transport behind the call executes the operations and completes each
//! submitted batch exactly once; tagged batches then post one [`Event`].
//! Transports plug in through [`CallTransport`] and [`ChannelInterface`].

mod arena;
mod batch;
mod call;
mod client;
mod codec;
mod completion;
mod context;
mod error;
mod frame;
mod metadata;
mod server;
mod status;

pub mod config;
pub mod inproc;
pub mod logging;
pub mod metrics;

#[cfg(test)]
mod testing;

pub use arena::{ArenaHandle, CallArena};
pub use batch::{Batch, BatchOutput, BatchResult, BatchSlot, BatchState, Op, OpKind};
pub use call::{BatchRef, Call, CallId, CallTransport, ChannelInterface, Method, OpSetCollection};
pub use client::{
    CLIENT_FINISH, CLIENT_INIT, CLIENT_METADATA, ClientAsyncResponseReader,
    ClientAsyncResponseReaderInterface, FinishOutcome, ReaderState,
};
pub use codec::Message;
pub use completion::{CompletionQueue, Event, NextStatus, Tag};
pub use context::{ClientContext, CompressionLevel, InitialMetadataFlags, ServerContext};
pub use error::CallError;
pub use frame::{HEADER_SIZE, MAX_MESSAGE_SIZE, MessageDecoder, encode_message};
pub use metadata::Metadata;
pub use server::{
    SERVER_FINISH, SERVER_METADATA, ServerAsyncResponseWriter, ServerAsyncStreamingInterface,
    WriterState,
};
pub use status::{Code, Status};
