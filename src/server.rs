//! Server side unary call driver.

use crate::arena::ArenaHandle;
use crate::batch::{Batch, BatchSlot, Op, OpKind};
use crate::call::{BatchRef, Call, OpSetCollection};
use crate::codec::Message;
use crate::completion::Tag;
use crate::context::{InitialMetadataFlags, ServerContext};
use crate::status::Status;

use std::marker::PhantomData;
use tracing::{debug, warn};

pub const SERVER_METADATA: &[OpKind] = &[OpKind::SendInitialMetadata];

/// Ops the finish batch may carry. Initial metadata is folded in when it
/// was not sent before, the message only with an OK status.
pub const SERVER_FINISH: &[OpKind] = &[
    OpKind::SendInitialMetadata,
    OpKind::SendMessage,
    OpKind::ServerSendStatus,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Created,
    MetadataSent,
    /// Terminal. The finish batch was submitted.
    Finished,
}

struct ServerCallState {
    metadata: Batch,
    finish: Batch,
}

impl OpSetCollection for ServerCallState {
    fn op_set_mut(&mut self, slot: BatchSlot) -> Option<&mut Batch> {
        match slot {
            BatchSlot::Metadata => Some(&mut self.metadata),
            BatchSlot::Finish => Some(&mut self.finish),
            BatchSlot::Init => None,
        }
    }
}

/// Lets dispatch attach a call to a response writer without knowing its
/// concrete type.
pub trait ServerAsyncStreamingInterface {
    /// Send the response's initial metadata ahead of the response.
    ///
    /// # Panics
    ///
    /// If no call is bound, the metadata was already sent, or the writer
    /// already finished.
    fn send_initial_metadata(&mut self, tag: Tag);

    /// Attach the accepted call. A writer is bound exactly once.
    fn bind_call(&mut self, call: Call);
}

/// Server driver for one unary call.
pub struct ServerAsyncResponseWriter<W> {
    ctx: ServerContext,
    call: Option<Call>,
    ops: Option<ArenaHandle<ServerCallState>>,
    state: WriterState,
    _response: PhantomData<fn(W)>,
}

impl<W> ServerAsyncResponseWriter<W> {
    pub fn new(ctx: ServerContext) -> Self {
        Self {
            ctx,
            call: None,
            ops: None,
            state: WriterState::Created,
            _response: PhantomData,
        }
    }

    pub fn context(&self) -> &ServerContext {
        &self.ctx
    }

    /// Mutable access to the context, for adding response metadata before
    /// it is sent.
    pub fn context_mut(&mut self) -> &mut ServerContext {
        &mut self.ctx
    }

    pub fn call(&self) -> Option<&Call> {
        self.call.as_ref()
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    fn active(&self) -> (Call, ArenaHandle<ServerCallState>) {
        assert_ne!(self.state, WriterState::Finished, "writer used after finish");
        match (&self.call, self.ops) {
            (Some(call), Some(ops)) => (call.clone(), ops),
            _ => panic!("writer used before a call was bound"),
        }
    }

    fn initial_metadata_op(&mut self) -> Op {
        self.ctx.mark_initial_metadata_sent();
        Op::SendInitialMetadata {
            metadata: self.ctx.initial_metadata(),
            flags: InitialMetadataFlags::default(),
            compression_level: self.ctx.compression_level(),
        }
    }
}

impl<W: Message> ServerAsyncResponseWriter<W> {
    /// Finish the call with `status`.
    ///
    /// With an OK status `message` is sent along with it. With any other
    /// status `message` is dropped. Initial metadata is sent in the same
    /// batch unless it went out earlier.
    pub fn finish(&mut self, message: &W, status: Status, tag: Tag) {
        let message = if status.is_ok() {
            Some(message)
        } else {
            debug!(code = %status.code(), "dropping response for error status");
            None
        };
        self.submit_finish(message, status, tag);
    }

    /// Finish the call with an error status and no response.
    ///
    /// # Panics
    ///
    /// If `status` is OK.
    pub fn finish_with_error(&mut self, status: Status, tag: Tag) {
        assert!(!status.is_ok(), "finish_with_error called with an OK status");
        self.submit_finish(None, status, tag);
    }

    fn submit_finish(&mut self, message: Option<&W>, status: Status, tag: Tag) {
        let (call, ops) = self.active();

        let metadata = if self.ctx.sent_initial_metadata() {
            None
        } else {
            Some(self.initial_metadata_op())
        };
        let trailing_metadata = self.ctx.trailing_metadata();

        let batch = call.with_object(ops, |state| {
            if let Some(op) = metadata {
                state.finish.configure(op);
            }
            let status = match message.map(|m| state.finish.send_message(m)) {
                Some(Err(error)) => {
                    warn!(call = %call.id(), %error, "response serialization failed");
                    error
                }
                _ => status,
            };
            state.finish.configure(Op::ServerSendStatus {
                trailing_metadata,
                status,
            });
            state.finish.set_output_tag(tag);
            BatchRef::new(ops, BatchSlot::Finish)
        });

        self.state = WriterState::Finished;
        call.perform_ops(batch);
    }
}

impl<W> ServerAsyncStreamingInterface for ServerAsyncResponseWriter<W> {
    fn send_initial_metadata(&mut self, tag: Tag) {
        let (call, ops) = self.active();
        assert!(
            !self.ctx.sent_initial_metadata(),
            "initial metadata already sent"
        );

        let op = self.initial_metadata_op();
        let batch = call.with_object(ops, |state| {
            state.metadata.configure(op);
            state.metadata.set_output_tag(tag);
            BatchRef::new(ops, BatchSlot::Metadata)
        });

        self.state = WriterState::MetadataSent;
        call.perform_ops(batch);
    }

    fn bind_call(&mut self, call: Call) {
        assert!(self.call.is_none(), "call bound twice");
        debug!(call = %call.id(), method = call.method().path(), "binding response writer");
        self.ops = Some(call.alloc(ServerCallState {
            metadata: Batch::new(SERVER_METADATA),
            finish: Batch::new(SERVER_FINISH),
        }));
        self.call = Some(call);
    }
}
