//! Client side unary call driver.
//!
//! A [`ClientAsyncResponseReader`] sends the request as soon as it is
//! created, then lets the caller optionally wait for the server's initial
//! metadata and finally collect the response and status. Every batch the
//! reader issues lives in one object carved from the call's arena.

use crate::arena::ArenaHandle;
use crate::batch::{Batch, BatchSlot, Op, OpKind};
use crate::call::{BatchRef, Call, ChannelInterface, Method, OpSetCollection};
use crate::codec::Message;
use crate::completion::{CompletionQueue, Tag};
use crate::context::ClientContext;
use crate::error::CallError;
use crate::status::Status;

use std::marker::PhantomData;
use tracing::{debug, warn};

/// Ops of the batch sent at construction.
pub const CLIENT_INIT: &[OpKind] = &[
    OpKind::SendInitialMetadata,
    OpKind::SendMessage,
    OpKind::ClientSendClose,
];

pub const CLIENT_METADATA: &[OpKind] = &[OpKind::RecvInitialMetadata];

/// Ops the finish batch may carry. Receiving initial metadata is only
/// included if it has not been received yet.
pub const CLIENT_FINISH: &[OpKind] = &[
    OpKind::RecvInitialMetadata,
    OpKind::RecvMessage,
    OpKind::ClientRecvStatus,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Created,
    /// The request is on its way.
    InitialSent,
    MetadataReadPending,
    FinishPending,
    /// The finish batch completed.
    Done,
}

/// Reader state shared by every batch of the call.
struct ClientCallState {
    phase: ReaderState,
    init: Batch,
    metadata: Batch,
    finish: Batch,
}

impl OpSetCollection for ClientCallState {
    fn op_set_mut(&mut self, slot: BatchSlot) -> Option<&mut Batch> {
        match slot {
            BatchSlot::Init => Some(&mut self.init),
            BatchSlot::Metadata => Some(&mut self.metadata),
            BatchSlot::Finish => Some(&mut self.finish),
        }
    }
}

/// Response and status of a finished call.
#[derive(Debug, Clone, PartialEq)]
pub struct FinishOutcome<R> {
    /// The decoded response. `None` if the server sent no message.
    pub message: Option<R>,
    pub status: Status,
}

/// Operations available on a client unary call after it was started.
pub trait ClientAsyncResponseReaderInterface<R> {
    /// Request the server's initial metadata. `tag` is delivered once it
    /// has been received.
    ///
    /// # Panics
    ///
    /// If the initial metadata was already received or requested, or the
    /// call was already finished.
    fn read_initial_metadata(&mut self, tag: Tag);

    /// Request the response and final status. `tag` is delivered once
    /// both are available.
    ///
    /// # Panics
    ///
    /// If finish was already requested.
    fn finish(&mut self, tag: Tag);
}

/// Client driver for one unary call.
pub struct ClientAsyncResponseReader<R> {
    call: Call,
    context: ClientContext,
    state: ArenaHandle<ClientCallState>,
    _response: PhantomData<fn() -> R>,
}

impl<R> ClientAsyncResponseReader<R> {
    /// Start a unary call of `method` carrying `request`.
    ///
    /// The request metadata, message and half-close are submitted before
    /// this returns. That batch has no tag and never produces an event.
    /// If the request cannot be serialized the call is cancelled and the
    /// serialization status is returned.
    pub fn create<W: Message>(
        channel: &impl ChannelInterface,
        cq: &CompletionQueue,
        method: &Method,
        context: &ClientContext,
        request: &W,
    ) -> Result<Self, CallError> {
        let call = channel.create_call(method, context, cq);

        let (metadata, flags) = context.send_initial_metadata();
        let mut init = Batch::new(CLIENT_INIT);
        init.configure(Op::SendInitialMetadata {
            metadata,
            flags,
            compression_level: None,
        });
        if let Err(status) = init.send_message(request) {
            warn!(
                call = %call.id(),
                method = method.path(),
                %status,
                "request serialization failed"
            );
            call.cancel();
            return Err(CallError::Serialization(status));
        }
        init.configure(Op::ClientSendClose);

        let state = call.alloc(ClientCallState {
            phase: ReaderState::Created,
            init,
            metadata: Batch::new(CLIENT_METADATA),
            finish: Batch::new(CLIENT_FINISH),
        });

        debug!(call = %call.id(), method = method.path(), "starting unary call");
        call.perform_ops(BatchRef::new(state, BatchSlot::Init));
        call.with_object(state, |state| state.phase = ReaderState::InitialSent);

        Ok(Self {
            call,
            context: context.clone(),
            state,
            _response: PhantomData,
        })
    }

    pub fn call(&self) -> &Call {
        &self.call
    }

    pub fn context(&self) -> &ClientContext {
        &self.context
    }

    pub fn state(&self) -> ReaderState {
        self.call.with_object(self.state, |state| {
            if state.finish.is_completed() {
                ReaderState::Done
            } else {
                state.phase
            }
        })
    }

    /// The response and status, once the finish batch has completed.
    ///
    /// A response that fails to decode replaces an OK status with the
    /// decode error.
    pub fn outcome(&self) -> Option<FinishOutcome<R>>
    where
        R: Message,
    {
        let (message, status) = self.call.with_object(self.state, |state| {
            if !state.finish.is_completed() {
                return None;
            }
            let output = state.finish.output();
            let status = output
                .status
                .clone()
                .unwrap_or_else(|| Status::unavailable("call ended without a status"));
            Some((output.message.clone(), status))
        })?;

        if !status.is_ok() {
            return Some(FinishOutcome {
                message: None,
                status,
            });
        }

        match message.map(R::decode).transpose() {
            Ok(message) => Some(FinishOutcome { message, status }),
            Err(status) => {
                debug!(call = %self.call.id(), %status, "response decode failed");
                Some(FinishOutcome {
                    message: None,
                    status,
                })
            }
        }
    }
}

impl<R> ClientAsyncResponseReaderInterface<R> for ClientAsyncResponseReader<R> {
    fn read_initial_metadata(&mut self, tag: Tag) {
        assert!(
            !self.context.initial_metadata_received(),
            "initial metadata already received"
        );

        let context = &self.context;
        let batch = self.call.with_object(self.state, |state| {
            assert_eq!(
                state.phase,
                ReaderState::InitialSent,
                "initial metadata read after a metadata read or finish"
            );
            state
                .metadata
                .configure(Op::RecvInitialMetadata(context.clone()));
            state.metadata.set_output_tag(tag);
            state.phase = ReaderState::MetadataReadPending;
            BatchRef::new(self.state, BatchSlot::Metadata)
        });

        self.call.perform_ops(batch);
    }

    fn finish(&mut self, tag: Tag) {
        let recv_metadata = !self.context.initial_metadata_received();

        let context = &self.context;
        let batch = self.call.with_object(self.state, |state| {
            assert!(
                matches!(
                    state.phase,
                    ReaderState::InitialSent | ReaderState::MetadataReadPending
                ),
                "finish issued twice"
            );
            if recv_metadata {
                state
                    .finish
                    .configure(Op::RecvInitialMetadata(context.clone()));
            }
            state.finish.configure(Op::RecvMessage {
                allow_no_message: false,
            });
            state.finish.allow_no_message();
            state.finish.configure(Op::ClientRecvStatus(context.clone()));
            state.finish.set_output_tag(tag);
            state.phase = ReaderState::FinishPending;
            BatchRef::new(self.state, BatchSlot::Finish)
        });

        self.call.perform_ops(batch);
    }
}

/// A reader dropped before finish was issued can never collect the status,
/// so the call is cancelled and the transport may release it.
impl<R> Drop for ClientAsyncResponseReader<R> {
    fn drop(&mut self) {
        let abandoned = self.call.with_object(self.state, |state| {
            matches!(
                state.phase,
                ReaderState::InitialSent | ReaderState::MetadataReadPending
            )
        });
        if abandoned {
            debug!(call = %self.call.id(), "reader dropped before finish");
            self.call.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchResult;
    use crate::completion::Event;
    use crate::status::Code;
    use crate::testing::RecordingTransport;

    use bytes::Bytes;

    fn method() -> Method {
        Method::new("/test.Echo/Say")
    }

    fn start(
        transport: &RecordingTransport,
        cq: &CompletionQueue,
        context: &ClientContext,
    ) -> ClientAsyncResponseReader<String> {
        ClientAsyncResponseReader::create(transport, cq, &method(), context, &String::from("hi"))
            .unwrap()
    }

    struct Unserializable;

    impl Message for Unserializable {
        fn encode(&self) -> Result<Bytes, Status> {
            Err(Status::invalid_argument("cannot encode"))
        }

        fn decode(_: Bytes) -> Result<Self, Status> {
            Ok(Unserializable)
        }
    }

    #[test]
    fn test_create_submits_untagged_init_batch() {
        let transport = RecordingTransport::new();
        let cq = CompletionQueue::new();
        let context = ClientContext::new();
        context.add_metadata("x-client", "1");

        let reader = start(&transport, &cq, &context);
        let submitted = transport.submitted();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].call, reader.call().id());
        assert_eq!(submitted[0].kinds, CLIENT_INIT);
        assert_eq!(submitted[0].tag, None);
        assert_eq!(reader.state(), ReaderState::InitialSent);
        assert_eq!(reader.call().arena_allocations(), 1);
        assert_eq!(cq.outstanding(), 0);

        transport.complete_next(BatchResult::success());
        assert!(cq.try_next().is_none());
    }

    #[test]
    fn test_serialization_failure_cancels_call() {
        let transport = RecordingTransport::new();
        let cq = CompletionQueue::new();

        let result = ClientAsyncResponseReader::<String>::create(
            &transport,
            &cq,
            &method(),
            &ClientContext::new(),
            &Unserializable,
        );
        let error = result.err().unwrap();
        assert_eq!(error.status().code(), Code::InvalidArgument);
        assert!(transport.submitted().is_empty());
        assert_eq!(transport.cancelled().len(), 1);
    }

    #[test]
    fn test_finish_folds_metadata_when_not_received() {
        let transport = RecordingTransport::new();
        let cq = CompletionQueue::new();
        let mut reader = start(&transport, &cq, &ClientContext::new());

        reader.finish(Tag::new(2));
        let submitted = transport.submitted();
        assert_eq!(submitted[1].kinds, CLIENT_FINISH);
        assert_eq!(submitted[1].tag, Some(Tag::new(2)));
        assert_eq!(reader.state(), ReaderState::FinishPending);
        assert_eq!(reader.call().arena_allocations(), 1);
    }

    #[test]
    fn test_finish_skips_metadata_once_received() {
        let transport = RecordingTransport::new();
        let cq = CompletionQueue::new();
        let context = ClientContext::new();
        let mut reader = start(&transport, &cq, &context);
        transport.complete_next(BatchResult::success());

        reader.read_initial_metadata(Tag::new(1));
        assert_eq!(reader.state(), ReaderState::MetadataReadPending);
        assert!(!context.initial_metadata_received());

        transport.complete_next(BatchResult {
            ok: true,
            initial_metadata: Some([("x-server", "yes")].into_iter().collect()),
            ..BatchResult::default()
        });
        assert_eq!(cq.try_next(), Some(Event { tag: Tag::new(1), ok: true }));
        assert!(context.initial_metadata_received());
        assert_eq!(context.server_initial_metadata().get("x-server"), Some("yes"));

        reader.finish(Tag::new(2));
        let submitted = transport.submitted();
        assert_eq!(submitted[1].kinds, CLIENT_METADATA);
        assert_eq!(
            submitted[2].kinds,
            [OpKind::RecvMessage, OpKind::ClientRecvStatus]
        );
        assert_eq!(reader.call().arena_allocations(), 1);
    }

    #[test]
    #[should_panic(expected = "initial metadata already received")]
    fn test_read_initial_metadata_after_received_is_a_fault() {
        let transport = RecordingTransport::new();
        let cq = CompletionQueue::new();
        let mut reader = start(&transport, &cq, &ClientContext::new());
        transport.complete_next(BatchResult::success());

        reader.read_initial_metadata(Tag::new(1));
        transport.complete_next(BatchResult::success());
        reader.read_initial_metadata(Tag::new(1));
    }

    #[test]
    #[should_panic(expected = "after a metadata read or finish")]
    fn test_read_initial_metadata_twice_is_a_fault() {
        let transport = RecordingTransport::new();
        let cq = CompletionQueue::new();
        let mut reader = start(&transport, &cq, &ClientContext::new());

        reader.read_initial_metadata(Tag::new(1));
        reader.read_initial_metadata(Tag::new(1));
    }

    #[test]
    #[should_panic(expected = "finish issued twice")]
    fn test_finish_twice_is_a_fault() {
        let transport = RecordingTransport::new();
        let cq = CompletionQueue::new();
        let mut reader = start(&transport, &cq, &ClientContext::new());

        reader.finish(Tag::new(2));
        reader.finish(Tag::new(3));
    }

    #[test]
    fn test_outcome_after_finish() {
        let transport = RecordingTransport::new();
        let cq = CompletionQueue::new();
        let context = ClientContext::new();
        let mut reader = start(&transport, &cq, &context);
        transport.complete_next(BatchResult::success());

        reader.finish(Tag::new(9));
        assert!(reader.outcome().is_none());

        transport.complete_next(BatchResult {
            ok: true,
            message: Some(Bytes::from_static(b"hello")),
            status: Some(Status::ok()),
            trailing_metadata: Some([("x-trailer", "t")].into_iter().collect()),
            ..BatchResult::default()
        });

        assert_eq!(cq.try_next(), Some(Event { tag: Tag::new(9), ok: true }));
        assert_eq!(reader.state(), ReaderState::Done);
        assert!(context.initial_metadata_received());
        assert_eq!(context.server_trailing_metadata().get("x-trailer"), Some("t"));

        let outcome = reader.outcome().unwrap();
        assert_eq!(outcome.message.as_deref(), Some("hello"));
        assert!(outcome.status.is_ok());
    }

    #[test]
    fn test_error_status_leaves_message_unset() {
        let transport = RecordingTransport::new();
        let cq = CompletionQueue::new();
        let mut reader = start(&transport, &cq, &ClientContext::new());
        transport.complete_next(BatchResult::success());

        reader.finish(Tag::new(9));
        transport.complete_next(BatchResult {
            ok: true,
            status: Some(Status::internal("x")),
            ..BatchResult::default()
        });

        assert_eq!(cq.try_next(), Some(Event { tag: Tag::new(9), ok: true }));
        let outcome = reader.outcome().unwrap();
        assert_eq!(outcome.message, None);
        assert_eq!(outcome.status.code(), Code::Internal);
        assert_eq!(outcome.status.message(), Some("x"));
    }

    #[test]
    fn test_undecodable_response_replaces_ok_status() {
        let transport = RecordingTransport::new();
        let cq = CompletionQueue::new();
        let mut reader = start(&transport, &cq, &ClientContext::new());
        transport.complete_next(BatchResult::success());

        reader.finish(Tag::new(9));
        transport.complete_next(BatchResult {
            ok: true,
            message: Some(Bytes::from_static(&[0xff, 0xfe])),
            status: Some(Status::ok()),
            ..BatchResult::default()
        });

        let outcome = reader.outcome().unwrap();
        assert_eq!(outcome.message, None);
        assert_eq!(outcome.status.code(), Code::Internal);
    }

    #[test]
    fn test_drop_before_finish_cancels_call() {
        let transport = RecordingTransport::new();
        let cq = CompletionQueue::new();

        let reader = start(&transport, &cq, &ClientContext::new());
        let id = reader.call().id();
        drop(reader);
        assert_eq!(transport.cancelled(), [id]);

        let mut reader = start(&transport, &cq, &ClientContext::new());
        reader.finish(Tag::new(4));
        drop(reader);
        assert_eq!(transport.cancelled(), [id]);
    }

    #[test]
    fn test_failed_finish_reports_status() {
        let transport = RecordingTransport::new();
        let cq = CompletionQueue::new();
        let mut reader = start(&transport, &cq, &ClientContext::new());

        reader.finish(Tag::new(5));
        transport.fail_all(Status::cancelled("call cancelled"));

        assert_eq!(cq.try_next(), Some(Event { tag: Tag::new(5), ok: false }));
        assert!(cq.try_next().is_none());
        assert_eq!(reader.state(), ReaderState::Done);
        let outcome = reader.outcome().unwrap();
        assert_eq!(outcome.message, None);
        assert_eq!(outcome.status.code(), Code::Cancelled);
    }
}
