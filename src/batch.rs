//! Operation batches.
//!
//! A [`Batch`] is an ordered set of wire operations executed against one
//! call as a single unit. Each batch has a fixed shape: the op kinds it may
//! carry, in protocol order. A batch is configured, submitted once, and
//! completed once.

use crate::codec::Message;
use crate::completion::Tag;
use crate::context::{ClientContext, CompressionLevel, InitialMetadataFlags};
use crate::metadata::Metadata;
use crate::status::Status;

use bytes::Bytes;

/// Identifies an operation slot within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    SendInitialMetadata,
    SendMessage,
    ClientSendClose,
    ServerSendStatus,
    RecvInitialMetadata,
    RecvMessage,
    ClientRecvStatus,
}

/// One configured wire operation.
#[derive(Debug, Clone)]
pub enum Op {
    SendInitialMetadata {
        metadata: Metadata,
        flags: InitialMetadataFlags,
        compression_level: Option<CompressionLevel>,
    },
    SendMessage(Bytes),
    /// Client half-close.
    ClientSendClose,
    ServerSendStatus {
        trailing_metadata: Metadata,
        status: Status,
    },
    /// Receive the server's initial metadata into the context.
    RecvInitialMetadata(ClientContext),
    RecvMessage {
        allow_no_message: bool,
    },
    /// Receive the final status; trailers are recorded on the context.
    ClientRecvStatus(ClientContext),
}

impl Op {
    pub fn kind(&self) -> OpKind {
        match self {
            Op::SendInitialMetadata { .. } => OpKind::SendInitialMetadata,
            Op::SendMessage(_) => OpKind::SendMessage,
            Op::ClientSendClose => OpKind::ClientSendClose,
            Op::ServerSendStatus { .. } => OpKind::ServerSendStatus,
            Op::RecvInitialMetadata(_) => OpKind::RecvInitialMetadata,
            Op::RecvMessage { .. } => OpKind::RecvMessage,
            Op::ClientRecvStatus(_) => OpKind::ClientRecvStatus,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Idle,
    Submitted,
    Completed { ok: bool },
}

/// Which batch of a driver's op-set collection a [`BatchRef`] points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchSlot {
    Init,
    Metadata,
    Finish,
}

/// What the transport observed while executing a batch.
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub ok: bool,
    pub initial_metadata: Option<Metadata>,
    pub message: Option<Bytes>,
    pub status: Option<Status>,
    pub trailing_metadata: Option<Metadata>,
}

impl BatchResult {
    /// Every operation succeeded and nothing was received.
    pub fn success() -> Self {
        Self {
            ok: true,
            ..Self::default()
        }
    }

    /// The batch failed. `status` is reported to a recv-status op, if any.
    pub fn failed(status: Status) -> Self {
        Self {
            ok: false,
            status: Some(status),
            ..Self::default()
        }
    }
}

/// Outputs of the receive operations of a completed batch.
#[derive(Debug, Clone, Default)]
pub struct BatchOutput {
    pub message: Option<Bytes>,
    pub status: Option<Status>,
}

/// An ordered, fixed-shape set of operations.
#[derive(Debug)]
pub struct Batch {
    shape: &'static [OpKind],
    ops: Vec<Op>,
    tag: Option<Tag>,
    state: BatchState,
    output: BatchOutput,
}

impl Batch {
    pub fn new(shape: &'static [OpKind]) -> Self {
        Self {
            shape,
            ops: Vec::with_capacity(shape.len()),
            tag: None,
            state: BatchState::Idle,
            output: BatchOutput::default(),
        }
    }

    /// Attach an operation.
    ///
    /// # Panics
    ///
    /// If the batch was already submitted, the op kind is not part of this
    /// batch's shape, or the slot is already configured.
    pub fn configure(&mut self, op: Op) {
        assert_eq!(
            self.state,
            BatchState::Idle,
            "batch configured after submission"
        );
        let kind = op.kind();
        let position = self
            .position(kind)
            .unwrap_or_else(|| panic!("{:?} is not part of this batch", kind));
        assert!(!self.contains(kind), "{:?} configured twice", kind);

        let at = self
            .ops
            .iter()
            .position(|existing| self.position(existing.kind()) > Some(position))
            .unwrap_or(self.ops.len());
        self.ops.insert(at, op);
    }

    /// Serialize `message` into a send-message op.
    ///
    /// Serialization failures are returned here, before submission.
    pub fn send_message<M: Message>(&mut self, message: &M) -> Result<(), Status> {
        let payload = message.encode()?;
        self.configure(Op::SendMessage(payload));
        Ok(())
    }

    /// Let the batch succeed even if no message arrives.
    pub fn allow_no_message(&mut self) {
        assert_eq!(self.state, BatchState::Idle, "batch configured after submission");
        match self.ops.iter_mut().find(|op| op.kind() == OpKind::RecvMessage) {
            Some(Op::RecvMessage { allow_no_message }) => *allow_no_message = true,
            _ => panic!("allow_no_message without a recv-message op"),
        }
    }

    pub fn set_output_tag(&mut self, tag: Tag) {
        assert_eq!(self.state, BatchState::Idle, "batch configured after submission");
        self.tag = Some(tag);
    }

    pub fn tag(&self) -> Option<Tag> {
        self.tag
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    /// Kinds of the configured ops, in execution order.
    pub fn kinds(&self) -> Vec<OpKind> {
        self.ops.iter().map(Op::kind).collect()
    }

    pub fn contains(&self, kind: OpKind) -> bool {
        self.ops.iter().any(|op| op.kind() == kind)
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.state, BatchState::Completed { .. })
    }

    /// Outputs of the receive ops. Empty until the batch completes.
    pub fn output(&self) -> &BatchOutput {
        &self.output
    }

    fn position(&self, kind: OpKind) -> Option<usize> {
        self.shape.iter().position(|k| *k == kind)
    }

    pub(crate) fn mark_submitted(&mut self) -> Option<Tag> {
        assert_eq!(self.state, BatchState::Idle, "batch submitted twice");
        assert!(!self.ops.is_empty(), "empty batch submitted");
        self.state = BatchState::Submitted;
        self.tag
    }

    /// Apply the transport's result and return the final success flag.
    pub(crate) fn complete(&mut self, result: BatchResult) -> bool {
        assert_eq!(
            self.state,
            BatchState::Submitted,
            "batch completed without being submitted or completed twice"
        );

        let mut ok = result.ok;
        let BatchResult {
            initial_metadata,
            message,
            status,
            trailing_metadata,
            ..
        } = result;

        for op in &self.ops {
            match op {
                Op::RecvInitialMetadata(context) if ok => {
                    context.record_initial_metadata(initial_metadata.clone().unwrap_or_default());
                }
                Op::RecvMessage { allow_no_message } => {
                    if message.is_none() && !allow_no_message {
                        ok = false;
                    }
                    self.output.message = message.clone();
                }
                Op::ClientRecvStatus(context) => {
                    if let Some(trailers) = &trailing_metadata {
                        context.record_trailing_metadata(trailers.clone());
                    }
                    self.output.status = Some(status.clone().unwrap_or_else(|| {
                        Status::unavailable("call ended without a status")
                    }));
                }
                _ => {}
            }
        }

        self.state = BatchState::Completed { ok };
        ok
    }
}
