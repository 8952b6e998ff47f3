//! In-process transport.
//!
//! [`pair`] returns a channel and a server sharing one router. Each client
//! call gets a pipe: the client's send ops fill the request half, the
//! server's send ops fill the response half, and pending client receive
//! batches complete as soon as the response half can satisfy them.
//!
//! Messages are framed on the way in and unframed on delivery, so the
//! configured size limit applies in both directions.

use crate::batch::{BatchResult, Op, OpKind};
use crate::call::{BatchRef, Call, CallId, CallTransport, ChannelInterface, Method};
use crate::codec::Message;
use crate::completion::CompletionQueue;
use crate::config::TransportConfig;
use crate::context::{ClientContext, ServerContext};
use crate::frame::{self, MessageDecoder};
use crate::metadata::Metadata;
use crate::metrics::{CALLS_ACTIVE, CALLS_CREATED, MESSAGES_OVERSIZE};
use crate::status::Status;

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

/// Create a connected channel and server.
pub fn pair(config: &TransportConfig) -> (InProcessChannel, InProcessServer) {
    let router = Arc::new(Router {
        state: Mutex::new(RouterState::default()),
        max_message_size: config.max_message_size,
    });
    (
        InProcessChannel {
            router: router.clone(),
        },
        InProcessServer { router },
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Server,
}

type PipeId = u64;

#[derive(Default)]
struct RequestHalf {
    metadata: Option<Metadata>,
    message: Option<Bytes>,
    closed: bool,
    routed: bool,
}

#[derive(Default)]
struct ResponseHalf {
    initial_metadata: Option<Metadata>,
    message: Option<Bytes>,
    status: Option<(Status, Metadata)>,
}

struct Pipe {
    method: Method,
    client: Call,
    server: Option<Call>,
    request: RequestHalf,
    response: ResponseHalf,
    /// Client receive batches waiting on the response half.
    waiting: Vec<BatchRef>,
    status_delivered: bool,
}

impl Pipe {
    fn new(method: Method, client: Call) -> Self {
        Self {
            method,
            client,
            server: None,
            request: RequestHalf::default(),
            response: ResponseHalf::default(),
            waiting: Vec::new(),
            status_delivered: false,
        }
    }

    fn finished(&self) -> bool {
        self.status_delivered && self.response.status.is_some()
    }
}

#[derive(Default)]
struct RouterState {
    next_id: u64,
    pipes: HashMap<PipeId, Pipe>,
    calls: HashMap<CallId, (PipeId, Side)>,
    /// Pipes whose request is complete, waiting to be accepted.
    incoming: VecDeque<PipeId>,
}

impl RouterState {
    fn next_call_id(&mut self) -> CallId {
        self.next_id += 1;
        CallId::new(self.next_id)
    }

    fn teardown(&mut self, id: PipeId) -> Option<Pipe> {
        let pipe = self.pipes.remove(&id)?;
        self.incoming.retain(|queued| *queued != id);
        self.calls.remove(&pipe.client.id());
        if let Some(server) = &pipe.server {
            self.calls.remove(&server.id());
        }
        CALLS_ACTIVE.decrement();
        trace!(call = %pipe.client.id(), method = pipe.method.path(), "call torn down");
        Some(pipe)
    }
}

/// A batch completion decided under the router lock and applied after it
/// is released.
struct Completion {
    call: Call,
    batch: BatchRef,
    result: BatchResult,
}

impl Completion {
    fn apply(self) {
        self.call.complete_batch(&self.batch, self.result);
    }
}

struct Router {
    state: Mutex<RouterState>,
    max_message_size: usize,
}

impl Router {
    fn frame(&self, payload: &[u8]) -> Result<Bytes, Status> {
        frame::encode_message(payload).map_err(|e| {
            MESSAGES_OVERSIZE.increment();
            Status::resource_exhausted(e.to_string())
        })
    }

    fn unframe(&self, framed: &Bytes) -> Result<Bytes, Status> {
        let mut decoder = MessageDecoder::with_limit(self.max_message_size);
        decoder.feed(framed);
        match decoder.decode() {
            Ok(Some((message, _))) => Ok(message),
            Ok(None) => Err(Status::internal("truncated message")),
            Err(e) => {
                MESSAGES_OVERSIZE.increment();
                Err(Status::resource_exhausted(e.to_string()))
            }
        }
    }

    fn client_batch(
        &self,
        pipe: &mut Pipe,
        call: &Call,
        batch: BatchRef,
        ops: Vec<Op>,
    ) -> Vec<Completion> {
        let mut completions = Vec::new();
        let receives = ops.iter().any(|op| {
            matches!(
                op.kind(),
                OpKind::RecvInitialMetadata | OpKind::RecvMessage | OpKind::ClientRecvStatus
            )
        });

        for op in ops {
            match op {
                Op::SendInitialMetadata { metadata, flags, .. } => {
                    trace!(call = %call.id(), flags = flags.bits(), "request metadata");
                    pipe.request.metadata = Some(metadata);
                }
                Op::SendMessage(payload) => match self.frame(&payload) {
                    Ok(framed) => pipe.request.message = Some(framed),
                    Err(status) => {
                        debug!(call = %call.id(), %status, "request rejected");
                        pipe.response.status = Some((status, Metadata::new()));
                    }
                },
                Op::ClientSendClose => pipe.request.closed = true,
                _ => {}
            }
        }

        if receives {
            pipe.waiting.push(batch);
        } else {
            completions.push(Completion {
                call: call.clone(),
                batch,
                result: BatchResult::success(),
            });
        }
        completions
    }

    fn server_batch(
        &self,
        pipe: &mut Pipe,
        call: &Call,
        batch: BatchRef,
        ops: Vec<Op>,
    ) -> Completion {
        let mut rejected = None;
        for op in ops {
            match op {
                Op::SendInitialMetadata {
                    metadata,
                    compression_level,
                    ..
                } => {
                    if let Some(level) = compression_level {
                        debug!(call = %call.id(), ?level, "compression is not applied in process");
                    }
                    pipe.response.initial_metadata = Some(metadata);
                }
                Op::SendMessage(payload) => match self.frame(&payload) {
                    Ok(framed) => pipe.response.message = Some(framed),
                    Err(status) => rejected = Some(status),
                },
                Op::ServerSendStatus {
                    trailing_metadata,
                    status,
                } => {
                    pipe.response.status = Some((status, trailing_metadata));
                }
                op => {
                    warn!(call = %call.id(), kind = ?op.kind(), "unsupported server operation");
                    return Completion {
                        call: call.clone(),
                        batch,
                        result: BatchResult::failed(Status::unimplemented(
                            "unsupported server operation",
                        )),
                    };
                }
            }
        }

        // An unframeable response replaces whatever status was sent with it.
        if let Some(status) = rejected {
            debug!(call = %call.id(), %status, "response rejected");
            let trailers = pipe.response.status.take().map(|(_, t)| t).unwrap_or_default();
            pipe.response.status = Some((status, trailers));
        }

        Completion {
            call: call.clone(),
            batch,
            result: BatchResult::success(),
        }
    }

    /// Complete every waiting client batch the response half can satisfy.
    fn deliver(&self, pipe: &mut Pipe) -> Vec<Completion> {
        let mut completions = Vec::new();
        let waiting = std::mem::take(&mut pipe.waiting);

        for batch in waiting {
            let kinds = pipe.client.with_batch(&batch, |b| b.kinds());
            let wants_status = kinds.contains(&OpKind::ClientRecvStatus);

            let ready = if wants_status {
                pipe.response.status.is_some()
            } else {
                pipe.response.initial_metadata.is_some() || pipe.response.status.is_some()
            };
            if !ready {
                pipe.waiting.push(batch);
                continue;
            }

            // A status without initial metadata is a trailers-only response.
            let mut result = BatchResult {
                ok: true,
                initial_metadata: Some(pipe.response.initial_metadata.clone().unwrap_or_default()),
                ..BatchResult::default()
            };

            if wants_status {
                if let Some((status, trailers)) = &pipe.response.status {
                    result.status = Some(status.clone());
                    result.trailing_metadata = Some(trailers.clone());
                }
                if kinds.contains(&OpKind::RecvMessage)
                    && let Some(framed) = &pipe.response.message
                {
                    match self.unframe(framed) {
                        Ok(message) => result.message = Some(message),
                        Err(status) => {
                            debug!(call = %pipe.client.id(), %status, "response rejected");
                            result.status = Some(status);
                        }
                    }
                }
                pipe.status_delivered = true;
            }

            completions.push(Completion {
                call: pipe.client.clone(),
                batch,
                result,
            });
        }
        completions
    }

    /// Queue a pipe for dispatch once its request is complete, or answer it
    /// right away if the request cannot be delivered.
    fn route_request(&self, state: &mut RouterState, id: PipeId) {
        let Some(pipe) = state.pipes.get_mut(&id) else {
            return;
        };
        if !pipe.request.closed || pipe.request.routed {
            return;
        }
        pipe.request.routed = true;
        if pipe.response.status.is_some() {
            return;
        }

        if let Some(framed) = &pipe.request.message
            && let Err(status) = self.unframe(framed)
        {
            debug!(call = %pipe.client.id(), %status, "request rejected");
            pipe.response.status = Some((status, Metadata::new()));
            return;
        }
        state.incoming.push_back(id);
    }
}

impl CallTransport for Router {
    fn start_batch(&self, call: &Call, batch: BatchRef) {
        let ops = call.with_batch(&batch, |b| b.ops().to_vec());

        let completions = {
            let mut state = self.state.lock();
            let Some((id, side)) = state.calls.get(&call.id()).copied() else {
                drop(state);
                debug!(call = %call.id(), "batch on a finished or cancelled call");
                let result = BatchResult::failed(Status::cancelled("call cancelled"));
                call.complete_batch(&batch, result);
                return;
            };

            let mut completions = Vec::new();
            if let Some(pipe) = state.pipes.get_mut(&id) {
                match side {
                    Side::Client => completions.extend(self.client_batch(pipe, call, batch, ops)),
                    Side::Server => completions.push(self.server_batch(pipe, call, batch, ops)),
                }
            }
            if side == Side::Client {
                self.route_request(&mut state, id);
            }
            if let Some(pipe) = state.pipes.get_mut(&id) {
                completions.extend(self.deliver(pipe));
                if pipe.finished() {
                    state.teardown(id);
                }
            }
            completions
        };

        for completion in completions {
            completion.apply();
        }
    }

    fn cancel(&self, call: &Call) {
        let pipe = {
            let mut state = self.state.lock();
            let Some((id, _)) = state.calls.get(&call.id()).copied() else {
                return;
            };
            state.teardown(id)
        };

        if let Some(pipe) = pipe {
            debug!(call = %pipe.client.id(), method = pipe.method.path(), "call cancelled");
            for batch in pipe.waiting {
                let result = BatchResult::failed(Status::cancelled("call cancelled"));
                pipe.client.complete_batch(&batch, result);
            }
        }
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for (_, pipe) in state.pipes.drain() {
            CALLS_ACTIVE.decrement();
            for batch in pipe.waiting {
                let result = BatchResult::failed(Status::unavailable("transport closed"));
                pipe.client.complete_batch(&batch, result);
            }
        }
    }
}

/// Client half of an in-process transport.
#[derive(Clone)]
pub struct InProcessChannel {
    router: Arc<Router>,
}

impl ChannelInterface for InProcessChannel {
    fn create_call(&self, method: &Method, _context: &ClientContext, cq: &CompletionQueue) -> Call {
        let transport = Arc::downgrade(&self.router) as Weak<dyn CallTransport>;

        let mut state = self.router.state.lock();
        let id = state.next_call_id();
        let call = Call::new(id, method.clone(), cq.clone(), transport);
        state.pipes.insert(id.value(), Pipe::new(method.clone(), call.clone()));
        state.calls.insert(id, (id.value(), Side::Client));

        CALLS_CREATED.increment();
        CALLS_ACTIVE.increment();
        debug!(call = %id, method = method.path(), "call created");
        call
    }
}

/// A call waiting for its handler.
pub struct IncomingCall {
    call: Call,
    metadata: Metadata,
    message: Bytes,
}

impl IncomingCall {
    /// The server side call. Bind it to a response writer.
    pub fn call(&self) -> &Call {
        &self.call
    }

    pub fn method(&self) -> &Method {
        self.call.method()
    }

    /// Initial metadata sent by the client.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// A fresh server context carrying the client's metadata.
    pub fn context(&self) -> ServerContext {
        ServerContext::with_client_metadata(self.metadata.clone())
    }

    /// Decode the request message.
    pub fn request<M: Message>(&self) -> Result<M, Status> {
        M::decode(self.message.clone())
    }
}

/// Server half of an in-process transport.
pub struct InProcessServer {
    router: Arc<Router>,
}

impl InProcessServer {
    /// Take the next call whose request has fully arrived. Completions for
    /// the server side are posted to `cq`.
    pub fn accept(&self, cq: &CompletionQueue) -> Option<IncomingCall> {
        let transport = Arc::downgrade(&self.router) as Weak<dyn CallTransport>;
        let mut state = self.router.state.lock();

        while let Some(pipe_id) = state.incoming.pop_front() {
            if !state.pipes.contains_key(&pipe_id) {
                continue;
            }
            let id = state.next_call_id();
            let Some(pipe) = state.pipes.get_mut(&pipe_id) else {
                continue;
            };

            let metadata = pipe.request.metadata.clone().unwrap_or_default();
            let message = match &pipe.request.message {
                Some(framed) => self.router.unframe(framed).unwrap_or_default(),
                None => Bytes::new(),
            };
            let call = Call::new(id, pipe.method.clone(), cq.clone(), transport.clone());
            pipe.server = Some(call.clone());
            state.calls.insert(id, (pipe_id, Side::Server));

            debug!(call = %id, client = %pipe_id, method = call.method().path(), "call accepted");
            return Some(IncomingCall {
                call,
                metadata,
                message,
            });
        }
        None
    }

    /// Calls waiting to be accepted.
    pub fn pending(&self) -> usize {
        self.router.state.lock().incoming.len()
    }
}
