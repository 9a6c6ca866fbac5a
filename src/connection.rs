//! The lifecycle of one WebSocket connection.
//!
//! A [`Connection`] is the reader half: it owns the inbound buffer and the
//! reassembler and is driven by exactly one task. Any number of [`Session`]
//! handles may send concurrently; they share the write queue, the extension
//! chain and the state word with the connection.

use crate::{
    close::{CloseCode, CloseReason},
    config::Config,
    endpoint::{Endpoint, EndpointError},
    extension::ExtensionChain,
    frame::{Frame, FrameCodec, Opcode, MAX_CONTROL_PAYLOAD},
    handshake::{Negotiated, SessionPermit},
    reassembler::{Assembled, MessageReassembler},
    Error, Message, MessageKind, ProtocolError, Role,
};
use bytes::{Bytes, BytesMut};
use log::{debug, trace, warn};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::Instant,
};
use tokio::sync::Notify;

/// States only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl State {
    fn from_u8(value: u8) -> State {
        match value {
            0 => State::Connecting,
            1 => State::Open,
            2 => State::Closing,
            _ => State::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            State::Connecting => 0,
            State::Open => 1,
            State::Closing => 2,
            State::Closed => 3,
        }
    }
}

#[derive(Default)]
struct Writer {
    queue: VecDeque<Bytes>,
    pending_bytes: usize,
    /// Kind of the message being sent with [`Session::send_fragment`].
    streaming: Option<MessageKind>,
}

#[derive(Default)]
struct CloseState {
    sent: Option<CloseReason>,
    deadline: Option<Instant>,
    /// Set once, by whoever moved the state to CLOSED.
    reason: Option<CloseReason>,
    was_open: bool,
    delivered: bool,
}

// Lock order: writer, then chain or close. Never held across endpoint calls.
struct Shared {
    role: Role,
    codec: FrameCodec,
    config: Config,
    state: AtomicU8,
    writer: Mutex<Writer>,
    chain: Mutex<ExtensionChain>,
    close: Mutex<CloseState>,
    wakeup: Arc<Notify>,
    subprotocol: Option<String>,
    extensions: Vec<String>,
}

impl Shared {
    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: State, to: State) -> bool {
        let moved = self
            .state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if moved {
            debug!("{:?} connection: {:?} -> {:?}", self.role, from, to);
        }
        moved
    }

    fn require_open(&self) -> Result<(), Error> {
        match self.state() {
            State::Open => Ok(()),
            state => Err(Error::NotOpen(state)),
        }
    }

    fn reserve(&self, writer: &Writer, len: usize) -> Result<(), Error> {
        let limit = self.config.max_pending_write_bytes();
        if writer.pending_bytes + len > limit {
            return Err(Error::WriteQueueFull {
                pending: writer.pending_bytes,
                limit,
            });
        }
        Ok(())
    }

    /// Run frames through the extension chain and the codec.
    fn encode(&self, frames: impl IntoIterator<Item = Frame>) -> Result<Vec<Bytes>, Error> {
        let mut chain = self.chain.lock();
        frames
            .into_iter()
            .map(|frame| -> Result<Bytes, Error> {
                let frame = chain.process_outgoing(frame)?;
                let mut bytes = BytesMut::new();
                self.codec.frame(&frame, &mut bytes)?;
                trace!(
                    "encoded {:?} frame, {} bytes on the wire, fin {}",
                    frame.opcode(),
                    bytes.len(),
                    frame.fin()
                );
                Ok(bytes.freeze())
            })
            .collect()
    }

    fn push(&self, writer: &mut Writer, encoded: Vec<Bytes>) {
        for bytes in encoded {
            writer.pending_bytes += bytes.len();
            writer.queue.push_back(bytes);
        }
        self.wakeup.notify_one();
    }

    /// Queue frames without checking the write limit. Close frames always fit.
    fn enqueue(
        &self,
        writer: &mut Writer,
        frames: impl IntoIterator<Item = Frame>,
    ) -> Result<(), Error> {
        let encoded = self.encode(frames)?;
        self.push(writer, encoded);
        Ok(())
    }

    /// Queue frames only if their encoded size fits under the write limit.
    fn enqueue_limited(
        &self,
        writer: &mut Writer,
        frames: impl IntoIterator<Item = Frame>,
    ) -> Result<(), Error> {
        let encoded = self.encode(frames)?;
        self.reserve(writer, encoded.iter().map(Bytes::len).sum())?;
        self.push(writer, encoded);
        Ok(())
    }

    /// Start the closing handshake if the connection is open.
    fn begin_close(&self, reason: CloseReason, now: Instant) -> Result<(), Error> {
        let mut writer = self.writer.lock();
        match self.state() {
            State::Connecting => return Err(Error::NotOpen(State::Connecting)),
            State::Closing | State::Closed => return Ok(()),
            State::Open => {}
        }
        if !self.transition(State::Open, State::Closing) {
            return Ok(());
        }

        let sent = CloseReason::new(reason.code.to_sendable(self.role), reason.reason);
        debug!("{:?} sending close {}", self.role, sent);
        {
            let mut close = self.close.lock();
            close.sent = Some(sent.clone());
            close.deadline = Some(now + self.config.close_timeout());
        }
        if let Err(error) = self.enqueue(&mut writer, [Frame::close(&sent)]) {
            drop(writer);
            self.terminate(CloseReason::new(CloseCode::Internal, error.to_string()));
            return Err(error);
        }
        Ok(())
    }

    /// Send a close frame if none was sent yet, then go straight to CLOSED.
    fn fail(&self, writer: &mut Writer, reason: CloseReason, drop_pending: bool) {
        if drop_pending && !writer.queue.is_empty() {
            warn!(
                "dropping {} queued bytes on failed connection",
                writer.pending_bytes
            );
            writer.queue.clear();
            writer.pending_bytes = 0;
        }

        if self.transition(State::Open, State::Closing) {
            let sent = CloseReason::new(reason.code.to_sendable(self.role), reason.reason.clone());
            debug!("{:?} failing connection with {}", self.role, sent);
            self.close.lock().sent = Some(sent.clone());
            if let Err(error) = self.enqueue(writer, [Frame::close(&sent)]) {
                warn!("could not queue close frame: {}", error);
            }
        }
        self.terminate(reason);
    }

    /// Move to CLOSED. Only the first caller wins.
    fn terminate(&self, reason: CloseReason) -> bool {
        let mut close = self.close.lock();
        let mut current = self.state();
        loop {
            if current == State::Closed {
                return false;
            }
            match self.state.compare_exchange(
                current.as_u8(),
                State::Closed.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = State::from_u8(actual),
            }
        }
        debug!(
            "{:?} connection: {:?} -> Closed ({})",
            self.role, current, reason
        );
        close.reason = Some(reason);
        close.was_open = current != State::Connecting;
        drop(close);
        self.wakeup.notify_one();
        true
    }
}

/// Split one message into frames of at most `fragment_size` bytes.
fn split(opcode: Opcode, payload: Bytes, fragment_size: usize, last: bool) -> Vec<Frame> {
    if payload.len() <= fragment_size {
        return vec![Frame::builder(opcode).fin(last).payload(payload).build()];
    }

    let count = (payload.len() + fragment_size - 1) / fragment_size;
    (0..count)
        .map(|i| {
            let start = i * fragment_size;
            let end = (start + fragment_size).min(payload.len());
            Frame::builder(if i == 0 { opcode } else { Opcode::Continuation })
                .fin(last && i + 1 == count)
                .payload(payload.slice(start..end))
                .build()
        })
        .collect()
}

/// The outbound side of a connection. Cheap to clone and safe to use from
/// any thread.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn state(&self) -> State {
        self.shared.state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == State::Open
    }

    pub fn subprotocol(&self) -> Option<&str> {
        self.shared.subprotocol.as_deref()
    }

    /// Names of the negotiated extensions, in chain order.
    pub fn extensions(&self) -> &[String] {
        &self.shared.extensions
    }

    /// Send a whole message, fragmenting it if it is larger than the
    /// configured fragment size.
    pub fn send(&self, message: impl Into<Message>) -> Result<(), Error> {
        let message = message.into();
        let kind = message.kind();
        let payload = message.into_payload();

        let shared = &self.shared;
        let mut writer = shared.writer.lock();
        shared.require_open()?;
        if writer.streaming.is_some() {
            return Err(Error::FragmentInProgress);
        }
        let frames = split(kind.opcode(), payload, shared.config.fragment_size(), true);
        self.queue_or_fail(&mut writer, frames)
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<(), Error> {
        self.send(Message::Text(text.into()))
    }

    pub fn send_binary(&self, data: impl Into<Bytes>) -> Result<(), Error> {
        self.send(Message::Binary(data.into()))
    }

    /// Send one piece of a message. The first call picks the message kind;
    /// no other message may be sent until a call with `last` set. Control
    /// frames may still be sent in between.
    pub fn send_fragment(
        &self,
        kind: MessageKind,
        data: impl Into<Bytes>,
        last: bool,
    ) -> Result<(), Error> {
        let data = data.into();
        let shared = &self.shared;
        let mut writer = shared.writer.lock();
        shared.require_open()?;
        let opcode = match writer.streaming {
            None => kind.opcode(),
            Some(streaming) if streaming == kind => Opcode::Continuation,
            Some(_) => return Err(Error::FragmentInProgress),
        };
        let frames = split(opcode, data, shared.config.fragment_size(), last);
        self.queue_or_fail(&mut writer, frames)?;
        writer.streaming = if last { None } else { Some(kind) };
        Ok(())
    }

    pub fn send_text_fragment(&self, text: &str, last: bool) -> Result<(), Error> {
        self.send_fragment(MessageKind::Text, Bytes::copy_from_slice(text.as_bytes()), last)
    }

    pub fn send_ping(&self, data: impl Into<Bytes>) -> Result<(), Error> {
        self.send_control(Frame::ping(data))
    }

    /// Unsolicited pongs are allowed and act as a heartbeat.
    pub fn send_pong(&self, data: impl Into<Bytes>) -> Result<(), Error> {
        self.send_control(Frame::pong(data))
    }

    /// Start the closing handshake. Does nothing if it already started.
    pub fn close(&self, reason: CloseReason) -> Result<(), Error> {
        self.shared.begin_close(reason, Instant::now())
    }

    fn send_control(&self, frame: Frame) -> Result<(), Error> {
        if frame.payload().len() > MAX_CONTROL_PAYLOAD {
            return Err(ProtocolError::TooLargeControl(frame.payload().len()).into());
        }
        let shared = &self.shared;
        let mut writer = shared.writer.lock();
        shared.require_open()?;
        self.queue_or_fail(&mut writer, [frame])
    }

    /// A send that cannot be queued fails the connection. A full queue also
    /// drops whatever is still pending.
    fn queue_or_fail(
        &self,
        writer: &mut Writer,
        frames: impl IntoIterator<Item = Frame>,
    ) -> Result<(), Error> {
        self.shared.enqueue_limited(writer, frames).map_err(|error| {
            warn!("could not send: {}", error);
            let code = error.close_code().unwrap_or(CloseCode::Internal);
            let drop_pending = matches!(error, Error::WriteQueueFull { .. });
            self.shared
                .fail(writer, CloseReason::new(code, error.to_string()), drop_pending);
            error
        })
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.shared.role)
            .field("state", &self.state())
            .field("subprotocol", &self.shared.subprotocol)
            .finish()
    }
}

/// The inbound side of a connection and the owner of its lifecycle.
///
/// Transport-independent: the driver feeds it bytes and the current time,
/// and writes out whatever [`Connection::next_outbound`] returns.
pub struct Connection {
    shared: Arc<Shared>,
    session: Session,
    endpoint: Arc<dyn Endpoint>,
    buffer: BytesMut,
    reassembler: MessageReassembler,
    last_activity: Instant,
    permit: Option<SessionPermit>,
}

/// Stands in for the endpoint of a session refused at open.
struct Refused;

impl Endpoint for Refused {}

impl Connection {
    /// A connection whose handshake has completed but which is not open yet.
    pub fn new(
        role: Role,
        config: &Config,
        negotiated: Negotiated,
        endpoint: Arc<dyn Endpoint>,
    ) -> Self {
        let Negotiated {
            subprotocol,
            extensions: chain,
            permit,
        } = negotiated;
        let shared = Arc::new(Shared {
            role,
            codec: FrameCodec::new(role, config.max_frame_size()),
            config: config.clone(),
            state: AtomicU8::new(State::Connecting.as_u8()),
            writer: Mutex::new(Writer::default()),
            extensions: chain.names(),
            chain: Mutex::new(chain),
            close: Mutex::new(CloseState::default()),
            wakeup: Arc::new(Notify::new()),
            subprotocol,
        });

        Connection {
            session: Session {
                shared: shared.clone(),
            },
            shared,
            endpoint,
            buffer: BytesMut::with_capacity(4096),
            reassembler: MessageReassembler::new(
                config.max_message_size(),
                config.partial_messages(),
            ),
            last_activity: Instant::now(),
            permit,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn state(&self) -> State {
        self.shared.state()
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn is_closed(&self) -> bool {
        self.state() == State::Closed
    }

    /// Why the connection closed, once it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.close.lock().reason.clone()
    }

    /// Woken whenever a [`Session`] queues a frame or the connection closes.
    pub fn notifier(&self) -> Arc<Notify> {
        self.shared.wakeup.clone()
    }

    /// Move to OPEN and fire `on_open`. Bytes received before this are
    /// processed now.
    ///
    /// A server session accepted past its session limit is closed with 1013
    /// instead, and its endpoint never hears of it.
    pub fn open(&mut self, now: Instant) -> Result<(), Error> {
        if !self.shared.transition(State::Connecting, State::Open) {
            return Err(Error::NotOpen(self.state()));
        }
        self.last_activity = now;
        if self.permit.as_ref().map_or(false, SessionPermit::is_over_limit) {
            debug!("refusing session, too many open");
            self.endpoint = Arc::new(Refused);
            return self.shared.begin_close(
                CloseReason::new(CloseCode::TryAgainLater, "too many open sessions"),
                now,
            );
        }
        self.dispatch("on_open", |endpoint, session| endpoint.on_open(session));
        self.process();
        self.deliver_close();
        Ok(())
    }

    /// Handle bytes from the transport. Any number of frames, or part of
    /// one, may be in `data`; the rest is kept for the next call.
    ///
    /// A close from the peer moves straight to CLOSED once the echo is
    /// queued. The echo is still returned by [`Connection::next_outbound`],
    /// and [`WebSocket::run`](crate::WebSocket::run) writes it and shuts the
    /// transport down within the close timeout.
    pub fn receive(&mut self, data: &[u8], now: Instant) {
        if self.is_closed() {
            trace!("ignoring {} bytes after close", data.len());
            return;
        }
        self.buffer.extend_from_slice(data);
        self.last_activity = now;
        self.process();
        self.deliver_close();
    }

    /// Check the idle and close-handshake timers, and deliver `on_close` for
    /// a close triggered from a [`Session`].
    pub fn tick(&mut self, now: Instant) {
        match self.state() {
            State::Open => {
                if let Some(idle) = self.shared.config.idle_timeout() {
                    if now >= self.last_activity + idle {
                        debug!("idle for {:?}, closing", idle);
                        if let Err(error) = self
                            .shared
                            .begin_close(CloseReason::new(CloseCode::Normal, "idle timeout"), now)
                        {
                            debug!("idle close failed: {}", error);
                        }
                    }
                }
            }
            State::Closing => {
                let deadline = self.shared.close.lock().deadline;
                if deadline.map_or(false, |deadline| now >= deadline) {
                    debug!("close handshake timed out");
                    self.shared
                        .terminate(CloseReason::abnormal("close handshake timed out"));
                }
            }
            State::Connecting | State::Closed => {}
        }
        self.deliver_close();
    }

    /// When [`Connection::tick`] next has something to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.state() {
            State::Open => self
                .shared
                .config
                .idle_timeout()
                .map(|idle| self.last_activity + idle),
            State::Closing => self.shared.close.lock().deadline,
            State::Connecting | State::Closed => None,
        }
    }

    /// The next chunk of bytes to write, in the order frames were queued.
    pub fn next_outbound(&mut self, now: Instant) -> Option<Bytes> {
        let mut writer = self.shared.writer.lock();
        let bytes = writer.queue.pop_front()?;
        writer.pending_bytes = writer.pending_bytes.saturating_sub(bytes.len());
        self.last_activity = now;
        Some(bytes)
    }

    /// The transport reached end of stream.
    pub fn transport_closed(&mut self) {
        self.shared.terminate(CloseReason::abnormal(
            "connection closed without a close frame",
        ));
        self.deliver_close();
    }

    /// The transport failed. No close frame is attempted.
    pub fn transport_failed(&mut self, error: Error) {
        if !self.is_closed() {
            warn!("transport failed: {}", error);
            let reason = CloseReason::abnormal(error.to_string());
            if self.state() != State::Connecting {
                self.endpoint.on_error(&self.session, &error);
            }
            self.shared.terminate(reason);
        }
        self.deliver_close();
    }

    fn process(&mut self) {
        loop {
            if !matches!(self.state(), State::Open | State::Closing) {
                return;
            }
            let frame = match self.shared.codec.unframe(&mut self.buffer) {
                Ok(Some(frame)) => frame,
                Ok(None) => return,
                Err(error) => return self.fail(error.into()),
            };
            trace!(
                "received {:?} frame, {} bytes, fin {}",
                frame.opcode(),
                frame.payload().len(),
                frame.fin()
            );
            if let Err(error) = self.handle_frame(frame) {
                return self.fail(error);
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<(), Error> {
        let frame = {
            let mut chain = self.shared.chain.lock();
            if frame.rsv() & !chain.rsv_bits() != 0 {
                return Err(ProtocolError::RsvSet.into());
            }
            chain.process_incoming(frame)?
        };

        match self.reassembler.accept(frame)? {
            None => {}
            Some(Assembled::Message(message)) => {
                self.dispatch("on_message", |endpoint, session| {
                    endpoint.on_message(session, message)
                });
            }
            Some(Assembled::Fragment(fragment)) => {
                self.dispatch("on_fragment", |endpoint, session| {
                    endpoint.on_fragment(session, fragment)
                });
            }
            Some(Assembled::Control(frame)) => match frame.opcode() {
                Opcode::Ping => {
                    let data = frame.into_payload();
                    if self.shared.config.auto_pong() && self.state() == State::Open {
                        let mut writer = self.shared.writer.lock();
                        self.shared
                            .enqueue_limited(&mut writer, [Frame::pong(data.clone())])?;
                    }
                    self.dispatch("on_ping", |endpoint, session| {
                        endpoint.on_ping(session, data)
                    });
                }
                Opcode::Pong => {
                    let data = frame.into_payload();
                    self.dispatch("on_pong", |endpoint, session| {
                        endpoint.on_pong(session, data)
                    });
                }
                Opcode::Close => self.receive_close(frame.payload())?,
                opcode => trace!("ignoring {:?} frame", opcode),
            },
        }
        Ok(())
    }

    fn receive_close(&mut self, payload: &[u8]) -> Result<(), Error> {
        let received = CloseReason::parse(payload)?;
        if self.shared.role == Role::Server
            && matches!(
                received.code,
                CloseCode::ServiceRestart | CloseCode::TryAgainLater
            )
        {
            return Err(ProtocolError::IllegalCloseCode(received.code.into()).into());
        }
        debug!("{:?} received close {}", self.shared.role, received);

        let mut writer = self.shared.writer.lock();
        if self.shared.transition(State::Open, State::Closing) {
            // Echo the peer's code. An empty close is echoed empty.
            let echo = if received.code == CloseCode::NoStatus {
                CloseReason::no_status()
            } else {
                CloseReason::new(received.code.to_sendable(self.shared.role), "")
            };
            self.shared.close.lock().sent = Some(echo.clone());
            self.shared.enqueue(&mut writer, [Frame::close(&echo)])?;
        }
        drop(writer);

        let reason = if received.code == CloseCode::NoStatus {
            self.shared
                .close
                .lock()
                .sent
                .clone()
                .unwrap_or(received)
        } else {
            received
        };
        self.shared.terminate(reason);
        Ok(())
    }

    /// Report a fatal error and fail the connection with its close code.
    fn fail(&mut self, error: Error) {
        match &error {
            Error::Protocol(_) => debug!("protocol error: {}", error),
            _ => warn!("connection failed: {}", error),
        }
        self.reassembler.reset();
        self.endpoint.on_error(&self.session, &error);

        let code = error.close_code().unwrap_or(CloseCode::Internal);
        let drop_pending = matches!(error, Error::WriteQueueFull { .. });
        let mut writer = self.shared.writer.lock();
        self.shared
            .fail(&mut writer, CloseReason::new(code, error.to_string()), drop_pending);
    }

    fn dispatch<F>(&self, name: &str, callback: F)
    where
        F: FnOnce(&dyn Endpoint, &Session) -> Result<(), EndpointError>,
    {
        if let Err(error) = callback(&*self.endpoint, &self.session) {
            warn!("{} failed: {}", name, error);
            self.endpoint.on_error(&self.session, &Error::Endpoint(error));
        }
    }

    /// Destroy the extensions and fire `on_close`, once, after CLOSED.
    fn deliver_close(&mut self) {
        let (reason, was_open) = {
            let mut close = self.shared.close.lock();
            match &close.reason {
                Some(reason) if !close.delivered => {
                    let reason = reason.clone();
                    close.delivered = true;
                    (reason, close.was_open)
                }
                _ => return,
            }
        };
        self.reassembler.reset();
        self.shared.chain.lock().destroy();
        self.permit = None;
        if was_open {
            self.endpoint.on_close(&self.session, &reason);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.shared.role)
            .field("state", &self.state())
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        deflate::{DeflateConfig, PerMessageDeflate},
        extension::{tests::xor_factory, Extension, ExtensionError},
        Fragment,
    };
    use std::{sync::atomic::AtomicUsize, time::Duration};

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Open,
        Message(Message),
        Fragment(Fragment),
        Ping(Bytes),
        Pong(Bytes),
        Close(CloseReason),
        Error(String),
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<Event>>,
        fail_messages: bool,
    }

    impl Recorder {
        fn events(&self) -> Vec<Event> {
            self.events.lock().clone()
        }

        fn closes(&self) -> Vec<CloseReason> {
            self.events()
                .into_iter()
                .filter_map(|event| match event {
                    Event::Close(reason) => Some(reason),
                    _ => None,
                })
                .collect()
        }
    }

    impl Endpoint for Recorder {
        fn on_open(&self, _session: &Session) -> Result<(), EndpointError> {
            self.events.lock().push(Event::Open);
            Ok(())
        }

        fn on_message(&self, _session: &Session, message: Message) -> Result<(), EndpointError> {
            self.events.lock().push(Event::Message(message));
            if self.fail_messages {
                return Err("handler exploded".into());
            }
            Ok(())
        }

        fn on_fragment(&self, _session: &Session, fragment: Fragment) -> Result<(), EndpointError> {
            self.events.lock().push(Event::Fragment(fragment));
            Ok(())
        }

        fn on_ping(&self, _session: &Session, data: Bytes) -> Result<(), EndpointError> {
            self.events.lock().push(Event::Ping(data));
            Ok(())
        }

        fn on_pong(&self, _session: &Session, data: Bytes) -> Result<(), EndpointError> {
            self.events.lock().push(Event::Pong(data));
            Ok(())
        }

        fn on_close(&self, _session: &Session, reason: &CloseReason) {
            self.events.lock().push(Event::Close(reason.clone()));
        }

        fn on_error(&self, _session: &Session, error: &Error) {
            self.events.lock().push(Event::Error(error.to_string()));
        }
    }

    fn server_with(config: Config, recorder: Recorder) -> (Connection, Arc<Recorder>) {
        let recorder = Arc::new(recorder);
        let mut connection = Connection::new(
            Role::Server,
            &config,
            Negotiated::default(),
            recorder.clone(),
        );
        connection.open(Instant::now()).unwrap();
        (connection, recorder)
    }

    fn server() -> (Connection, Arc<Recorder>) {
        server_with(Config::default(), Recorder::default())
    }

    /// Wire bytes as the client would send them.
    fn from_client(frames: &[Frame]) -> Vec<u8> {
        let codec = FrameCodec::new(Role::Client, usize::MAX);
        let mut bytes = BytesMut::new();
        for frame in frames {
            codec.frame(frame, &mut bytes).unwrap();
        }
        bytes.to_vec()
    }

    /// Everything the connection has queued, parsed by a peer of the other role.
    fn sent(connection: &mut Connection) -> Vec<Frame> {
        let peer = match connection.shared.role {
            Role::Server => Role::Client,
            Role::Client => Role::Server,
        };
        let codec = FrameCodec::new(peer, usize::MAX);
        let mut bytes = BytesMut::new();
        while let Some(chunk) = connection.next_outbound(Instant::now()) {
            bytes.extend_from_slice(&chunk);
        }
        let mut frames = Vec::new();
        while let Some(frame) = codec.unframe(&mut bytes).unwrap() {
            frames.push(frame);
        }
        frames
    }

    fn close_of(frame: &Frame) -> CloseReason {
        assert_eq!(frame.opcode(), Opcode::Close);
        CloseReason::parse(frame.payload()).unwrap()
    }

    #[test]
    fn open_then_messages_in_wire_order() {
        let (mut connection, recorder) = server();
        let bytes = from_client(&[
            Frame::text("one"),
            Frame::builder(Opcode::Binary).fin(false).payload(vec![1u8]).build(),
            Frame::builder(Opcode::Continuation).payload(vec![2u8]).build(),
        ]);
        // Split mid-frame to make sure the tail is carried over.
        connection.receive(&bytes[..5], Instant::now());
        connection.receive(&bytes[5..], Instant::now());
        assert_eq!(
            recorder.events(),
            vec![
                Event::Open,
                Event::Message(Message::Text("one".into())),
                Event::Message(Message::Binary(Bytes::from_static(&[1, 2]))),
            ]
        );
        assert!(connection.open(Instant::now()).is_err());
    }

    #[test]
    fn ping_gets_automatic_pong() {
        let (mut connection, recorder) = server();
        connection.receive(&from_client(&[Frame::ping(Bytes::from_static(b"hi"))]), Instant::now());
        let frames = sent(&mut connection);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].opcode(), Opcode::Pong);
        assert_eq!(&frames[0].payload()[..], b"hi");
        assert_eq!(recorder.events()[1], Event::Ping(Bytes::from_static(b"hi")));
    }

    #[test]
    fn auto_pong_can_be_turned_off() {
        let mut config = Config::default();
        config.set_auto_pong(false);
        let (mut connection, recorder) = server_with(config, Recorder::default());
        connection.receive(&from_client(&[Frame::ping(Bytes::from_static(b"hi"))]), Instant::now());
        assert!(sent(&mut connection).is_empty());
        assert_eq!(recorder.events().len(), 2);
    }

    #[test]
    fn peer_close_is_echoed_and_reported_once() {
        let (mut connection, recorder) = server();
        let close = Frame::close(&CloseReason::new(CloseCode::GoingAway, "bye"));
        connection.receive(&from_client(&[close.clone()]), Instant::now());

        let frames = sent(&mut connection);
        assert_eq!(close_of(&frames[0]).code, CloseCode::GoingAway);
        assert!(connection.is_closed());

        connection.receive(&from_client(&[close]), Instant::now());
        connection.transport_closed();
        connection.tick(Instant::now() + Duration::from_secs(600));
        assert_eq!(
            recorder.closes(),
            vec![CloseReason::new(CloseCode::GoingAway, "bye")]
        );
        assert_eq!(
            connection.close_reason(),
            Some(CloseReason::new(CloseCode::GoingAway, "bye"))
        );
    }

    #[test]
    fn empty_close_is_echoed_empty() {
        let (mut connection, recorder) = server();
        connection.receive(&from_client(&[Frame::builder(Opcode::Close).build()]), Instant::now());
        let frames = sent(&mut connection);
        assert!(frames[0].payload().is_empty());
        assert_eq!(recorder.closes()[0].code, CloseCode::NoStatus);
    }

    #[test]
    fn local_close_waits_for_echo() {
        let (mut connection, recorder) = server();
        let session = connection.session().clone();
        session
            .close(CloseReason::new(CloseCode::Policy, "go away"))
            .unwrap();
        assert_eq!(session.state(), State::Closing);
        assert_eq!(close_of(&sent(&mut connection)[0]).code, CloseCode::Policy);
        assert!(matches!(session.send_text("late"), Err(Error::NotOpen(State::Closing))));
        // Closing twice is a no-op.
        session.close(CloseReason::normal()).unwrap();
        assert!(sent(&mut connection).is_empty());

        // Data still arriving before the echo is delivered.
        connection.receive(
            &from_client(&[
                Frame::text("in flight"),
                Frame::close(&CloseReason::new(CloseCode::Policy, "")),
            ]),
            Instant::now(),
        );
        assert!(connection.is_closed());
        assert!(sent(&mut connection).is_empty());
        assert_eq!(
            recorder.events()[1..],
            [
                Event::Message(Message::Text("in flight".into())),
                Event::Close(CloseReason::new(CloseCode::Policy, "")),
            ]
        );
    }

    #[test]
    fn empty_echo_reports_the_reason_we_sent() {
        let (mut connection, recorder) = server();
        connection
            .session()
            .close(CloseReason::new(CloseCode::Normal, "done"))
            .unwrap();
        connection.receive(&from_client(&[Frame::builder(Opcode::Close).build()]), Instant::now());
        assert_eq!(
            recorder.closes(),
            vec![CloseReason::new(CloseCode::Normal, "done")]
        );
    }

    #[test]
    fn close_handshake_times_out_as_abnormal() {
        let (mut connection, recorder) = server();
        connection.session().close(CloseReason::normal()).unwrap();
        let deadline = connection.next_deadline().unwrap();
        connection.tick(deadline - Duration::from_millis(1));
        assert_eq!(connection.state(), State::Closing);
        connection.tick(deadline);
        assert!(connection.is_closed());
        assert_eq!(recorder.closes().len(), 1);
        assert_eq!(recorder.closes()[0].code, CloseCode::Abnormal);
    }

    #[test]
    fn idle_connection_closes_normally() {
        let mut config = Config::default();
        config.set_idle_timeout(Some(Duration::from_secs(10)));
        let recorder = Arc::new(Recorder::default());
        let mut connection =
            Connection::new(Role::Server, &config, Negotiated::default(), recorder.clone());
        let start = Instant::now();
        connection.open(start).unwrap();
        assert_eq!(connection.next_deadline(), Some(start + Duration::from_secs(10)));

        connection.tick(start + Duration::from_secs(9));
        assert_eq!(connection.state(), State::Open);
        connection.tick(start + Duration::from_secs(10));
        assert_eq!(connection.state(), State::Closing);
        assert_eq!(close_of(&sent(&mut connection)[0]).code, CloseCode::Normal);

        connection.receive(&from_client(&[Frame::close(&CloseReason::normal())]), start);
        assert_eq!(recorder.closes(), vec![CloseReason::normal()]);
    }

    #[test]
    fn racing_closes_fire_on_close_once() {
        for _ in 0..200 {
            let (mut connection, recorder) = server();
            let session = connection.session().clone();
            let peer_close = from_client(&[Frame::close(&CloseReason::normal())]);

            let local = std::thread::spawn(move || session.close(CloseReason::normal()));
            connection.receive(&peer_close, Instant::now());
            local.join().unwrap().unwrap();
            connection.transport_closed();
            connection.tick(Instant::now());

            assert!(connection.is_closed());
            assert_eq!(recorder.closes().len(), 1);
            let closes = sent(&mut connection)
                .iter()
                .filter(|frame| frame.opcode() == Opcode::Close)
                .count();
            assert_eq!(closes, 1);
        }
    }

    #[test]
    fn unmasked_client_frame_fails_with_1002() {
        let (mut connection, recorder) = server();
        let mut bytes = BytesMut::new();
        FrameCodec::new(Role::Server, usize::MAX)
            .frame(&Frame::text("sneaky"), &mut bytes)
            .unwrap();
        connection.receive(&bytes, Instant::now());

        assert!(connection.is_closed());
        assert_eq!(close_of(&sent(&mut connection)[0]).code, CloseCode::Protocol);
        let events = recorder.events();
        assert!(matches!(events[1], Event::Error(_)));
        assert_eq!(recorder.closes()[0].code, CloseCode::Protocol);
    }

    #[test]
    fn oversized_message_fails_with_1009() {
        let mut config = Config::default();
        config.set_max_message_size(8);
        let (mut connection, recorder) = server_with(config, Recorder::default());
        connection.receive(
            &from_client(&[
                Frame::builder(Opcode::Binary).fin(false).payload(vec![0u8; 5]).build(),
                Frame::builder(Opcode::Continuation).payload(vec![0u8; 5]).build(),
            ]),
            Instant::now(),
        );
        assert_eq!(close_of(&sent(&mut connection)[0]).code, CloseCode::TooBig);
        assert!(!recorder
            .events()
            .iter()
            .any(|event| matches!(event, Event::Message(_))));
    }

    #[test]
    fn invalid_text_fails_with_1007() {
        let (mut connection, _) = server();
        connection.receive(
            &from_client(&[Frame::builder(Opcode::Text).payload(vec![0xc3u8]).build()]),
            Instant::now(),
        );
        assert_eq!(
            close_of(&sent(&mut connection)[0]).code,
            CloseCode::InvalidPayload
        );
    }

    #[test]
    fn server_rejects_client_only_codes() {
        let (mut connection, recorder) = server();
        let close = Frame::close(&CloseReason::new(CloseCode::TryAgainLater, ""));
        connection.receive(&from_client(&[close]), Instant::now());
        assert_eq!(close_of(&sent(&mut connection)[0]).code, CloseCode::Protocol);
        assert_eq!(recorder.closes()[0].code, CloseCode::Protocol);
    }

    #[test]
    fn unclaimed_rsv_bit_is_a_protocol_error() {
        let (mut connection, _) = server();
        let frame = Frame::builder(Opcode::Text).rsv1(true).payload("x").build();
        connection.receive(&from_client(&[frame]), Instant::now());
        assert_eq!(close_of(&sent(&mut connection)[0]).code, CloseCode::Protocol);
    }

    #[test]
    fn transport_loss_is_abnormal() {
        let (mut connection, recorder) = server();
        connection.transport_closed();
        connection.transport_closed();
        assert_eq!(recorder.closes().len(), 1);
        assert_eq!(recorder.closes()[0].code, CloseCode::Abnormal);
        assert!(sent(&mut connection).is_empty());
    }

    #[test]
    fn large_messages_are_fragmented() {
        let mut config = Config::default();
        config.set_fragment_size(4);
        let (mut connection, _) = server_with(config, Recorder::default());
        connection.session().send_text("abcdefghij").unwrap();

        let frames = sent(&mut connection);
        let opcodes: Vec<_> = frames.iter().map(|frame| frame.opcode()).collect();
        assert_eq!(
            opcodes,
            vec![Opcode::Text, Opcode::Continuation, Opcode::Continuation]
        );
        let fins: Vec<_> = frames.iter().map(|frame| frame.fin()).collect();
        assert_eq!(fins, vec![false, false, true]);

        let mut reassembler = MessageReassembler::new(1024, false);
        let message = frames
            .into_iter()
            .filter_map(|frame| reassembler.accept(frame).unwrap())
            .next();
        assert_eq!(
            message,
            Some(Assembled::Message(Message::Text("abcdefghij".into())))
        );
    }

    #[test]
    fn streamed_message_blocks_other_messages() {
        let (mut connection, _) = server();
        let session = connection.session().clone();
        session.send_text_fragment("hel", false).unwrap();
        assert!(matches!(session.send_text("x"), Err(Error::FragmentInProgress)));
        assert!(matches!(
            session.send_fragment(MessageKind::Binary, vec![1u8], true),
            Err(Error::FragmentInProgress)
        ));
        session.send_ping(Bytes::from_static(b"between")).unwrap();
        session.send_text_fragment("lo", true).unwrap();
        session.send_text("next").unwrap();

        let opcodes: Vec<_> = sent(&mut connection)
            .iter()
            .map(|frame| (frame.opcode(), frame.fin()))
            .collect();
        assert_eq!(
            opcodes,
            vec![
                (Opcode::Text, false),
                (Opcode::Ping, true),
                (Opcode::Continuation, true),
                (Opcode::Text, true),
            ]
        );
    }

    #[test]
    fn sends_before_open_are_refused() {
        let connection = Connection::new(
            Role::Client,
            &Config::default(),
            Negotiated::default(),
            Arc::new(Recorder::default()),
        );
        assert!(matches!(
            connection.session().send_text("early"),
            Err(Error::NotOpen(State::Connecting))
        ));
        assert!(connection.session().close(CloseReason::normal()).is_err());
    }

    #[test]
    fn oversized_ping_is_refused_without_closing() {
        let (connection, _) = server();
        assert!(connection.session().send_ping(vec![0u8; 126]).is_err());
        assert!(connection.session().is_open());
    }

    #[test]
    fn full_write_queue_fails_with_1011() {
        let mut config = Config::default();
        config.set_max_pending_write_bytes(100);
        let (mut connection, recorder) = server_with(config, Recorder::default());
        let session = connection.session().clone();
        session.send_binary(vec![0u8; 60]).unwrap();
        let error = session.send_binary(vec![0u8; 60]).unwrap_err();
        assert!(matches!(error, Error::WriteQueueFull { .. }));
        assert_eq!(error.close_code(), Some(CloseCode::Internal));

        // Queued data is dropped; only the close frame is left.
        let frames = sent(&mut connection);
        assert_eq!(frames.len(), 1);
        assert_eq!(close_of(&frames[0]).code, CloseCode::Internal);

        connection.tick(Instant::now());
        assert_eq!(recorder.closes()[0].code, CloseCode::Internal);
    }

    #[test]
    fn write_limit_counts_frame_headers() {
        let mut config = Config::default();
        config.set_max_pending_write_bytes(61);
        let (mut connection, _) = server_with(config, Recorder::default());
        // 60 bytes of payload take 62 on the wire.
        let error = connection.session().send_binary(vec![0u8; 60]).unwrap_err();
        assert!(matches!(error, Error::WriteQueueFull { pending: 0, limit: 61 }));
        let frames = sent(&mut connection);
        assert_eq!(frames.len(), 1);
        assert_eq!(close_of(&frames[0]).code, CloseCode::Internal);
    }

    #[test]
    fn peer_close_enters_closed_with_the_echo_still_queued() {
        let (mut connection, recorder) = server();
        connection.receive(&from_client(&[Frame::close(&CloseReason::normal())]), Instant::now());
        assert_eq!(connection.state(), State::Closed);
        assert_eq!(recorder.closes(), vec![CloseReason::normal()]);

        let echo = connection.next_outbound(Instant::now()).unwrap();
        assert_eq!(&echo[..], b"\x88\x02\x03\xe8");
        assert!(connection.next_outbound(Instant::now()).is_none());
    }

    struct Broken;

    impl Extension for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn process_incoming(&mut self, _frame: Frame) -> Result<Frame, ExtensionError> {
            Err("corrupt frame".into())
        }

        fn process_outgoing(&mut self, frame: Frame) -> Result<Frame, ExtensionError> {
            Ok(frame)
        }
    }

    #[test]
    fn failing_extension_closes_with_1011() {
        let recorder = Arc::new(Recorder::default());
        let negotiated = Negotiated {
            extensions: ExtensionChain::new(vec![Box::new(Broken)]),
            ..Negotiated::default()
        };
        let mut connection =
            Connection::new(Role::Server, &Config::default(), negotiated, recorder.clone());
        connection.open(Instant::now()).unwrap();
        connection.receive(&from_client(&[Frame::text("hello")]), Instant::now());

        let events = recorder.events();
        assert!(!events.iter().any(|event| matches!(event, Event::Message(_))));
        let errors: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                Event::Error(error) => Some(error.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("corrupt frame"));

        let frames = sent(&mut connection);
        assert_eq!(frames.len(), 1);
        assert_eq!(close_of(&frames[0]).code, CloseCode::Internal);
        assert!(connection.is_closed());
        assert_eq!(recorder.closes()[0].code, CloseCode::Internal);
    }

    #[test]
    fn session_over_the_limit_is_refused_with_1013() {
        let count = Arc::new(AtomicUsize::new(0));
        let admitted = SessionPermit::acquire(&count, Some(1));
        let negotiated = Negotiated {
            permit: Some(SessionPermit::acquire(&count, Some(1))),
            ..Negotiated::default()
        };
        let recorder = Arc::new(Recorder::default());
        let mut connection =
            Connection::new(Role::Server, &Config::default(), negotiated, recorder.clone());
        connection.open(Instant::now()).unwrap();

        assert_eq!(connection.state(), State::Closing);
        let frames = sent(&mut connection);
        assert_eq!(close_of(&frames[0]).code, CloseCode::TryAgainLater);
        assert_eq!(count.load(Ordering::Acquire), 2);

        connection.receive(&from_client(&[Frame::text("ignored")]), Instant::now());
        connection.receive(&from_client(&[Frame::close(&CloseReason::normal())]), Instant::now());
        assert!(connection.is_closed());
        assert!(recorder.events().is_empty());
        assert_eq!(count.load(Ordering::Acquire), 1);
        drop(admitted);
        assert_eq!(count.load(Ordering::Acquire), 0);
    }

    #[test]
    fn callback_errors_are_reported_and_survived() {
        let recorder = Recorder {
            fail_messages: true,
            ..Recorder::default()
        };
        let (mut connection, recorder) = server_with(Config::default(), recorder);
        connection.receive(&from_client(&[Frame::text("a"), Frame::text("b")]), Instant::now());
        assert!(connection.session().is_open());
        let errors = recorder
            .events()
            .iter()
            .filter(|event| matches!(event, Event::Error(_)))
            .count();
        assert_eq!(errors, 2);
    }

    #[test]
    fn partial_delivery() {
        let mut config = Config::default();
        config.set_partial_messages(true);
        let (mut connection, recorder) = server_with(config, Recorder::default());
        connection.receive(
            &from_client(&[
                Frame::builder(Opcode::Binary).fin(false).payload(vec![1u8]).build(),
                Frame::builder(Opcode::Continuation).payload(vec![2u8]).build(),
            ]),
            Instant::now(),
        );
        assert_eq!(
            recorder.events()[1..],
            [
                Event::Fragment(Fragment::Binary {
                    data: Bytes::from_static(&[1]),
                    last: false
                }),
                Event::Fragment(Fragment::Binary {
                    data: Bytes::from_static(&[2]),
                    last: true
                }),
            ]
        );
    }

    #[test]
    fn extensions_unwind_between_peers_and_are_destroyed_once() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = || {
            ExtensionChain::new(vec![
                xor_factory("e1", 0x0f, log.clone()).create(),
                xor_factory("e2", 0x3c, log.clone()).create(),
            ])
        };
        let negotiated = |extensions| Negotiated {
            extensions,
            ..Negotiated::default()
        };
        let client_recorder = Arc::new(Recorder::default());
        let server_recorder = Arc::new(Recorder::default());
        let mut client = Connection::new(
            Role::Client,
            &Config::default(),
            negotiated(chain()),
            client_recorder.clone(),
        );
        let mut server = Connection::new(
            Role::Server,
            &Config::default(),
            negotiated(chain()),
            server_recorder.clone(),
        );
        client.open(Instant::now()).unwrap();
        server.open(Instant::now()).unwrap();
        assert_eq!(client.session().extensions(), ["e1", "e2"]);

        client.session().send_text("hello").unwrap();
        while let Some(bytes) = client.next_outbound(Instant::now()) {
            server.receive(&bytes, Instant::now());
        }
        assert_eq!(
            server_recorder.events()[1],
            Event::Message(Message::Text("hello".into()))
        );
        assert_eq!(
            log.lock()[..],
            ["e2 out", "e1 out", "e1 in", "e2 in"]
        );

        server.session().close(CloseReason::normal()).unwrap();
        while let Some(bytes) = server.next_outbound(Instant::now()) {
            client.receive(&bytes, Instant::now());
        }
        while let Some(bytes) = client.next_outbound(Instant::now()) {
            server.receive(&bytes, Instant::now());
        }
        client.transport_closed();
        server.transport_closed();
        assert!(client.is_closed() && server.is_closed());
        assert_eq!(client_recorder.closes(), vec![CloseReason::new(CloseCode::Normal, "")]);
        assert_eq!(server_recorder.closes(), vec![CloseReason::normal()]);
        let destroys = log
            .lock()
            .iter()
            .filter(|entry| entry.ends_with("destroy"))
            .count();
        assert_eq!(destroys, 4);
    }

    #[test]
    fn deflate_between_peers() {
        let mut server_deflate = PerMessageDeflate::new(DeflateConfig::default());
        server_deflate.on_extension_negotiation(&[]).unwrap();
        let mut client_deflate = PerMessageDeflate::new(DeflateConfig::default());
        client_deflate.on_handshake_response(&[]).unwrap();
        let negotiated = |extension: PerMessageDeflate| Negotiated {
            extensions: ExtensionChain::new(vec![Box::new(extension)]),
            ..Negotiated::default()
        };

        let mut config = Config::default();
        config.set_fragment_size(256);
        let server_recorder = Arc::new(Recorder::default());
        let mut client = Connection::new(
            Role::Client,
            &config,
            negotiated(client_deflate),
            Arc::new(Recorder::default()),
        );
        let mut server = Connection::new(
            Role::Server,
            &Config::default(),
            negotiated(server_deflate),
            server_recorder.clone(),
        );
        client.open(Instant::now()).unwrap();
        server.open(Instant::now()).unwrap();

        let text = "the quick brown fox jumps over the lazy dog. ".repeat(100);
        client.session().send_text(text.as_str()).unwrap();
        client.session().send_text("again").unwrap();

        let mut wire = BytesMut::new();
        while let Some(bytes) = client.next_outbound(Instant::now()) {
            wire.extend_from_slice(&bytes);
        }
        let codec = FrameCodec::new(Role::Server, usize::MAX);
        let mut frames = Vec::new();
        let mut parsed = wire.clone();
        while let Some(frame) = codec.unframe(&mut parsed).unwrap() {
            frames.push(frame);
        }
        // Split before compression: one frame per 256 bytes, plus "again".
        let (last, first_message) = frames.split_last().unwrap();
        assert_eq!(first_message.len(), (text.len() + 255) / 256);
        assert!(first_message[0].rsv1() && last.rsv1());
        assert!(first_message[1..]
            .iter()
            .all(|frame| frame.opcode() == Opcode::Continuation && !frame.rsv1()));
        let compressed: usize = first_message.iter().map(|frame| frame.payload().len()).sum();
        assert!(compressed < text.len());

        server.receive(&wire, Instant::now());
        assert_eq!(
            server_recorder.events()[1..],
            [
                Event::Message(Message::Text(text)),
                Event::Message(Message::Text("again".into())),
            ]
        );
    }
}
