//! Protocol framer/dispatcher.
//!
//! One dispatcher owns the transport. Client threads call
//! [`Dispatcher::request`] (correlated, blocking) or [`Dispatcher::post`]
//! (fire-and-forget); a dedicated receiver thread owns the receive path and
//! routes every inbound frame exactly once:
//!
//! - a reply completes the waiter registered under its sequence number;
//! - a reply with no outstanding request is dropped, logged, and counted —
//!   it never completes an unrelated wait;
//! - an asynchronous notification is queued to the session's event channel
//!   in arrival order, never matched to a pending request;
//! - a malformed frame is dropped and logged; three *consecutive* malformed
//!   frames escalate to a desync, which fails every pending waiter and
//!   closes the transport, because silently hunting for the next frame
//!   boundary risks corrupting target state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tether_protocol::{Frame, Message};
use tracing::{debug, error, trace, warn};

use crate::error::{DebugError, Result};
use crate::events::{event_channel, TargetEvent, TargetEventReceiver, TargetEventSender};
use crate::transport::Transport;
use crate::types::Address;

/// Consecutive malformed frames tolerated before the session is forced to
/// detach.
pub const MALFORMED_FRAME_LIMIT: u32 = 3;

type ReplyWaiter = mpsc::Sender<Result<Message>>;

struct Shared
{
    transport: Box<dyn Transport>,
    pending: Mutex<HashMap<u32, ReplyWaiter>>,
    stray_replies: AtomicU64,
    shutdown: AtomicBool,
    events: TargetEventSender,
}

impl Shared
{
    fn fail_all_pending(&self, make_error: impl Fn() -> DebugError)
    {
        let waiters: Vec<ReplyWaiter> = match self.pending.lock() {
            Ok(mut pending) => pending.drain().map(|(_, waiter)| waiter).collect(),
            Err(_) => return,
        };
        for waiter in waiters {
            let _ = waiter.send(Err(make_error()));
        }
    }
}

/// Sequence-correlating frame dispatcher over a [`Transport`].
///
/// Dropping the dispatcher closes the transport and joins the receiver
/// thread; all blocked waiters are woken with [`DebugError::Detached`].
pub struct Dispatcher
{
    shared: Arc<Shared>,
    next_sequence: AtomicU32,
    receiver: Option<JoinHandle<()>>,
}

impl Dispatcher
{
    /// Start a dispatcher over a connected transport.
    ///
    /// Returns the dispatcher and the event channel receiver carrying
    /// asynchronous notifications in arrival order.
    #[must_use]
    pub fn start(transport: Box<dyn Transport>) -> (Self, TargetEventReceiver)
    {
        let (events, event_receiver) = event_channel();
        let shared = Arc::new(Shared {
            transport,
            pending: Mutex::new(HashMap::new()),
            stray_replies: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            events,
        });

        let receiver_shared = Arc::clone(&shared);
        let receiver = thread::Builder::new()
            .name("tether-recv".to_string())
            .spawn(move || receiver_loop(&receiver_shared))
            .ok();
        if receiver.is_none() {
            error!("failed to spawn receiver thread");
            shared.shutdown.store(true, Ordering::SeqCst);
            shared.transport.close();
        }

        (
            Dispatcher {
                shared,
                next_sequence: AtomicU32::new(0),
                receiver,
            },
            event_receiver,
        )
    }

    fn allocate_sequence(&self) -> u32
    {
        // Sequence zero is reserved for notifications.
        self.next_sequence.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }

    fn send_frame(&self, message: &Message, sequence: u32) -> Result<()>
    {
        let frame = Frame::new(message.kind(), sequence, message.encode_payload());
        let bytes = frame.encode()?;
        trace!(kind = message.kind_name(), sequence, "sending frame");
        self.shared.transport.send(&bytes)
    }

    /// Send a request and block until its correlated reply, the timeout, or
    /// detach.
    ///
    /// ## Errors
    ///
    /// `Timeout` when no reply arrives in time (the sequence is forgotten,
    /// so a late reply is counted as stray); `Detached` when the session
    /// detaches mid-wait; transport errors from the send.
    pub fn request(&self, message: &Message, timeout: Duration) -> Result<Message>
    {
        debug_assert!(message.expects_reply(), "posted a fire-and-forget kind as a request");
        if self.shared.shutdown.load(Ordering::SeqCst) {
            return Err(DebugError::Detached);
        }

        let sequence = self.allocate_sequence();
        let (reply_sender, reply_receiver) = mpsc::channel();
        {
            let mut pending = self.shared.pending.lock().map_err(|_| DebugError::Detached)?;
            pending.insert(sequence, reply_sender);
        }

        if let Err(err) = self.send_frame(message, sequence) {
            if let Ok(mut pending) = self.shared.pending.lock() {
                pending.remove(&sequence);
            }
            return Err(err);
        }

        match reply_receiver.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if let Ok(mut pending) = self.shared.pending.lock() {
                    pending.remove(&sequence);
                }
                warn!(kind = message.kind_name(), sequence, ?timeout, "request timed out");
                Err(DebugError::Timeout(timeout))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(DebugError::Detached),
        }
    }

    /// Send a fire-and-forget message (Continue, Step, Break, Detach).
    ///
    /// ## Errors
    ///
    /// Transport errors from the send; `Detached` after shutdown.
    pub fn post(&self, message: &Message) -> Result<()>
    {
        if self.shared.shutdown.load(Ordering::SeqCst) {
            return Err(DebugError::Detached);
        }
        let sequence = self.allocate_sequence();
        self.send_frame(message, sequence)
    }

    /// Number of replies dropped because no request was outstanding for
    /// their sequence number.
    #[must_use]
    pub fn stray_replies(&self) -> u64
    {
        self.shared.stray_replies.load(Ordering::SeqCst)
    }

    /// Close the transport, join the receiver thread, and wake every
    /// blocked waiter with `Detached`.
    pub fn shutdown(&mut self)
    {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("dispatcher shutting down");
        self.shared.transport.close();
        if let Some(receiver) = self.receiver.take() {
            let _ = receiver.join();
        }
        self.shared.fail_all_pending(|| DebugError::Detached);
    }
}

impl Drop for Dispatcher
{
    fn drop(&mut self)
    {
        self.shutdown();
    }
}

fn notification_event(message: Message) -> Option<TargetEvent>
{
    match message {
        Message::Stop {
            code,
            address,
            registers,
        } => Some(TargetEvent::Stopped {
            code,
            pc: Address::new(address),
            registers,
        }),
        Message::ModuleLoad { base, size, path } => Some(TargetEvent::ModuleLoaded {
            base: Address::new(base),
            size,
            path,
        }),
        Message::ModuleUnload { base } => Some(TargetEvent::ModuleUnloaded {
            base: Address::new(base),
        }),
        Message::Exited { code } => Some(TargetEvent::Exited { code }),
        _ => None,
    }
}

fn receiver_loop(shared: &Shared)
{
    let mut malformed_run: u32 = 0;
    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            shared.fail_all_pending(|| DebugError::Detached);
            return;
        }

        let bytes = match shared.transport.receive(None) {
            Ok(bytes) => bytes,
            Err(DebugError::Wire(err)) => {
                // The stream produced bytes that cannot be framed.
                malformed_run += 1;
                warn!(%err, malformed_run, "dropping malformed frame");
                if malformed_run >= MALFORMED_FRAME_LIMIT {
                    desync(shared, malformed_run);
                    return;
                }
                continue;
            }
            Err(err) => {
                let detail = err.to_string();
                let deliberate = matches!(err, DebugError::Closed | DebugError::Detached);
                if deliberate {
                    debug!("receiver exiting: transport closed");
                } else {
                    warn!(%err, "receiver exiting: connection lost");
                    let _ = shared.events.send(TargetEvent::ConnectionLost { detail: detail.clone() });
                }
                shared.fail_all_pending(|| {
                    if deliberate {
                        DebugError::Detached
                    } else {
                        DebugError::Connection(detail.clone())
                    }
                });
                return;
            }
        };

        let decoded = Frame::decode(&bytes)
            .and_then(|frame| Message::decode(frame.kind, &frame.payload).map(|message| (frame.sequence, message)));
        let (sequence, message) = match decoded {
            Ok(decoded) => decoded,
            Err(err) => {
                malformed_run += 1;
                warn!(%err, malformed_run, "dropping malformed frame");
                if malformed_run >= MALFORMED_FRAME_LIMIT {
                    desync(shared, malformed_run);
                    return;
                }
                continue;
            }
        };

        if message.is_notification() {
            malformed_run = 0;
            trace!(kind = message.kind_name(), "notification");
            if let Some(event) = notification_event(message) {
                // The session hung up; nothing left to deliver to.
                if shared.events.send(event).is_err() {
                    return;
                }
            }
        } else if message.is_reply() {
            malformed_run = 0;
            let waiter = shared
                .pending
                .lock()
                .ok()
                .and_then(|mut pending| pending.remove(&sequence));
            match waiter {
                Some(waiter) => {
                    trace!(kind = message.kind_name(), sequence, "reply correlated");
                    let _ = waiter.send(Ok(message));
                }
                None => {
                    shared.stray_replies.fetch_add(1, Ordering::SeqCst);
                    warn!(kind = message.kind_name(), sequence, "stray reply with no outstanding request");
                }
            }
        } else {
            // A request kind arriving at the client is as wrong as garbage.
            malformed_run += 1;
            warn!(
                kind = message.kind_name(),
                sequence, malformed_run, "request kind received from target"
            );
            if malformed_run >= MALFORMED_FRAME_LIMIT {
                desync(shared, malformed_run);
                return;
            }
        }
    }
}

fn desync(shared: &Shared, malformed_run: u32)
{
    error!(malformed_run, "protocol desynchronized, forcing detach");
    shared.fail_all_pending(|| DebugError::Desync(malformed_run));
    let _ = shared.events.send(TargetEvent::Desync {
        malformed: malformed_run,
    });
    shared.shutdown.store(true, Ordering::SeqCst);
    shared.transport.close();
}

#[cfg(test)]
mod tests
{
    use std::collections::VecDeque;
    use std::sync::{Condvar, Mutex};
    use std::time::Duration;

    use tether_protocol::{Frame, Message};

    use super::*;

    type Autoresponder = Box<dyn Fn(&Frame) -> Vec<Frame> + Send + Sync>;

    /// In-memory transport with a scripted target behind it.
    struct ScriptedTransport
    {
        inbound: Mutex<VecDeque<Vec<u8>>>,
        available: Condvar,
        closed: Mutex<bool>,
        respond: Autoresponder,
    }

    impl ScriptedTransport
    {
        fn new(respond: Autoresponder) -> Arc<Self>
        {
            Arc::new(ScriptedTransport {
                inbound: Mutex::new(VecDeque::new()),
                available: Condvar::new(),
                closed: Mutex::new(false),
                respond,
            })
        }

        fn push_raw(&self, bytes: Vec<u8>)
        {
            self.inbound.lock().unwrap().push_back(bytes);
            self.available.notify_all();
        }

        fn push_frame(&self, frame: &Frame)
        {
            self.push_raw(frame.encode().unwrap());
        }
    }

    impl Transport for Arc<ScriptedTransport>
    {
        fn send(&self, frame: &[u8]) -> Result<()>
        {
            if *self.closed.lock().unwrap() {
                return Err(DebugError::Closed);
            }
            let decoded = Frame::decode(frame).expect("client sent malformed frame");
            for reply in (self.respond)(&decoded) {
                self.push_frame(&reply);
            }
            Ok(())
        }

        fn receive(&self, timeout: Option<Duration>) -> Result<Vec<u8>>
        {
            let mut inbound = self.inbound.lock().unwrap();
            loop {
                if let Some(bytes) = inbound.pop_front() {
                    return Ok(bytes);
                }
                if *self.closed.lock().unwrap() {
                    return Err(DebugError::Closed);
                }
                inbound = match timeout {
                    Some(limit) => {
                        let (guard, wait) = self.available.wait_timeout(inbound, limit).unwrap();
                        if wait.timed_out() {
                            return Err(DebugError::Timeout(limit));
                        }
                        guard
                    }
                    None => self
                        .available
                        .wait_timeout(inbound, Duration::from_millis(20))
                        .unwrap()
                        .0,
                };
            }
        }

        fn close(&self)
        {
            *self.closed.lock().unwrap() = true;
            self.available.notify_all();
        }
    }

    fn reply_frame(request: &Frame, message: &Message) -> Frame
    {
        Frame::new(message.kind(), request.sequence, message.encode_payload())
    }

    #[test]
    fn test_request_reply_correlation()
    {
        let transport = ScriptedTransport::new(Box::new(|request| {
            let message = Message::decode(request.kind, &request.payload).unwrap();
            match message {
                Message::ReadMemory { length, .. } => vec![reply_frame(
                    request,
                    &Message::MemoryData {
                        data: vec![0xaa; length as usize],
                    },
                )],
                _ => vec![reply_frame(request, &Message::Ack)],
            }
        }));
        let (dispatcher, _events) = Dispatcher::start(Box::new(Arc::clone(&transport)));

        let reply = dispatcher
            .request(
                &Message::ReadMemory {
                    address: 0x1000,
                    length: 4,
                },
                Duration::from_secs(5),
            )
            .unwrap();
        assert_eq!(reply, Message::MemoryData { data: vec![0xaa; 4] });
        assert_eq!(dispatcher.stray_replies(), 0);
    }

    #[test]
    fn test_stray_reply_counted_not_matched()
    {
        let transport = ScriptedTransport::new(Box::new(|_| Vec::new()));
        let (dispatcher, _events) = Dispatcher::start(Box::new(Arc::clone(&transport)));

        // A reply bearing a sequence number nobody asked for.
        transport.push_frame(&Frame::new(Message::Ack.kind(), 777, Vec::new()));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while dispatcher.stray_replies() == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(dispatcher.stray_replies(), 1);
    }

    #[test]
    fn test_late_reply_after_timeout_is_stray()
    {
        let transport = ScriptedTransport::new(Box::new(|_| Vec::new()));
        let (dispatcher, _events) = Dispatcher::start(Box::new(Arc::clone(&transport)));

        let outcome = dispatcher.request(&Message::GetRegisters, Duration::from_millis(50));
        assert!(matches!(outcome, Err(DebugError::Timeout(_))));

        // The reply shows up late; its sequence was forgotten on timeout.
        transport.push_frame(&Frame::new(Message::RegisterData { data: Vec::new() }.kind(), 1, Vec::new()));
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while dispatcher.stray_replies() == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(dispatcher.stray_replies(), 1);
    }

    #[test]
    fn test_notifications_flow_to_event_channel()
    {
        let transport = ScriptedTransport::new(Box::new(|_| Vec::new()));
        let (_dispatcher, events) = Dispatcher::start(Box::new(Arc::clone(&transport)));

        transport.push_frame(&Frame::new(
            Message::ModuleUnload { base: 0x4000_0000 }.kind(),
            0,
            Message::ModuleUnload { base: 0x4000_0000 }.encode_payload(),
        ));

        let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(
            event,
            TargetEvent::ModuleUnloaded {
                base: Address::new(0x4000_0000)
            }
        );
    }

    #[test]
    fn test_three_malformed_frames_escalate_to_desync()
    {
        let transport = ScriptedTransport::new(Box::new(|_| Vec::new()));
        let (_dispatcher, events) = Dispatcher::start(Box::new(Arc::clone(&transport)));

        for _ in 0..MALFORMED_FRAME_LIMIT {
            transport.push_raw(vec![0xff; 24]);
        }

        let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(
            event,
            TargetEvent::Desync {
                malformed: MALFORMED_FRAME_LIMIT
            }
        );
    }

    #[test]
    fn test_good_frame_resets_malformed_run()
    {
        let transport = ScriptedTransport::new(Box::new(|_| Vec::new()));
        let (dispatcher, events) = Dispatcher::start(Box::new(Arc::clone(&transport)));

        transport.push_raw(vec![0xff; 24]);
        transport.push_raw(vec![0xff; 24]);
        // A well-formed notification resets the run.
        transport.push_frame(&Frame::new(
            Message::Exited { code: 0 }.kind(),
            0,
            Message::Exited { code: 0 }.encode_payload(),
        ));
        transport.push_raw(vec![0xff; 24]);
        transport.push_raw(vec![0xff; 24]);

        let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(event, TargetEvent::Exited { code: 0 });
        // No desync: the run never reached the limit.
        assert!(events.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(dispatcher.stray_replies(), 0);
    }

    #[test]
    fn test_shutdown_wakes_pending_request()
    {
        let transport = ScriptedTransport::new(Box::new(|_| Vec::new()));
        let (dispatcher, _events) = Dispatcher::start(Box::new(Arc::clone(&transport)));
        let dispatcher = Arc::new(Mutex::new(dispatcher));

        let requester = Arc::clone(&dispatcher);
        let worker = thread::spawn(move || {
            let dispatcher = requester.lock().unwrap();
            dispatcher.request(&Message::GetRegisters, Duration::from_secs(30))
        });

        thread::sleep(Duration::from_millis(100));
        transport.close();
        let outcome = worker.join().unwrap();
        assert!(outcome.is_err());
    }
}
