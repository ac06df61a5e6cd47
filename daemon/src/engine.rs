//! The daemon reactor. Single-threaded cooperative scheduling over a mio
//! poll: one listening socket plus one registered stream per accepted
//! client. Each iteration accepts new clients, drains readable streams
//! into per-client buffers, dispatches complete frames against the store
//! and the notification registry, and flushes outbound queues.

use crate::notify::NotifyRegistry;
use buxton::buffer::Buffer;
use buxton::error::{Status, WireError};
use buxton::key::Key;
use buxton::logging::{self, Logger};
use buxton::message::{self, Request};
use buxton::store::{Caller, Store};
use buxton::value::Datum;
use buxton::wire::{self, Message, BUXTON_MESSAGE_MAX_LENGTH, BUXTON_MESSAGE_MAX_PARAMS};
use indexmap::IndexSet;
use mio::net::{UnixListener, UnixStream};
use mio::{Events, Interest, Poll, Token};
use nix::sys::socket::{getsockopt, sockopt};
use std::collections::VecDeque;
use std::fs;
use std::io::{self, Write};
use std::os::fd::BorrowedFd;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const LISTENER: Token = Token(0);

/// Outbound frames a client may queue before the reactor stops reading
/// from it.
const MAX_OUTBOUND_FRAMES: usize = 64;

/// A client that cannot be drained for this long is closed.
const STALL_TIMEOUT: Duration = Duration::from_secs(30);

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(3);

/// Poll timeout; bounds how long a shutdown request can go unnoticed.
const POLL_TIMEOUT: Duration = Duration::from_millis(200);

struct ClientConn {
    stream: UnixStream,
    caller: Caller,
    inbound: Buffer,
    outbound: VecDeque<Vec<u8>>,
    write_offset: usize,
    last_progress: Instant,
    paused: bool,
    log: Logger,
}

impl ClientConn {
    #[inline]
    fn interests(&self) -> Interest {
        if self.paused {
            Interest::WRITABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        }
    }
}

/// The request-processing engine: poll loop, client table, dispatcher.
pub struct Engine {
    listener: UnixListener,
    poll: Poll,
    events: Events,
    store: Store,
    notifications: NotifyRegistry,
    clients: Vec<Option<ClientConn>>,
    free: Vec<usize>,
    live: IndexSet<usize>,
    shutdown: Arc<AtomicBool>,
    socket_path: PathBuf,
    housekeeping_time: Instant,
    log: Logger,
}

impl Engine {
    /// Bind the listening socket and prepare the reactor. The socket file
    /// is recreated with mode 0666 so unprivileged clients can connect.
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        store: Store,
        socket_path: &Path,
        shutdown: Arc<AtomicBool>,
        log: L,
    ) -> io::Result<Engine> {
        let log = logging::child(log);

        match fs::remove_file(socket_path) {
            Ok(()) => (),
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => (),
            Err(e) => return Err(e),
        }

        let mut listener = UnixListener::bind(socket_path)?;
        fs::set_permissions(socket_path, fs::Permissions::from_mode(0o666))?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        let now = Instant::now();

        Ok(Engine {
            listener,
            poll,
            events: Events::with_capacity(1024),
            store,
            notifications: NotifyRegistry::new(&log),
            clients: Vec::new(),
            free: Vec::new(),
            live: IndexSet::new(),
            shutdown,
            socket_path: socket_path.to_owned(),
            housekeeping_time: now,
            log,
        })
    }

    /// Run until the shutdown flag is raised, then flush and close
    /// everything.
    pub fn run(&mut self) {
        logging::info!(self.log, "daemon started";
                       "context" => "run",
                       "socket" => %self.socket_path.display());

        while !self.shutdown.load(Ordering::SeqCst) {
            if let Err(e) = self.run_once(POLL_TIMEOUT) {
                logging::error!(self.log, "poll failed, shutting down";
                                "context" => "run",
                                "error" => %e);
                break;
            }
        }

        self.shutdown_all();
    }

    /// One reactor iteration.
    pub fn run_once(&mut self, timeout: Duration) -> io::Result<()> {
        self.poll.poll(&mut self.events, Some(timeout))?;

        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|e| (e.token(), e.is_readable(), e.is_writable()))
            .collect();

        let now = Instant::now();
        if now.duration_since(self.housekeeping_time) >= HOUSEKEEPING_INTERVAL {
            self.housekeeping(now);
            self.housekeeping_time = now;
        }

        for (token, readable, writable) in ready {
            if token == LISTENER {
                self.accept_clients();
                continue;
            }

            let slot = token.0 - 1;
            if self.clients.get(slot).map_or(true, Option::is_none) {
                continue;
            }

            if writable {
                self.flush_client(slot);
            }
            if readable && self.clients[slot].is_some() {
                self.read_client(slot);
            }
        }

        Ok(())
    }

    /// Accept every waiting connection, learning each client's identity
    /// once from the socket's peer credentials.
    fn accept_clients(&mut self) {
        loop {
            let (mut stream, _) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    logging::warn!(self.log, "accept failed";
                                   "context" => "accept", "error" => %e);
                    break;
                }
            };

            let caller = match peer_credentials(&stream) {
                Ok((uid, pid)) => Caller::remote(uid, pid),
                Err(e) => {
                    logging::warn!(self.log, "peer credentials unavailable, dropping client";
                                   "context" => "accept", "error" => %e);
                    continue;
                }
            };

            let slot = match self.free.pop() {
                Some(slot) => slot,
                None => {
                    self.clients.push(None);
                    self.clients.len() - 1
                }
            };

            if let Err(e) = self.poll.registry().register(
                &mut stream,
                Token(slot + 1),
                Interest::READABLE | Interest::WRITABLE,
            ) {
                logging::warn!(self.log, "stream registration failed";
                               "context" => "accept", "error" => %e);
                self.free.push(slot);
                continue;
            }

            logging::debug!(self.log, "client connected";
                            "context" => "accept",
                            "client" => slot,
                            "uid" => caller.uid,
                            "pid" => caller.pid);

            self.clients[slot] = Some(ClientConn {
                stream,
                caller,
                inbound: Buffer::new(BUXTON_MESSAGE_MAX_LENGTH),
                outbound: VecDeque::new(),
                write_offset: 0,
                last_progress: Instant::now(),
                paused: false,
                log: self.log.new(logging::o!("client" => slot)),
            });
            self.live.insert(slot);
        }
    }

    /// Drain the client's stream and dispatch every complete frame. A
    /// zero-length read on a readable socket means the peer is gone; any
    /// framing fault closes the connection.
    fn read_client(&mut self, slot: usize) {
        loop {
            let ingress = {
                let conn = match &mut self.clients[slot] {
                    Some(conn) => conn,
                    None => return,
                };

                let had_capacity = conn.inbound.free_capacity() > 0;
                match conn.inbound.ingress(&mut conn.stream) {
                    Ok(count) => Ok((count, had_capacity, conn.inbound.free_capacity() == 0)),
                    Err(e) => {
                        logging::debug!(conn.log, "read failed";
                                        "context" => "read", "error" => %e);
                        Err(())
                    }
                }
            };

            let (received, had_capacity, filled) = match ingress {
                Ok(state) => state,
                Err(()) => {
                    self.disconnect(slot);
                    return;
                }
            };

            if received == 0 && had_capacity {
                logging::debug!(self.log, "client disconnected";
                                "context" => "read", "client" => slot);
                self.disconnect(slot);
                return;
            }

            if !self.process_frames(slot) {
                return;
            }

            // A full buffer may have left data in the kernel; go again
            // now that frames were consumed.
            if !filled {
                break;
            }
        }
    }

    /// Extract complete frames from the inbound buffer. Returns false
    /// when the client was disconnected.
    fn process_frames(&mut self, slot: usize) -> bool {
        enum Framed {
            Message(Message),
            Wait,
            Fatal,
        }

        loop {
            let framed = {
                let conn = match &mut self.clients[slot] {
                    Some(conn) => conn,
                    None => return false,
                };

                match wire::get_message_size(conn.inbound.read_slice()) {
                    Ok(size) if conn.inbound.len() < size => Framed::Wait,
                    Ok(size) => {
                        let result = wire::deserialize_message(&conn.inbound.read_slice()[..size]);
                        conn.inbound.move_head(size);

                        match result {
                            Ok(message) => Framed::Message(message),
                            Err(e) => {
                                logging::warn!(conn.log, "frame failed to decode, closing connection";
                                               "context" => "framing",
                                               "error" => ?e);
                                Framed::Fatal
                            }
                        }
                    }
                    Err(WireError::Wait) => Framed::Wait,
                    Err(WireError::Fatal(fault)) => {
                        logging::warn!(conn.log, "invalid frame header, closing connection";
                                       "context" => "framing",
                                       "fault" => ?fault);
                        Framed::Fatal
                    }
                }
            };

            let message = match framed {
                Framed::Message(message) => message,
                Framed::Wait => return true,
                Framed::Fatal => {
                    self.disconnect(slot);
                    return false;
                }
            };

            self.handle_request(slot, message);

            if self.clients[slot].is_none() {
                return false;
            }
        }
    }

    /// Dispatch one request: run it against the store, queue exactly one
    /// STATUS reply, and fan out CHANGED frames for a successful
    /// modification.
    fn handle_request(&mut self, slot: usize, message: Message) {
        let caller = match &self.clients[slot] {
            Some(conn) => conn.caller,
            None => return,
        };
        let msgid = message.msgid;

        let request = match Request::from_message(&message) {
            Ok(request) => request,
            Err(status) => {
                logging::debug!(self.log, "malformed request";
                                "context" => "dispatch",
                                "client" => slot,
                                "msgid" => msgid,
                                "status" => %status);
                self.queue_frame(slot, &message::status_reply(msgid, status, Vec::new()));
                return;
            }
        };

        logging::trace!(self.log, "request dispatched";
                        "context" => "dispatch",
                        "client" => slot,
                        "msgid" => msgid,
                        "request" => ?request.control());

        let mut change: Option<(Key, Option<Datum>)> = None;

        let (status, extra) = match request {
            Request::Set { key, value } => {
                match self
                    .store
                    .set(&key, value.value.clone(), &value.label, caller)
                {
                    Ok(()) => {
                        // The stored record may keep a pre-existing
                        // label; notify subscribers with what was kept.
                        let stored = self
                            .store
                            .get_for_layer(&key, caller, false)
                            .unwrap_or(value);
                        change = Some((key.clone(), Some(stored)));
                        (Status::Ok, vec![Datum::unlabeled(&key.to_string())])
                    }
                    Err(status) => (status, Vec::new()),
                }
            }
            Request::SetLabel { key, label } => match self.store.set_label(&key, &label, caller) {
                Ok(()) => (Status::Ok, vec![Datum::unlabeled(&key.to_string())]),
                Err(status) => (status, Vec::new()),
            },
            Request::CreateGroup { key } => match self.store.create_group(&key, None, caller) {
                Ok(()) => (Status::Ok, vec![Datum::unlabeled(&key.to_string())]),
                Err(status) => (status, Vec::new()),
            },
            Request::RemoveGroup { key } => match self.store.remove_group(&key, caller) {
                Ok(()) => {
                    change = Some((key.clone(), None));
                    (Status::Ok, vec![Datum::unlabeled(&key.to_string())])
                }
                Err(status) => (status, Vec::new()),
            },
            Request::Get { key } => match self.store.get(&key, caller) {
                Ok((record, layer)) => (Status::Ok, vec![record, Datum::unlabeled(&layer)]),
                Err(status) => (status, Vec::new()),
            },
            Request::Unset { key } => match self.store.unset(&key, caller) {
                Ok(()) => {
                    change = Some((key.clone(), None));
                    (Status::Ok, vec![Datum::unlabeled(&key.to_string())])
                }
                Err(status) => (status, Vec::new()),
            },
            Request::List { layer } => match self.store.list_keys(&layer, caller) {
                Ok(keys) => {
                    // The key list has to fit one frame next to the
                    // status code.
                    if keys.len() + 1 > BUXTON_MESSAGE_MAX_PARAMS {
                        logging::warn!(self.log, "key list exceeds frame capacity";
                                       "context" => "dispatch",
                                       "layer" => &layer,
                                       "keys" => keys.len());
                        (Status::Failed, Vec::new())
                    } else {
                        let extra = keys
                            .iter()
                            .map(|k| Datum::unlabeled(&k.display_name()))
                            .collect();
                        (Status::Ok, extra)
                    }
                }
                Err(status) => (status, Vec::new()),
            },
            Request::Notify { key } => {
                if self.notifications.register(&key, slot, msgid) {
                    (Status::Ok, vec![Datum::unlabeled(&key.display_name())])
                } else {
                    (Status::Failed, Vec::new())
                }
            }
            Request::Unnotify { key, msgid: target } => {
                if self.notifications.unregister(&key, slot, target) {
                    (
                        Status::Ok,
                        vec![
                            Datum::unlabeled(&key.display_name()),
                            Datum::from(buxton::value::Value::UInt64(target)),
                        ],
                    )
                } else {
                    (Status::Failed, Vec::new())
                }
            }
        };

        self.queue_frame(slot, &message::status_reply(msgid, status, extra));

        if let Some((key, value)) = change {
            self.fan_out(&key, value.as_ref());
        }
    }

    /// Enqueue a CHANGED frame for every subscriber of the modified key,
    /// each carrying the msgid of that subscriber's registration.
    fn fan_out(&mut self, key: &Key, value: Option<&Datum>) {
        for (slot, msgid) in self.notifications.subscribers(key) {
            let frame = message::changed_notification(msgid, key, value);

            logging::trace!(self.log, "change notification queued";
                            "context" => "fan_out",
                            "key" => key.display_name(),
                            "client" => slot,
                            "msgid" => msgid);

            self.queue_frame(slot, &frame);
        }
    }

    /// Serialize a frame onto a client's outbound queue and try to flush
    /// it right away. Applies backpressure when the queue grows past the
    /// bound.
    fn queue_frame(&mut self, slot: usize, message: &Message) {
        let frame = match wire::serialize_message(message) {
            Ok(frame) => frame,
            Err(e) => {
                logging::error!(self.log, "reply failed to serialize";
                                "context" => "queue",
                                "client" => slot,
                                "error" => ?e);
                return;
            }
        };

        match &mut self.clients[slot] {
            Some(conn) => conn.outbound.push_back(frame),
            None => return,
        }

        self.flush_client(slot);

        if let Some(conn) = &mut self.clients[slot] {
            if !conn.paused && conn.outbound.len() > MAX_OUTBOUND_FRAMES {
                logging::debug!(conn.log, "outbound queue full, pausing reads";
                                "context" => "backpressure",
                                "queued" => conn.outbound.len());
                conn.paused = true;
                let interests = conn.interests();
                let _ = self
                    .poll
                    .registry()
                    .reregister(&mut conn.stream, Token(slot + 1), interests);
            }
        }
    }

    /// Write queued frames until the socket would block or the queue
    /// drains; resume reading once drained.
    fn flush_client(&mut self, slot: usize) {
        let mut resume = false;
        let mut failed = false;

        {
            let conn = match &mut self.clients[slot] {
                Some(conn) => conn,
                None => return,
            };

            while let Some(frame) = conn.outbound.front() {
                match (&mut conn.stream).write(&frame[conn.write_offset..]) {
                    Ok(0) => {
                        logging::debug!(conn.log, "zero-length write, closing";
                                        "context" => "flush");
                        failed = true;
                        break;
                    }
                    Ok(count) => {
                        conn.write_offset += count;
                        conn.last_progress = Instant::now();
                        if conn.write_offset == frame.len() {
                            conn.outbound.pop_front();
                            conn.write_offset = 0;
                        }
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        logging::debug!(conn.log, "write failed";
                                        "context" => "flush", "error" => %e);
                        failed = true;
                        break;
                    }
                }
            }

            if !failed && conn.paused && conn.outbound.is_empty() {
                conn.paused = false;
                resume = true;
            }
        }

        if failed {
            self.disconnect(slot);
            return;
        }

        if resume {
            if let Some(conn) = &mut self.clients[slot] {
                let interests = conn.interests();
                logging::debug!(conn.log, "outbound queue drained, resuming reads";
                                "context" => "backpressure");
                let _ = self
                    .poll
                    .registry()
                    .reregister(&mut conn.stream, Token(slot + 1), interests);
            }
        }
    }

    /// Periodic sweep closing clients whose outbound queue has been
    /// stuck past the stall timeout.
    fn housekeeping(&mut self, now: Instant) {
        let stalled: Vec<usize> = self
            .live
            .iter()
            .copied()
            .filter(|&slot| match &self.clients[slot] {
                Some(conn) => {
                    !conn.outbound.is_empty()
                        && now.duration_since(conn.last_progress) >= STALL_TIMEOUT
                }
                None => false,
            })
            .collect();

        for slot in stalled {
            logging::warn!(self.log, "client stalled, closing";
                           "context" => "housekeeping",
                           "client" => slot);
            self.disconnect(slot);
        }
    }

    fn disconnect(&mut self, slot: usize) {
        let mut conn = match self.clients[slot].take() {
            Some(conn) => conn,
            None => return,
        };

        let _ = self.poll.registry().deregister(&mut conn.stream);

        logging::debug!(conn.log, "client closed";
                        "context" => "disconnect",
                        "queued" => conn.outbound.len(),
                        "buffered" => conn.inbound.len());

        self.notifications.drop_client(slot);
        self.live.swap_remove(&slot);
        self.free.push(slot);
    }

    /// Stop accepting, flush what can be flushed, close every client and
    /// remove the socket file.
    fn shutdown_all(&mut self) {
        logging::info!(self.log, "daemon shutting down";
                       "context" => "shutdown",
                       "clients" => self.live.len());

        let slots: Vec<usize> = self.live.iter().copied().collect();
        for slot in slots {
            self.flush_client(slot);
            self.disconnect(slot);
        }

        let _ = fs::remove_file(&self.socket_path);
    }
}

/// Fetch the peer's uid and pid once at accept time.
fn peer_credentials(stream: &UnixStream) -> io::Result<(u32, i32)> {
    let fd = unsafe { BorrowedFd::borrow_raw(stream.as_raw_fd()) };
    let creds = getsockopt(&fd, sockopt::PeerCredentials)
        .map_err(|e| io::Error::from_raw_os_error(e as i32))?;

    Ok((creds.uid(), creds.pid()))
}
