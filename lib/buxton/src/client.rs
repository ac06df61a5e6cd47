//! The client-side request/callback reactor.
//!
//! A `Client` owns a connected stream plus two callback tables: pending
//! requests awaiting their STATUS reply, and promoted notification
//! registrations awaiting CHANGED frames. One mutex guards both tables
//! and serializes frame writes so concurrent submitters cannot interleave
//! bytes; a second mutex (owning the receive buffer) serializes reads.

use crate::buffer::Buffer;
use crate::error::{Status, WireError};
use crate::key::Key;
use crate::logging::{self, Logger};
use crate::message::{self, Request};
use crate::value::{Datum, Value};
use crate::wire::{self, ControlCode, Message, BUXTON_MESSAGE_MAX_LENGTH};
use hashbrown::HashMap;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Pending callbacks older than this are reaped, without being invoked,
/// at the next submit.
const CALLBACK_TIMEOUT: Duration = Duration::from_secs(3);

/// How long the sync wrapper waits for the daemon before reporting it
/// down, and how long a blocked submit waits for the socket to drain.
const SYNC_TIMEOUT_MS: u16 = 5000;

const RECV_BUF_SIZE: usize = BUXTON_MESSAGE_MAX_LENGTH * 4;

/// Message ids are drawn from a process-wide counter so they stay
/// strictly increasing no matter how many clients a process opens.
static MSGID: AtomicU64 = AtomicU64::new(1);

#[inline]
fn next_msgid() -> u64 {
    MSGID.fetch_add(1, Ordering::Relaxed)
}

/// A reply or notification delivered to a callback.
#[derive(Debug, Clone)]
pub struct Response {
    /// The control code of the originating request, or `Changed` for
    /// notification deliveries.
    pub kind: ControlCode,
    pub status: Status,
    /// Reply parameters after the status code; CHANGED parameters as-is.
    pub data: Vec<Datum>,
}

impl Response {
    /// The delivered value: the payload of a GET reply or the new value
    /// of a CHANGED frame (absent for unset/removed notifications).
    pub fn value(&self) -> Option<&Datum> {
        match self.kind {
            ControlCode::Get => self.data.first(),
            ControlCode::Changed => self.data.get(1),
            _ => None,
        }
    }

    /// The echoed key, in display form. GET replies echo the resolving
    /// layer instead of a key.
    pub fn key_name(&self) -> Option<&str> {
        match self.kind {
            ControlCode::Get => None,
            _ => self.data.first().and_then(Datum::as_str),
        }
    }
}

type Callback = Box<dyn FnMut(&Response) + Send>;

struct PendingEntry {
    callback: Callback,
    submitted: Instant,
    kind: ControlCode,
}

struct Tables {
    pending: HashMap<u64, PendingEntry>,
    notify: HashMap<u64, PendingEntry>,
}

/// A connection to the daemon. Callable from any thread; see the module
/// docs for the locking model. Callbacks run with the tables locked and
/// must not call back into the same client.
pub struct Client {
    stream: UnixStream,
    tables: Mutex<Tables>,
    recv: Mutex<Buffer>,
    log: Logger,
}

impl Client {
    /// Connect to the daemon's socket.
    pub fn open<'a, L: Into<Option<&'a Logger>>>(path: &Path, log: L) -> Result<Client, Status> {
        let stream = UnixStream::connect(path).map_err(|_| Status::ServerDown)?;
        Self::from_stream(stream, log).map_err(|_| Status::ServerDown)
    }

    fn from_stream<'a, L: Into<Option<&'a Logger>>>(
        stream: UnixStream,
        log: L,
    ) -> std::io::Result<Client> {
        stream.set_nonblocking(true)?;

        Ok(Client {
            stream,
            tables: Mutex::new(Tables {
                pending: HashMap::new(),
                notify: HashMap::new(),
            }),
            recv: Mutex::new(Buffer::new(RECV_BUF_SIZE)),
            log: logging::child(log),
        })
    }

    /// Submit a request. The callback fires exactly once with the STATUS
    /// reply, unless the entry times out first or the client shuts down.
    /// Returns the assigned message id.
    pub fn submit<F>(&self, request: Request, callback: F) -> Result<u64, Status>
    where
        F: FnMut(&Response) + Send + 'static,
    {
        let msgid = next_msgid();
        let message = request.to_message(msgid);
        let frame = wire::serialize_message(&message).map_err(|e| match e {
            WireError::Fatal(fault) => fault.status(),
            WireError::Wait => Status::Failed,
        })?;

        let mut tables = self.tables.lock().map_err(|_| Status::MutexLock)?;

        // Reap timed-out pending entries; their callbacks are dropped
        // without being invoked.
        let now = Instant::now();
        tables
            .pending
            .retain(|_, entry| now.duration_since(entry.submitted) <= CALLBACK_TIMEOUT);

        tables.pending.insert(
            msgid,
            PendingEntry {
                callback: Box::new(callback),
                submitted: now,
                kind: request.control(),
            },
        );

        logging::trace!(self.log, "request submitted";
                        "context" => "submit",
                        "msgid" => msgid,
                        "pending" => tables.pending.len());

        // The tables mutex also serializes writes, keeping frames whole.
        if let Err(status) = self.write_frame(&frame) {
            tables.pending.remove(&msgid);
            return Err(status);
        }

        Ok(msgid)
    }

    /// Process whatever the socket has to offer without blocking.
    /// Returns the number of frames handled. A decode failure fails every
    /// pending callback with `MessageCorrupt` and is returned as an
    /// error.
    pub fn handle_response(&self) -> Result<usize, Status> {
        let mut buffer = self.recv.lock().map_err(|_| Status::MutexLock)?;
        let mut handled = 0usize;

        loop {
            handled += self.drain_frames(&mut buffer)?;

            if buffer.free_capacity() == 0 {
                // A full buffer with no complete frame cannot progress.
                buffer.clear();
                drop(buffer);
                self.fail_pending(Status::MessageCorrupt);
                return Err(Status::MessageCorrupt);
            }

            match (&self.stream).read(buffer.write_slice()) {
                Ok(0) => break,
                Ok(count) => buffer.move_tail(count),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => return Err(Status::SocketRead),
            }
        }

        Ok(handled)
    }

    /// Block up to five seconds for socket readability, then process
    /// replies. The sync building block.
    pub fn wait_response(&self) -> Result<usize, Status> {
        let mut fds = [PollFd::new(self.stream.as_fd(), PollFlags::POLLIN)];
        let ready = poll(&mut fds, PollTimeout::from(SYNC_TIMEOUT_MS))
            .map_err(|_| Status::SocketRead)?;

        if ready <= 0 {
            return Err(Status::ServerDown);
        }

        self.handle_response()
    }

    /// Store a value, waiting for the reply.
    pub fn set_value(&self, key: &Key, value: Value) -> Result<(), Status> {
        self.request_sync(Request::Set {
            key: key.clone(),
            value: Datum::from(value),
        })
        .map(drop)
    }

    /// Store a value with an explicit label, waiting for the reply.
    pub fn set_value_labeled(&self, key: &Key, value: Value, label: &str) -> Result<(), Status> {
        self.request_sync(Request::Set {
            key: key.clone(),
            value: Datum::new(value, label),
        })
        .map(drop)
    }

    /// Fetch a record. Returns the value datum and, when the daemon
    /// resolved the layer, the resolving layer's name.
    pub fn get_value(&self, key: &Key) -> Result<(Datum, Option<String>), Status> {
        let response = self.request_sync(Request::Get { key: key.clone() })?;

        let datum = response.data.first().cloned().ok_or(Status::MessageCorrupt)?;
        let layer = response
            .data
            .get(1)
            .and_then(Datum::as_str)
            .map(str::to_owned);

        Ok((datum, layer))
    }

    pub fn unset_value(&self, key: &Key) -> Result<(), Status> {
        self.request_sync(Request::Unset { key: key.clone() }).map(drop)
    }

    pub fn create_group(&self, key: &Key) -> Result<(), Status> {
        self.request_sync(Request::CreateGroup { key: key.clone() })
            .map(drop)
    }

    pub fn remove_group(&self, key: &Key) -> Result<(), Status> {
        self.request_sync(Request::RemoveGroup { key: key.clone() })
            .map(drop)
    }

    pub fn set_label(&self, key: &Key, label: &str) -> Result<(), Status> {
        self.request_sync(Request::SetLabel {
            key: key.clone(),
            label: label.to_owned(),
        })
        .map(drop)
    }

    /// All keys in a layer, in display form.
    pub fn list_keys(&self, layer: &str) -> Result<Vec<String>, Status> {
        let response = self.request_sync(Request::List {
            layer: layer.to_owned(),
        })?;

        Ok(response
            .data
            .iter()
            .filter_map(|d| d.as_str().map(str::to_owned))
            .collect())
    }

    /// Register for change notifications on a key. The callback first
    /// receives the registration's STATUS reply, then one invocation per
    /// CHANGED frame until unregistered. Returns the registration msgid,
    /// which `unregister_notification` must cite.
    pub fn register_notification<F>(&self, key: &Key, callback: F) -> Result<u64, Status>
    where
        F: FnMut(&Response) + Send + 'static,
    {
        self.submit(Request::Notify { key: key.clone() }, callback)
    }

    /// Drop a notification registration, waiting for the reply.
    pub fn unregister_notification(&self, key: &Key, msgid: u64) -> Result<(), Status> {
        self.request_sync(Request::Unnotify {
            key: key.clone(),
            msgid,
        })
        .map(drop)
    }

    /// Submit and wait for this request's own reply, driving the reactor
    /// until it arrives. Non-Ok statuses are returned as errors.
    fn request_sync(&self, request: Request) -> Result<Response, Status> {
        let slot: Arc<Mutex<Option<Response>>> = Arc::new(Mutex::new(None));
        let writer = Arc::clone(&slot);

        self.submit(request, move |response| {
            if let Ok(mut slot) = writer.lock() {
                *slot = Some(response.clone());
            }
        })?;

        loop {
            if let Some(response) = self.take_slot(&slot)? {
                if response.status == Status::Ok {
                    return Ok(response);
                }
                return Err(response.status);
            }

            self.wait_response()?;
        }
    }

    fn take_slot(&self, slot: &Arc<Mutex<Option<Response>>>) -> Result<Option<Response>, Status> {
        Ok(slot.lock().map_err(|_| Status::MutexLock)?.take())
    }

    /// Extract and dispatch every complete frame in the buffer.
    fn drain_frames(&self, buffer: &mut Buffer) -> Result<usize, Status> {
        let mut handled = 0usize;

        loop {
            let size = match wire::get_message_size(buffer.read_slice()) {
                Ok(size) => size,
                Err(WireError::Wait) => break,
                Err(WireError::Fatal(_)) => {
                    buffer.clear();
                    self.fail_pending(Status::MessageCorrupt);
                    return Err(Status::MessageCorrupt);
                }
            };

            if buffer.len() < size {
                break;
            }

            let message = match wire::deserialize_message(&buffer.read_slice()[..size]) {
                Ok(message) => message,
                Err(_) => {
                    buffer.clear();
                    self.fail_pending(Status::MessageCorrupt);
                    return Err(Status::MessageCorrupt);
                }
            };
            buffer.move_head(size);

            match self.dispatch(message) {
                Ok(()) => handled += 1,
                Err(status) => {
                    buffer.clear();
                    self.fail_pending(Status::MessageCorrupt);
                    return Err(status);
                }
            }
        }

        Ok(handled)
    }

    /// Route one inbound frame to its callback.
    fn dispatch(&self, message: Message) -> Result<(), Status> {
        let mut tables = self.tables.lock().map_err(|_| Status::MutexLock)?;

        match message.control {
            ControlCode::Status => {
                let (status, data) =
                    message::parse_status(&message).map_err(|_| Status::MessageCorrupt)?;

                let mut entry = match tables.pending.remove(&message.msgid) {
                    Some(entry) => entry,
                    None => {
                        logging::debug!(self.log, "reply for unknown msgid discarded";
                                        "context" => "dispatch",
                                        "msgid" => message.msgid);
                        return Ok(());
                    }
                };

                // A successful UNNOTIFY retires the registration it
                // cites: reply parameter 2 carries the target msgid.
                if entry.kind == ControlCode::Unnotify && status == Status::Ok {
                    match data.get(1).map(|d| &d.value) {
                        Some(Value::UInt64(target)) => {
                            tables.notify.remove(target);
                        }
                        _ => return Err(Status::MessageCorrupt),
                    }
                }

                let response = Response {
                    kind: entry.kind,
                    status,
                    data,
                };
                (entry.callback)(&response);

                // A successful NOTIFY keeps listening: the entry moves to
                // the notification table under the registration msgid.
                if entry.kind == ControlCode::Notify && status == Status::Ok {
                    tables.notify.insert(message.msgid, entry);
                }

                Ok(())
            }
            ControlCode::Changed => {
                match message.params.first().map(|d| &d.value) {
                    Some(Value::String(_)) => (),
                    _ => return Err(Status::MessageCorrupt),
                }

                match tables.notify.get_mut(&message.msgid) {
                    Some(entry) => {
                        let response = Response {
                            kind: ControlCode::Changed,
                            status: Status::Ok,
                            data: message.params,
                        };
                        (entry.callback)(&response);
                    }
                    None => {
                        logging::debug!(self.log, "notification for unknown msgid discarded";
                                        "context" => "dispatch",
                                        "msgid" => message.msgid);
                    }
                }

                Ok(())
            }
            _ => {
                logging::warn!(self.log, "unexpected control code from daemon";
                               "context" => "dispatch",
                               "control" => ?message.control);
                Err(Status::MessageCorrupt)
            }
        }
    }

    /// Write a complete frame, waiting for drain when the socket is
    /// backed up. Called with the tables mutex held.
    fn write_frame(&self, frame: &[u8]) -> Result<(), Status> {
        let mut written = 0usize;

        while written < frame.len() {
            match (&self.stream).write(&frame[written..]) {
                Ok(0) => return Err(Status::SocketWrite),
                Ok(count) => written += count,
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    let mut fds = [PollFd::new(self.stream.as_fd(), PollFlags::POLLOUT)];
                    let ready = poll(&mut fds, PollTimeout::from(SYNC_TIMEOUT_MS))
                        .map_err(|_| Status::SocketWrite)?;
                    if ready <= 0 {
                        return Err(Status::SocketWrite);
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => return Err(Status::SocketWrite),
            }
        }

        Ok(())
    }

    /// Fire every pending callback once with the given status and clear
    /// the table. Notification registrations are dropped silently.
    fn fail_pending(&self, status: Status) {
        let mut tables = match self.tables.lock() {
            Ok(tables) => tables,
            Err(_) => return,
        };

        let entries: Vec<_> = tables.pending.drain().collect();
        tables.notify.clear();
        drop(tables);

        for (_, mut entry) in entries {
            let response = Response {
                kind: entry.kind,
                status,
                data: Vec::new(),
            };
            (entry.callback)(&response);
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        // Closing the socket wakes any thread parked in the sync wait;
        // whoever is left waiting sees the server as gone.
        let _ = self.stream.shutdown(Shutdown::Both);
        self.fail_pending(Status::ServerDown);
    }
}
