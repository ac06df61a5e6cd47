use std::fmt;
use std::io;

/// Outcome of an operation, as carried in the first parameter of every
/// `STATUS` reply. The errno-derived outcomes get their own discriminants
/// so the code space stays collision-free.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[repr(i32)]
pub enum Status {
    Ok = 0,
    Failed = 1,
    BadArgs = 2,
    ServerDown = 3,
    SocketWrite = 4,
    SocketRead = 5,
    Oom = 6,
    MutexLock = 7,
    Callback = 8,
    MessageCorrupt = 9,
    ExceededMaxParams = 10,
    InvalidType = 11,
    InvalidControlField = 12,
    PermissionDenied = 13,
    AlreadyExists = 14,
    NotFound = 15,
}

impl Status {
    /// Wire representation of the status code.
    #[inline]
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Decode a wire status code. Unknown codes fold into `Failed` so a
    /// newer peer cannot wedge an older client.
    pub fn from_code(code: i32) -> Status {
        match code {
            0 => Status::Ok,
            1 => Status::Failed,
            2 => Status::BadArgs,
            3 => Status::ServerDown,
            4 => Status::SocketWrite,
            5 => Status::SocketRead,
            6 => Status::Oom,
            7 => Status::MutexLock,
            8 => Status::Callback,
            9 => Status::MessageCorrupt,
            10 => Status::ExceededMaxParams,
            11 => Status::InvalidType,
            12 => Status::InvalidControlField,
            13 => Status::PermissionDenied,
            14 => Status::AlreadyExists,
            15 => Status::NotFound,
            _ => Status::Failed,
        }
    }

    /// Human description, mirrored by the CLI output.
    pub fn describe(self) -> &'static str {
        match self {
            Status::Ok => "success",
            Status::Failed => "operation failed",
            Status::BadArgs => "required arguments not provided",
            Status::ServerDown => "unable to reach the daemon",
            Status::SocketWrite => "unable to write to socket",
            Status::SocketRead => "unable to read from socket",
            Status::Oom => "out of memory",
            Status::MutexLock => "could not obtain lock",
            Status::Callback => "callback could not be registered",
            Status::MessageCorrupt => "message failed to decode",
            Status::ExceededMaxParams => "too many message parameters",
            Status::InvalidType => "invalid data type",
            Status::InvalidControlField => "invalid control code",
            Status::PermissionDenied => "permission denied",
            Status::AlreadyExists => "already exists",
            Status::NotFound => "not found",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

impl std::error::Error for Status {}

pub type WireResult<T> = Result<T, WireError>;

/// Error plumbing for the framing and codec paths. `Wait` means more data
/// is needed before the operation can make progress; everything else is
/// fatal for the connection.
#[derive(Debug, Eq, PartialEq)]
pub enum WireError {
    Wait,
    Fatal(FaultKind),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FaultKind {
    /// A length field overran the frame, the magic was wrong, or the
    /// payload failed to decode.
    Corrupt,
    /// Declared frame length exceeded the protocol cap.
    OversizeFrame,
    /// Parameter count exceeded the protocol cap.
    MaxParamsExceeded,
    /// A value carried a type tag outside the closed enum.
    InvalidType,
    /// The control field was outside the closed enum.
    InvalidControl,
    Io(io::ErrorKind),
}

impl FaultKind {
    /// The status code surfaced to callbacks for this fault.
    pub fn status(self) -> Status {
        match self {
            FaultKind::Corrupt => Status::MessageCorrupt,
            FaultKind::OversizeFrame => Status::MessageCorrupt,
            FaultKind::MaxParamsExceeded => Status::ExceededMaxParams,
            FaultKind::InvalidType => Status::InvalidType,
            FaultKind::InvalidControl => Status::InvalidControlField,
            FaultKind::Io(_) => Status::SocketRead,
        }
    }
}

impl From<io::Error> for WireError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => WireError::Wait,
            kind => WireError::Fatal(FaultKind::Io(kind)),
        }
    }
}
