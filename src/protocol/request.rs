//! Request/response codes, verb argument payloads, and decoded requests.

use std::fmt;
use std::str::FromStr;

use crate::protocol::Frame;
use crate::utils::FedError;

use serde::{Deserialize, Serialize};

/// Numeric request and response codes carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RrCode {
    Login = 0,
    Chmod = 1,
    Locate = 2,
    Mkdir = 3,
    Mkpath = 4,
    Mv = 5,
    Rm = 6,
    Rmdir = 7,
    Select = 8,
    Trunc = 9,
    Avail = 10,
    Disc = 11,
    Gone = 12,
    Have = 13,
    Load = 14,
    Ping = 15,
    Pong = 16,
    Space = 17,
    State = 18,
    Status = 19,
    Try = 20,
    Update = 21,

    Data = 0xa0,
    Error = 0xa1,
    Redirect = 0xa2,
    Wait = 0xa3,
    LoginOk = 0xa4,
    LoginRedirect = 0xa5,
}

impl RrCode {
    /// Number of request codes; request codes are `0..NUM_REQUESTS`.
    pub const NUM_REQUESTS: usize = 22;

    /// All request codes in numeric order.
    pub const REQUESTS: [RrCode; Self::NUM_REQUESTS] = [
        RrCode::Login,
        RrCode::Chmod,
        RrCode::Locate,
        RrCode::Mkdir,
        RrCode::Mkpath,
        RrCode::Mv,
        RrCode::Rm,
        RrCode::Rmdir,
        RrCode::Select,
        RrCode::Trunc,
        RrCode::Avail,
        RrCode::Disc,
        RrCode::Gone,
        RrCode::Have,
        RrCode::Load,
        RrCode::Ping,
        RrCode::Pong,
        RrCode::Space,
        RrCode::State,
        RrCode::Status,
        RrCode::Try,
        RrCode::Update,
    ];

    /// Is this a response code?
    pub fn is_response(self) -> bool {
        (self as u8) >= RrCode::Data as u8
    }
}

impl TryFrom<u8> for RrCode {
    type Error = FedError;

    fn try_from(code: u8) -> Result<Self, FedError> {
        if let Some(rr) = RrCode::REQUESTS.get(code as usize) {
            return Ok(*rr);
        }
        match code {
            0xa0 => Ok(RrCode::Data),
            0xa1 => Ok(RrCode::Error),
            0xa2 => Ok(RrCode::Redirect),
            0xa3 => Ok(RrCode::Wait),
            0xa4 => Ok(RrCode::LoginOk),
            0xa5 => Ok(RrCode::LoginRedirect),
            _ => Err(FedError::msg(format!("unknown rr_code {:#x}", code))),
        }
    }
}

/// Verb-specific modifier bits.
pub mod modifier {
    /// have: the file is being staged, not yet online.
    pub const PENDING: u8 = 0x01;

    /// locate/select: the client intends to write.
    pub const WRITE: u8 = 0x01;
    /// locate/select: queue the request until the path resolves instead of
    /// asking the client to poll.
    pub const ASAP: u8 = 0x02;
    /// locate/select: discard cached knowledge and re-query subordinates.
    pub const REFRESH: u8 = 0x04;

    /// state: the requester does not want a deferred `have` answer.
    pub const NORESP: u8 = 0x01;

    /// status: administrative state changes.
    pub const SUSPEND: u8 = 0x01;
    pub const RESUME: u8 = 0x02;
    pub const STAGE: u8 = 0x04;
    pub const NOSTAGE: u8 = 0x08;
    pub const RESET: u8 = 0x10;

    /// login mode bits carried in `LoginArgs::mode`.
    pub const LOGIN_SUSPEND: u8 = 0x01;
    pub const LOGIN_NOSTAGE: u8 = 0x02;
    pub const LOGIN_TRYING: u8 = 0x04;
}

/// Role a node plays on one connection.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum Role {
    Manager,
    Supervisor,
    Server,
    Peer,
    Redirector,
}

impl Role {
    /// Does a node in this role keep a cache of its subordinates' files?
    pub fn is_manager(self) -> bool {
        matches!(self, Role::Manager | Role::Supervisor | Role::Peer)
    }

    /// Does this role accept a login of the given role?
    pub fn accepts(self, from: Role) -> bool {
        match self {
            Role::Manager | Role::Supervisor => matches!(
                from,
                Role::Supervisor | Role::Server | Role::Redirector
            ),
            Role::Peer => {
                matches!(from, Role::Manager | Role::Peer | Role::Redirector)
            }
            Role::Server => from == Role::Redirector,
            Role::Redirector => false,
        }
    }

    /// Single-letter tag used in the logging prefix.
    pub fn tag(self) -> char {
        match self {
            Role::Manager => 'm',
            Role::Supervisor => 's',
            Role::Server => 'd',
            Role::Peer => 'p',
            Role::Redirector => 'r',
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Role::Manager => "manager",
            Role::Supervisor => "supervisor",
            Role::Server => "server",
            Role::Peer => "peer",
            Role::Redirector => "redirector",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for Role {
    type Err = FedError;

    fn from_str(s: &str) -> Result<Self, FedError> {
        match s.to_lowercase().as_str() {
            "manager" => Ok(Role::Manager),
            "supervisor" => Ok(Role::Supervisor),
            "server" => Ok(Role::Server),
            "peer" => Ok(Role::Peer),
            "redirector" => Ok(Role::Redirector),
            _ => Err(FedError::msg(format!("unrecognized role '{}'", s))),
        }
    }
}

/// One exported path prefix declared at login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportSpec {
    pub prefix: String,
    pub rw: bool,
}

impl FromStr for ExportSpec {
    type Err = FedError;

    /// Parses `"/prefix"` or `"/prefix:rw"` / `"/prefix:ro"`.
    fn from_str(s: &str) -> Result<Self, FedError> {
        let (prefix, rw) = match s.rsplit_once(':') {
            Some((p, "rw")) => (p, true),
            Some((p, "ro")) => (p, false),
            Some(_) => {
                return Err(FedError::msg(format!(
                    "invalid export spec '{}'",
                    s
                )))
            }
            None => (s, false),
        };
        if !prefix.starts_with('/') {
            return Err(FedError::msg(format!(
                "export prefix '{}' is not absolute",
                prefix
            )));
        }
        Ok(ExportSpec {
            prefix: prefix.into(),
            rw,
        })
    }
}

/// Payload of a `login` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginArgs {
    pub role: Role,
    pub identity: String,
    pub site: String,
    /// Port the logging-in node serves on (0 if it does not listen).
    pub port: u16,
    pub mode: u8,
    pub exports: Vec<ExportSpec>,
    pub load: u32,
    pub free_mb: u64,
    pub credentials: Vec<u8>,
}

/// Payload of a `login_ok` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginOk {
    /// Slot assigned to the new subordinate, if it takes one.
    pub slot: Option<u8>,
    /// Identity of the accepting node.
    pub identity: String,
    /// Role of the accepting node.
    pub role: Role,
}

/// Payload of a `login_redirect` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRedirect {
    pub alternates: Vec<(String, u16)>,
}

/// Payload of a `try` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TryArgs {
    pub alternates: Vec<(String, u16)>,
}

/// Payload of path-only verbs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathArgs {
    pub path: String,
}

/// Payload of `chmod`, `mkdir` and `mkpath`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeArgs {
    pub path: String,
    pub mode: u32,
}

/// Payload of `mv`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MvArgs {
    pub old: String,
    pub new: String,
}

/// Payload of `trunc`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncArgs {
    pub path: String,
    pub size: u64,
}

/// Payload of `load`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadArgs {
    pub load: u32,
}

/// Payload of `avail`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailArgs {
    pub free_mb: u64,
    /// Space utilization in percent.
    pub util: u32,
}

/// Payload of an `error` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResp {
    pub errno: i32,
    pub text: String,
}

/// Payload of a `wait` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitResp {
    pub secs: u32,
}

/// Payload of a `redirect` response to `select`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectResp {
    pub host: String,
    pub port: u16,
}

/// One server entry in a `locate` answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Located {
    pub host: String,
    pub port: u16,
    pub pending: bool,
    pub writable: bool,
}

/// Payload of a `data` response to `locate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocateResp {
    pub servers: Vec<Located>,
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Login(LoginArgs),
    Chmod(ModeArgs),
    Locate(PathArgs),
    Mkdir(ModeArgs),
    Mkpath(ModeArgs),
    Mv(MvArgs),
    Rm(PathArgs),
    Rmdir(PathArgs),
    Select(PathArgs),
    Trunc(TruncArgs),
    Avail(AvailArgs),
    Disc,
    Gone(PathArgs),
    Have(PathArgs),
    Load(LoadArgs),
    Ping,
    Pong,
    Space,
    State(PathArgs),
    Status,
    Try(TryArgs),
    Update,

    /// Any response code arriving on a session; payload left undecoded.
    Response(RrCode),
}

impl Request {
    /// Decodes the payload of `frame` according to its code.
    pub fn parse(frame: &Frame) -> Result<Request, FedError> {
        let code = RrCode::try_from(frame.header.rr_code)?;
        let req = match code {
            RrCode::Login => Request::Login(frame.args()?),
            RrCode::Chmod => Request::Chmod(frame.args()?),
            RrCode::Locate => Request::Locate(frame.args()?),
            RrCode::Mkdir => Request::Mkdir(frame.args()?),
            RrCode::Mkpath => Request::Mkpath(frame.args()?),
            RrCode::Mv => Request::Mv(frame.args()?),
            RrCode::Rm => Request::Rm(frame.args()?),
            RrCode::Rmdir => Request::Rmdir(frame.args()?),
            RrCode::Select => Request::Select(frame.args()?),
            RrCode::Trunc => Request::Trunc(frame.args()?),
            RrCode::Avail => Request::Avail(frame.args()?),
            RrCode::Disc => Request::Disc,
            RrCode::Gone => Request::Gone(frame.args()?),
            RrCode::Have => Request::Have(frame.args()?),
            RrCode::Load => Request::Load(frame.args()?),
            RrCode::Ping => Request::Ping,
            RrCode::Pong => Request::Pong,
            RrCode::Space => Request::Space,
            RrCode::State => Request::State(frame.args()?),
            RrCode::Status => Request::Status,
            RrCode::Try => Request::Try(frame.args()?),
            RrCode::Update => Request::Update,
            _ => Request::Response(code),
        };
        Ok(req)
    }

    /// The path this request is about, if any.
    pub fn path(&self) -> Option<&str> {
        match self {
            Request::Chmod(a) | Request::Mkdir(a) | Request::Mkpath(a) => {
                Some(&a.path)
            }
            Request::Locate(a)
            | Request::Rm(a)
            | Request::Rmdir(a)
            | Request::Select(a)
            | Request::Gone(a)
            | Request::Have(a)
            | Request::State(a) => Some(&a.path),
            Request::Trunc(a) => Some(&a.path),
            Request::Mv(a) => Some(&a.old),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rr_code_numbering() -> Result<(), FedError> {
        for (i, code) in RrCode::REQUESTS.iter().enumerate() {
            assert_eq!(*code as usize, i);
            assert_eq!(RrCode::try_from(i as u8)?, *code);
            assert!(!code.is_response());
        }
        assert_eq!(RrCode::try_from(0xa3)?, RrCode::Wait);
        assert!(RrCode::Wait.is_response());
        assert!(RrCode::try_from(0x42).is_err());
        Ok(())
    }

    #[test]
    fn role_acceptance() -> Result<(), FedError> {
        assert!(Role::Manager.accepts(Role::Server));
        assert!(Role::Manager.accepts(Role::Supervisor));
        assert!(!Role::Manager.accepts(Role::Manager));
        assert!(Role::Server.accepts(Role::Redirector));
        assert!(!Role::Server.accepts(Role::Server));
        assert_eq!("Supervisor".parse::<Role>()?, Role::Supervisor);
        assert!("boss".parse::<Role>().is_err());
        Ok(())
    }

    #[test]
    fn export_spec_parse() -> Result<(), FedError> {
        assert_eq!(
            "/data:rw".parse::<ExportSpec>()?,
            ExportSpec {
                prefix: "/data".into(),
                rw: true
            }
        );
        assert!(!"/store".parse::<ExportSpec>()?.rw);
        assert!("/x:maybe".parse::<ExportSpec>().is_err());
        assert!("rel/path".parse::<ExportSpec>().is_err());
        Ok(())
    }

    #[test]
    fn parse_request_frames() -> Result<(), FedError> {
        let frame = Frame::new(
            RrCode::Mv,
            0,
            9,
            &MvArgs {
                old: "/a".into(),
                new: "/b".into(),
            },
        )?;
        let req = Request::parse(&frame)?;
        assert_eq!(req.path(), Some("/a"));
        assert_eq!(
            Request::parse(&Frame::bare(RrCode::Ping, 0, 0))?,
            Request::Ping
        );
        assert_eq!(
            Request::parse(&Frame::bare(RrCode::Data, 0, 3))?,
            Request::Response(RrCode::Data)
        );
        // payload that does not decode as the verb's args
        assert!(Request::parse(&Frame::bare(RrCode::Have, 0, 0)).is_err());
        Ok(())
    }
}
