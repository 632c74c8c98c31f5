//! Inter-node wire protocol: fixed-width framed requests and responses.

mod frame;
mod request;

pub use frame::{read_frame, Frame, FrameError, Header, HEADER_LEN};
pub use request::{
    modifier, AvailArgs, ErrorResp, ExportSpec, LoadArgs, LocateResp,
    Located, LoginArgs, LoginOk, LoginRedirect, ModeArgs, MvArgs, PathArgs,
    RedirectResp, Request, Role, RrCode, TruncArgs, TryArgs, WaitResp,
};
