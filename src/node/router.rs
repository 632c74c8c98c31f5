//! Static table mapping request codes to handlers and their policies.

use crate::node::handlers::*;
use crate::node::session::{Origin, Outcome, SessionCtx, SessionLink};
use crate::protocol::{Frame, Request, RrCode};
use crate::utils::FedError;

/// Handler run on the session task itself.
pub type InlineHandler =
    fn(&mut SessionCtx, &Frame, Request) -> Result<Outcome, FedError>;

/// Handler run on the blocking thread pool.
pub type BlockingHandler =
    fn(&SessionLink, &Frame, Request) -> Result<Outcome, FedError>;

#[derive(Clone, Copy)]
pub enum Handler {
    Inline(InlineHandler),
    Blocking(BlockingHandler),
}

/// Dispatch entry of one request code.
pub struct Route {
    pub code: RrCode,
    pub name: &'static str,
    pub handler: Handler,
    /// Relay the request to all subordinates once handled successfully.
    pub forward: bool,
    /// Answer "wait" instead of handling while this node is suspended.
    pub delayable: bool,
    /// Handler errors are reported to a requester that wants an answer.
    pub replies: bool,
    /// Where the request may come from.
    pub from: &'static [Origin],
}

const ANY: &[Origin] = &[Origin::Subordinate, Origin::Upstream, Origin::Client];
const FROM_SUBS: &[Origin] = &[Origin::Subordinate];
const FROM_UPSTREAM: &[Origin] = &[Origin::Upstream];
const FROM_CLIENTS: &[Origin] = &[Origin::Client];
const FROM_ABOVE: &[Origin] = &[Origin::Upstream, Origin::Client];

macro_rules! route {
    ($code:ident, $name:literal, $handler:expr, $from:expr) => {
        route!($code, $name, $handler, $from, false, false, false)
    };
    ($code:ident, $name:literal, $handler:expr, $from:expr,
     forward: $fwd:expr, delayable: $dly:expr, replies: $rep:expr) => {
        route!($code, $name, $handler, $from, $fwd, $dly, $rep)
    };
    ($code:ident, $name:literal, $handler:expr, $from:expr,
     $fwd:expr, $dly:expr, $rep:expr) => {
        Route {
            code: RrCode::$code,
            name: $name,
            handler: $handler,
            forward: $fwd,
            delayable: $dly,
            replies: $rep,
            from: $from,
        }
    };
}

/// Routes indexed by request code.
static ROUTES: [Route; RrCode::NUM_REQUESTS] = [
    route!(Login, "login", Handler::Inline(do_login), ANY),
    route!(Chmod, "chmod", Handler::Blocking(do_fsverb), FROM_ABOVE,
           forward: true, delayable: false, replies: true),
    route!(Locate, "locate", Handler::Inline(do_locate), FROM_CLIENTS,
           forward: false, delayable: true, replies: true),
    route!(Mkdir, "mkdir", Handler::Blocking(do_fsverb), FROM_ABOVE,
           forward: true, delayable: false, replies: true),
    route!(Mkpath, "mkpath", Handler::Blocking(do_fsverb), FROM_ABOVE,
           forward: true, delayable: false, replies: true),
    route!(Mv, "mv", Handler::Blocking(do_fsverb), FROM_ABOVE,
           forward: true, delayable: false, replies: true),
    route!(Rm, "rm", Handler::Blocking(do_fsverb), FROM_ABOVE,
           forward: true, delayable: false, replies: true),
    route!(Rmdir, "rmdir", Handler::Blocking(do_fsverb), FROM_ABOVE,
           forward: true, delayable: false, replies: true),
    route!(Select, "select", Handler::Inline(do_locate), FROM_CLIENTS,
           forward: false, delayable: true, replies: true),
    route!(Trunc, "trunc", Handler::Blocking(do_fsverb), FROM_ABOVE,
           forward: true, delayable: false, replies: true),
    route!(Avail, "avail", Handler::Inline(do_avail), FROM_SUBS),
    route!(Disc, "disc", Handler::Inline(do_disc), ANY),
    route!(Gone, "gone", Handler::Inline(do_gone), FROM_SUBS),
    route!(Have, "have", Handler::Inline(do_have), FROM_SUBS),
    route!(Load, "load", Handler::Inline(do_load), FROM_SUBS),
    route!(Ping, "ping", Handler::Inline(do_ping), ANY),
    route!(Pong, "pong", Handler::Inline(do_pong), ANY),
    route!(Space, "space", Handler::Blocking(do_space), FROM_UPSTREAM),
    route!(State, "state", Handler::Inline(do_state), FROM_UPSTREAM),
    route!(Status, "status", Handler::Inline(do_status), FROM_SUBS),
    route!(Try, "try", Handler::Inline(do_try), FROM_UPSTREAM),
    route!(Update, "update", Handler::Inline(do_update), FROM_UPSTREAM),
];

/// Shared route of every response code.
static RESPONSE: Route =
    route!(Data, "response", Handler::Inline(do_response), ANY);

/// Looks up the route of raw code `rr_code`.
pub fn route(rr_code: u8) -> Option<&'static Route> {
    match RrCode::try_from(rr_code) {
        Ok(code) if code.is_response() => Some(&RESPONSE),
        Ok(code) => ROUTES.get(code as usize),
        Err(_) => None,
    }
}
