//! Node-side request handling: sessions, verb handlers, admission, and the
//! collaborators they rely on.

mod acceptor;
mod handlers;
mod login;
mod router;
mod select;
mod session;
mod slots;

pub mod fsys;

pub use acceptor::Acceptor;
pub use fsys::{FileSystem, FsError, LocalFs, SpaceInfo};
pub use login::{Admitted, Authenticator, TrustingAuthenticator};
pub use router::{route, Handler, Route};
pub use select::{LeastLoadSelector, Selector};
pub use session::{
    CloseReason, NodeSession, Origin, Outcome, PeerInfo, PeerKind,
    SessionChannel, SessionCtx, SessionLink, SessionState,
};
pub use slots::{NodeStatus, ServerAddr, ServerSlotTable, SlotCounts};
