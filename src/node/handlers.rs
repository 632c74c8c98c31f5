//! Handlers of every inbound verb.
//!
//! Inline handlers run on the session task and never block; handlers that
//! touch the local filesystem are routed to the blocking pool.

use std::time::Duration;

use crate::cache::{
    AddOpts, LineStatus, Lookup, PendingRequest, Snapshot, WaitVerb,
};
use crate::cluster::ClusterState;
use crate::node::fsys::FsError;
use crate::node::session::{
    CloseReason, Outcome, PeerKind, SessionCtx, SessionLink,
};
use crate::protocol::{
    modifier, AvailArgs, ErrorResp, Frame, PathArgs, Request, RrCode,
};
use crate::utils::{FedError, ServerSet};

fn unexpected(req: &Request) -> FedError {
    FedError::msg(format!("unexpected request {:?} for handler", req))
}

fn fail(e: FsError) -> Outcome {
    Outcome::Fail(ErrorResp {
        errno: e.errno,
        text: e.text,
    })
}

/// `login` on an established session.
pub fn do_login(
    ctx: &mut SessionCtx,
    _frame: &Frame,
    _req: Request,
) -> Result<Outcome, FedError> {
    pf_warn!("repeated login from {}", ctx.link.peer.identity);
    Ok(Outcome::Close(CloseReason::Violation))
}

/// `have`: a subordinate gained a file (or is staging it).
pub fn do_have(
    ctx: &mut SessionCtx,
    frame: &Frame,
    req: Request,
) -> Result<Outcome, FedError> {
    let Request::Have(PathArgs { path }) = req else {
        return Err(unexpected(&req));
    };
    let state = &ctx.link.state;
    let slot = ctx.link.slot()?;
    let mask = ServerSet::single(slot)?;
    let opts = AddOpts {
        write: state.paths().find(&path).rw.contains(slot),
        pending: frame.header.modifier & modifier::PENDING != 0,
    };

    let out = state.cache.add_file(&path, mask, opts, Duration::ZERO);
    state.deliver(&path, &out.snapshot, out.released);
    if out.first_report {
        state.relay_up(frame);
    }
    Ok(Outcome::NoReply)
}

/// `gone`: a subordinate lost a file.
pub fn do_gone(
    ctx: &mut SessionCtx,
    frame: &Frame,
    req: Request,
) -> Result<Outcome, FedError> {
    let Request::Gone(PathArgs { path }) = req else {
        return Err(unexpected(&req));
    };
    let state = &ctx.link.state;
    let mask = ctx.link.mask()?;

    let out = state.cache.del_file(&path, mask, Duration::ZERO);
    state.deliver(&path, &out.snapshot, out.released);
    if out.became_empty {
        state.relay_up(frame);
    }
    Ok(Outcome::NoReply)
}

/// `state`: an upstream manager asks whether anybody here has a file.
///
/// A leaf answers from its own storage. An aggregating node answers from
/// its cache when conclusive; otherwise it queries the subordinates that
/// export the path and answers with `have` once one of them reports.
pub fn do_state(
    ctx: &mut SessionCtx,
    frame: &Frame,
    req: Request,
) -> Result<Outcome, FedError> {
    let Request::State(PathArgs { path }) = req else {
        return Err(unexpected(&req));
    };
    let state = ctx.link.state.clone();

    if !state.role.is_manager() {
        let Some(fs) = state.fs.clone() else {
            return Ok(Outcome::NoReply);
        };
        ctx.offload(frame.clone(), move |_| match fs.exists(&path) {
            Ok(true) => Ok(Outcome::Reply(Frame::new(
                RrCode::Have,
                0,
                0,
                &PathArgs { path },
            )?)),
            Ok(false) => Ok(Outcome::NoReply),
            Err(e) => {
                pf_debug!("state check of {} failed: {}", path, e);
                Ok(Outcome::NoReply)
            }
        });
        return Ok(Outcome::NoReply);
    }

    let candidates = state.candidates(&path, false);
    if candidates.is_empty() {
        return Ok(Outcome::NoReply);
    }
    let waiter = (frame.header.modifier & modifier::NORESP == 0).then(|| {
        PendingRequest {
            conn: ctx.link.conn,
            stream_id: 0,
            wants_write: false,
            verb: WaitVerb::State,
        }
    });
    let lookup = state.cache.get_file(&path, false, waiter);
    if lookup.is_conclusive() {
        let answer = state.answer(
            WaitVerb::State,
            0,
            &path,
            &lookup.snapshot,
            false,
        )?;
        return Ok(answer.map_or(Outcome::NoReply, Outcome::Reply));
    }
    query_unresolved(&state, &path, frame.header.hops, &lookup, candidates)?;
    Ok(Outcome::NoReply)
}

// Starts the query round an inconclusive lookup calls for: every
// candidate for a path never seen, or the suspects of a bounced line.
fn query_unresolved(
    state: &ClusterState,
    path: &str,
    hops: u8,
    lookup: &Lookup,
    candidates: ServerSet,
) -> Result<usize, FedError> {
    if lookup.status == LineStatus::Absent {
        state.cache.begin_query(path);
        state.query(path, hops, candidates)
    } else if !lookup.requery.is_empty() {
        state.query(path, hops, lookup.requery & candidates)
    } else {
        Ok(0)
    }
}

/// `locate` and `select`: a client asks where a file is, or where to go.
pub fn do_locate(
    ctx: &mut SessionCtx,
    frame: &Frame,
    req: Request,
) -> Result<Outcome, FedError> {
    let (verb, path) = match req {
        Request::Locate(PathArgs { path }) => (WaitVerb::Locate, path),
        Request::Select(PathArgs { path }) => (WaitVerb::Select, path),
        _ => return Err(unexpected(&req)),
    };
    let state = &ctx.link.state;
    let header = &frame.header;
    let write = header.modifier & modifier::WRITE != 0;

    let candidates = state.candidates(&path, write);
    if candidates.is_empty() {
        return Ok(Outcome::Fail(ErrorResp {
            errno: libc::ENOENT,
            text: format!("no servers export {}", path),
        }));
    }

    if header.modifier & modifier::REFRESH != 0 {
        let delay = state.config.query_delay();
        state.cache.add_file(
            &path,
            ServerSet::EMPTY,
            AddOpts::default(),
            delay,
        );
        state.query(&path, header.hops, candidates)?;
    }

    let asap = header.modifier & modifier::ASAP != 0 && header.stream_id != 0;
    let waiter = asap.then(|| PendingRequest {
        conn: ctx.link.conn,
        stream_id: header.stream_id,
        wants_write: write,
        verb,
    });
    let lookup = state.cache.get_file(&path, write, waiter);
    if lookup.is_conclusive() {
        let answer = state.answer(
            verb,
            header.stream_id,
            &path,
            &lookup.snapshot,
            write,
        )?;
        return Ok(answer.map_or(Outcome::NoReply, Outcome::Reply));
    }

    let n = query_unresolved(state, &path, header.hops, &lookup, candidates)?;
    if n > 0 {
        pf_trace!("queried {} subordinates for {}", n, path);
    }
    Ok(if asap {
        Outcome::NoReply
    } else {
        Outcome::Wait(state.config.poll_wait_secs)
    })
}

/// `status`: a subordinate changed its serving flags.
pub fn do_status(
    ctx: &mut SessionCtx,
    frame: &Frame,
    _req: Request,
) -> Result<Outcome, FedError> {
    let bits = frame.header.modifier;
    let state = ctx.link.state.clone();
    let slot = ctx.link.slot()?;

    if bits & modifier::RESET != 0 {
        pf_info!("server at slot {} reset its files", slot);
        state.cache.bounce(ServerSet::single(slot)?, None);
        state.relay_up(&Frame::bare(RrCode::Status, modifier::RESET, 0));
    }

    let status = &mut ctx.status;
    if bits & modifier::SUSPEND != 0 {
        status.suspended = true;
    } else if bits & modifier::RESUME != 0 {
        status.suspended = false;
    }
    if bits & modifier::NOSTAGE != 0 {
        status.nostage = true;
    } else if bits & modifier::STAGE != 0 {
        status.nostage = false;
    }
    let (suspended, nostage) = (status.suspended, status.nostage);
    state.servers.update_status(slot, |st| {
        st.suspended = suspended;
        st.nostage = nostage;
    });
    state.recount();
    Ok(Outcome::NoReply)
}

/// `load`: a subordinate reports its load.
pub fn do_load(
    ctx: &mut SessionCtx,
    frame: &Frame,
    req: Request,
) -> Result<Outcome, FedError> {
    let Request::Load(args) = req else {
        return Err(unexpected(&req));
    };
    ctx.status.load = args.load;
    ctx.link
        .state
        .servers
        .update_status(ctx.link.slot()?, |st| st.load = args.load);
    pf_trace!("load {} hops {}", args.load, frame.header.hops);
    Ok(Outcome::NoReply)
}

/// `avail`: a subordinate reports its free space.
pub fn do_avail(
    ctx: &mut SessionCtx,
    _frame: &Frame,
    req: Request,
) -> Result<Outcome, FedError> {
    let Request::Avail(args) = req else {
        return Err(unexpected(&req));
    };
    ctx.status.free_mb = args.free_mb;
    ctx.status.util = args.util;
    ctx.link.state.servers.update_status(ctx.link.slot()?, |st| {
        st.free_mb = args.free_mb;
        st.util = args.util;
    });
    Ok(Outcome::NoReply)
}

/// `space`: the upstream manager asks for free space.
pub fn do_space(
    link: &SessionLink,
    frame: &Frame,
    _req: Request,
) -> Result<Outcome, FedError> {
    let state = &link.state;
    let (free_mb, util) = match &state.fs {
        Some(fs) => match fs.statfs() {
            Ok(info) => (info.free_mb, info.util),
            Err(e) => return Ok(fail(e)),
        },
        None => state.servers.space(),
    };
    Ok(Outcome::Reply(Frame::new(
        RrCode::Avail,
        0,
        frame.header.stream_id,
        &AvailArgs { free_mb, util },
    )?))
}

/// `update`: the upstream manager asks for our current status.
pub fn do_update(
    ctx: &mut SessionCtx,
    _frame: &Frame,
    _req: Request,
) -> Result<Outcome, FedError> {
    let bits = ctx.link.state.cms.status_bits();
    Ok(Outcome::Reply(Frame::bare(RrCode::Status, bits, 0)))
}

/// `try`: the upstream manager displaces us toward alternates.
pub fn do_try(
    ctx: &mut SessionCtx,
    _frame: &Frame,
    req: Request,
) -> Result<Outcome, FedError> {
    let Request::Try(args) = req else {
        return Err(unexpected(&req));
    };
    let PeerKind::Upstream { reference, level } = ctx.link.peer.kind else {
        return Err(FedError::msg("try from a non-upstream peer"));
    };
    let mut alternates = ctx.link.state.managers.alternates();
    for (host, port) in &args.alternates {
        if alternates.add(reference, host, *port, level.saturating_add(1)) {
            pf_info!("learned alternate manager {}:{}", host, port);
        }
    }
    Ok(Outcome::Close(CloseReason::Redirected))
}

/// `disc`: the peer asks to close.
pub fn do_disc(
    ctx: &mut SessionCtx,
    _frame: &Frame,
    _req: Request,
) -> Result<Outcome, FedError> {
    pf_debug!("{} requested disconnect", ctx.link.peer.identity);
    Ok(Outcome::Close(CloseReason::Requested))
}

/// `ping`: answered with `pong`.
pub fn do_ping(
    _ctx: &mut SessionCtx,
    frame: &Frame,
    _req: Request,
) -> Result<Outcome, FedError> {
    Ok(Outcome::Reply(Frame::bare(
        RrCode::Pong,
        0,
        frame.header.stream_id,
    )))
}

/// `pong`: nothing to do beyond the keep-alive reset every frame gets.
pub fn do_pong(
    _ctx: &mut SessionCtx,
    _frame: &Frame,
    _req: Request,
) -> Result<Outcome, FedError> {
    Ok(Outcome::NoReply)
}

/// Any response code arriving on a session.
pub fn do_response(
    ctx: &mut SessionCtx,
    frame: &Frame,
    _req: Request,
) -> Result<Outcome, FedError> {
    pf_trace!(
        "ignoring response {:#x} sid {} from {}",
        frame.header.rr_code,
        frame.header.stream_id,
        ctx.link.peer.identity
    );
    Ok(Outcome::NoReply)
}

/// Passthrough filesystem verbs. A node with local storage executes them;
/// a pure cache layer invalidates what they make stale. Successful ones
/// are relayed to subordinates by the dispatcher.
pub fn do_fsverb(
    link: &SessionLink,
    frame: &Frame,
    req: Request,
) -> Result<Outcome, FedError> {
    let state = &link.state;
    let stream_id = frame.header.stream_id;

    let Some(fs) = state.fs.as_ref() else {
        let stale: Vec<&str> = match &req {
            Request::Rm(a) => vec![a.path.as_str()],
            Request::Mv(a) => vec![a.old.as_str(), a.new.as_str()],
            _ => vec![],
        };
        for path in stale {
            let released = state.cache.del_cache(path);
            state.deliver(path, &Snapshot::default(), released);
        }
        return Ok(Outcome::ack(stream_id));
    };

    let result = match &req {
        Request::Chmod(a) => fs.chmod(&a.path, a.mode),
        Request::Mkdir(a) => fs.mkdir(&a.path, a.mode, false),
        Request::Mkpath(a) => fs.mkdir(&a.path, a.mode, true),
        Request::Mv(a) => fs.rename(&a.old, &a.new),
        Request::Rm(a) => fs.unlink(&a.path),
        Request::Rmdir(a) => fs.rmdir(&a.path),
        Request::Trunc(a) => fs.truncate(&a.path, a.size),
        _ => return Err(unexpected(&req)),
    };
    if let Err(e) = result {
        return Ok(fail(e));
    }

    // keep the managers' view of our files current
    let notices = match &req {
        Request::Rm(a) => vec![(RrCode::Gone, a.path.clone())],
        Request::Mv(a) => vec![
            (RrCode::Gone, a.old.clone()),
            (RrCode::Have, a.new.clone()),
        ],
        _ => vec![],
    };
    for (code, path) in notices {
        let notice = Frame::new(code, 0, 0, &PathArgs { path })?;
        state.managers.inform(&notice);
    }
    Ok(Outcome::ack(stream_id))
}
