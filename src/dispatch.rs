//! Purpose: Decide where a command runs, in-process or against the daemon,
//! and execute it there.
//! Exports: `dispatch`, `run_local`.
//! Role: The routing core. Everything above it (lifecycle, CLI) is plumbing;
//! everything below it (node, transport) is a backend.
//! Invariants: Always-local commands never consult the daemon locator.
//! Invariants: No failure from a backend or collaborator is masked here.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::api::RemoteClient;
use crate::cmds::{Command, Request, Response};
use crate::core::addr::ApiAddr;
use crate::core::error::Error;
use crate::core::node::Node;
use crate::daemon;

/// Routes one invocation.
///
/// Commands flagged always-local run in-process with no routing decision at
/// all; the daemon lifecycle commands themselves live in that set, and
/// routing them would recurse. Everything else prefers a running daemon
/// (it owns exclusive access to the persistent state) unless the user forced
/// local execution with `--local`.
pub fn dispatch(req: &mut Request, root: &Command) -> Result<Response, Error> {
    let node = root.resolve(req.path())?;
    if node.is_always_local() {
        return root.call(req);
    }

    let prefer_remote = !matches!(req.option_bool("local"), Some(true));
    if prefer_remote && daemon::is_daemon_running(req.context().config_root())? {
        debug!("daemon is running; forwarding command over the http api");
        let config = req.context().config()?;
        let api = ApiAddr::parse(&config.addresses.api)?;
        let client = RemoteClient::new(&api.dial_addr())?;
        return client.send(req);
    }

    debug!("daemon not running or bypassed; executing command locally");
    run_local(req, root)
}

/// Executes against a freshly opened in-process node.
///
/// The node is attached to the request's context for the duration of the
/// call and closed on every exit path. A close failure is logged, never
/// allowed to override the command's own result. If the node cannot be
/// opened at all there is nothing to release, so the error returns as-is.
pub fn run_local(req: &mut Request, root: &Command) -> Result<Response, Error> {
    let config = req.context().config()?.clone();
    let node = Arc::new(Node::open(req.context().config_root(), config, false)?);
    req.context_mut().set_node(node.clone());
    let result = root.call(req);
    req.context_mut().clear_node();
    if let Err(err) = node.close() {
        warn!("failed to close node cleanly: {err}");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::dispatch;
    use crate::cmds::{Command, Context, OptValue, Request, Response};
    use crate::core::config;
    use crate::core::error::{Error, ErrorKind};
    use crate::daemon;
    use std::io::Read;
    use std::net::TcpListener;
    use std::path::Path;

    fn run_probe(req: &mut Request) -> Result<Response, Error> {
        let node = req.context().node()?;
        Ok(Response::from_string(format!("local:{}\n", node.peer_id())))
    }

    fn run_meta(_req: &mut Request) -> Result<Response, Error> {
        Ok(Response::from_string("meta ran in-process\n"))
    }

    fn tree() -> Command {
        Command::new("probe root")
            .with_subcommand("probe", Command::new("routable probe").with_run(run_probe))
            .with_subcommand(
                "meta",
                Command::new("administrative probe")
                    .with_run(run_meta)
                    .always_local(),
            )
            .with_subcommand("group", Command::new("grouping node"))
    }

    fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);
        port
    }

    fn request(root_dir: &Path, path: &[&str]) -> Request {
        let api = format!("/ip4/127.0.0.1/tcp/{}", closed_port());
        let cfg = config::init(root_dir, Some(api)).expect("init");
        let mut context = Context::new(root_dir.to_path_buf());
        context.set_config(cfg);
        Request::new(path.iter().map(|s| s.to_string()).collect(), context)
    }

    fn read_all(resp: Response) -> String {
        let mut out = String::new();
        resp.into_reader().read_to_string(&mut out).expect("read");
        out
    }

    #[test]
    fn absent_lock_selects_local_backend() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut req = request(temp.path(), &["probe"]);
        let out = read_all(dispatch(&mut req, &tree()).expect("dispatch"));
        assert!(out.starts_with("local:"));
    }

    #[test]
    fn absent_lock_selects_local_backend_even_with_override() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut req = request(temp.path(), &["probe"]);
        req.set_option("local", OptValue::Bool(true));
        let out = read_all(dispatch(&mut req, &tree()).expect("dispatch"));
        assert!(out.starts_with("local:"));
    }

    #[test]
    fn present_lock_selects_remote_backend() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut req = request(temp.path(), &["probe"]);
        std::fs::write(daemon::lock_path(temp.path()), "0\n").expect("lock");
        // The configured api port is closed, so remote selection surfaces as
        // an unmasked transport failure.
        let err = dispatch(&mut req, &tree()).expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[test]
    fn local_override_beats_a_present_lock() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut req = request(temp.path(), &["probe"]);
        std::fs::write(daemon::lock_path(temp.path()), "0\n").expect("lock");
        req.set_option("local", OptValue::Bool(true));
        let out = read_all(dispatch(&mut req, &tree()).expect("dispatch"));
        assert!(out.starts_with("local:"));
    }

    #[test]
    fn always_local_commands_skip_routing_entirely() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut req = request(temp.path(), &["meta"]);
        std::fs::write(daemon::lock_path(temp.path()), "0\n").expect("lock");
        let out = read_all(dispatch(&mut req, &tree()).expect("dispatch"));
        assert_eq!(out, "meta ran in-process\n");
    }

    #[test]
    fn grouping_node_fails_with_the_not_callable_sentinel() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut req = request(temp.path(), &["group"]);
        let err = dispatch(&mut req, &tree()).expect_err("err");
        assert_eq!(err.kind(), ErrorKind::NotCallable);
    }

    #[test]
    fn remote_path_requires_loaded_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(temp.path()).expect("mkdir");
        std::fs::write(daemon::lock_path(temp.path()), "0\n").expect("lock");
        let mut req = Request::new(
            vec!["probe".to_string()],
            Context::new(temp.path().to_path_buf()),
        );
        let err = dispatch(&mut req, &tree()).expect_err("err");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
