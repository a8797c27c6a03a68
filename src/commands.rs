//! Purpose: The built-in command tree and its behaviors.
//! Exports: `root`.
//! Role: Declares what `keel` can do; the dispatcher decides where each
//! invocation runs.
//! Invariants: `version`, `init`, and `daemon` carry the always-local flag;
//! routing a daemon-lifecycle command through a daemon would recurse.

use std::io::{IsTerminal, Read};
use std::sync::Arc;

use serde_json::json;

use crate::cmds::{ArgDef, Command, Encoding, OptDef, Request, Response};
use crate::core::addr::ApiAddr;
use crate::core::config;
use crate::core::error::{Error, ErrorKind};
use crate::core::node::Node;
use crate::daemon::DaemonLock;
use crate::serve;

/// Builds the command tree. Options on the root are global and accepted by
/// every subcommand.
pub fn root() -> Command {
    Command::new("A small record-log node with client/daemon command routing")
        .with_option(
            OptDef::string("config", "Path to the configuration root (default: ~/.keel)")
                .with_short('c'),
        )
        .with_option(
            OptDef::flag("debug", "Raise verbosity and capture cpu/heap profiles").with_short('D'),
        )
        .with_option(
            OptDef::flag("local", "Run the command in-process even if a daemon is running")
                .with_short('L'),
        )
        .with_option(OptDef::string("encoding", "Response encoding: text|json"))
        .with_subcommand(
            "version",
            Command::new("Show version information")
                .with_run(run_version)
                .with_encodings(&[Encoding::Text])
                .always_local(),
        )
        .with_subcommand(
            "init",
            Command::new("Initialize a new configuration root")
                .with_option(OptDef::string("api", "API address to advertise (multiaddr form)"))
                .with_run(run_init)
                .with_encodings(&[Encoding::Text])
                .always_local(),
        )
        .with_subcommand(
            "daemon",
            Command::new("Run the long-lived daemon and serve the HTTP API")
                .with_run(run_daemon)
                .with_encodings(&[Encoding::Text])
                .always_local(),
        )
        .with_subcommand(
            "id",
            Command::new("Show node identity")
                .with_run(run_id)
                .with_encodings(&[Encoding::Text, Encoding::Json]),
        )
        .with_subcommand(
            "add",
            Command::new("Append a JSON record to the log")
                .with_argument(ArgDef::new("data", false, "Record payload (JSON); stdin if omitted"))
                .with_option(OptDef::string("tag", "Tag to attach to the record"))
                .with_run(run_add),
        )
        .with_subcommand(
            "get",
            Command::new("Fetch one record by sequence number")
                .with_argument(ArgDef::new("seq", true, "Sequence number"))
                .with_run(run_get),
        )
        .with_subcommand(
            "stats",
            Command::new("Node statistics").with_subcommand(
                "repo",
                Command::new("Record log statistics").with_run(run_stats_repo),
            ),
        )
}

fn run_version(_req: &mut Request) -> Result<Response, Error> {
    Ok(Response::from_string(format!(
        "keel version {}\n",
        env!("CARGO_PKG_VERSION")
    )))
}

fn run_init(req: &mut Request) -> Result<Response, Error> {
    let api = req.option_str("api").map(str::to_string);
    let root_dir = req.context().config_root().to_path_buf();
    let cfg = config::init(&root_dir, api)?;
    Ok(Response::from_string(format!(
        "initialized keel node at {}\npeer id: {}\n",
        root_dir.display(),
        cfg.identity.peer_id
    )))
}

fn run_daemon(req: &mut Request) -> Result<Response, Error> {
    let root_dir = req.context().config_root().to_path_buf();
    let cfg = req.context().config()?.clone();
    let bind = ApiAddr::parse(&cfg.addresses.api)?.socket_addr()?;

    // Lock first: the indicator must be visible before the API is.
    let lock = DaemonLock::acquire(&root_dir)?;
    let node = Arc::new(Node::open(&root_dir, cfg, true)?);
    eprintln!("daemon api listening on http://{bind}");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to start runtime")
                .with_source(err)
        })?;
    let result = runtime.block_on(serve::serve(node.clone(), Arc::new(root()), bind));
    drop(lock);
    result?;
    Ok(Response::from_string("daemon stopped\n"))
}

fn run_id(req: &mut Request) -> Result<Response, Error> {
    let node = req.context().node()?;
    let identity = json!({
        "peer_id": node.peer_id(),
        "agent_version": Node::agent_version(),
        "api": node.config().addresses.api,
        "daemon": node.is_daemon(),
    });
    Ok(match req.encoding() {
        Encoding::Json => Response::from_json(&identity),
        Encoding::Text => Response::from_string(format!(
            "peer id: {}\nagent:   {}\napi:     {}\n",
            node.peer_id(),
            Node::agent_version(),
            node.config().addresses.api,
        )),
    })
}

fn run_add(req: &mut Request) -> Result<Response, Error> {
    let node = req.context().node()?.clone();
    let payload = match req.arguments().first() {
        Some(data) => data.clone(),
        None => read_stdin_payload(node.is_daemon())?,
    };
    let data: serde_json::Value = serde_json::from_str(&payload).map_err(|err| {
        Error::new(ErrorKind::Client)
            .with_message("record payload is not valid json")
            .with_hint("Pass a JSON value, e.g. keel add '{\"msg\":\"hello\"}'.")
            .with_source(err)
    })?;
    let tags = req
        .option_str("tag")
        .map(|tag| vec![tag.to_string()])
        .unwrap_or_default();
    let record = node.append(data, tags)?;
    Ok(Response::from_json(&json!({
        "seq": record.seq,
        "id": record.id,
        "time": record.time,
    })))
}

/// Only a foreground node may read the invoking terminal's stdin; the daemon
/// has no client stdin to read, so an argless add is a client mistake there.
fn read_stdin_payload(daemon: bool) -> Result<String, Error> {
    if daemon || std::io::stdin().is_terminal() {
        return Err(Error::new(ErrorKind::Client)
            .with_message("no record payload provided")
            .with_hint("Pass DATA as an argument or pipe JSON on stdin."));
    }
    let mut payload = String::new();
    std::io::stdin().read_to_string(&mut payload).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to read record payload from stdin")
            .with_source(err)
    })?;
    if payload.trim().is_empty() {
        return Err(Error::new(ErrorKind::Client)
            .with_message("no record payload provided")
            .with_hint("Pass DATA as an argument or pipe JSON on stdin."));
    }
    Ok(payload)
}

fn run_get(req: &mut Request) -> Result<Response, Error> {
    let node = req.context().node()?;
    let raw = req
        .arguments()
        .first()
        .ok_or_else(|| Error::new(ErrorKind::Client).with_message("missing sequence number"))?;
    let seq: u64 = raw.parse().map_err(|_| {
        Error::new(ErrorKind::Client)
            .with_message(format!("'{raw}' is not a sequence number"))
            .with_hint("Sequence numbers are positive integers, e.g. keel get 1.")
    })?;
    let record = node.get(seq)?;
    let value = serde_json::to_value(&record).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode record")
            .with_source(err)
    })?;
    Ok(Response::from_json(&value))
}

fn run_stats_repo(req: &mut Request) -> Result<Response, Error> {
    let node = req.context().node()?;
    let stat = node.stat()?;
    Ok(Response::from_json(&json!({
        "records": stat.records,
        "log_bytes": stat.log_bytes,
    })))
}

#[cfg(test)]
mod tests {
    use super::root;
    use crate::cmds::{Context, Encoding, Request, Response};
    use crate::core::config;
    use crate::core::error::ErrorKind;
    use crate::core::node::Node;
    use std::io::Read;
    use std::sync::Arc;

    fn request_with_node(temp: &std::path::Path, path: &[&str]) -> Request {
        let cfg = config::init(temp, None).expect("init");
        let node = Arc::new(Node::open(temp, cfg, false).expect("open"));
        let mut context = Context::new(temp.to_path_buf());
        context.set_node(node);
        Request::new(path.iter().map(|s| s.to_string()).collect(), context)
    }

    #[test]
    fn lifecycle_commands_are_always_local() {
        let tree = root();
        for name in ["version", "init", "daemon"] {
            let node = tree.resolve(&[name.to_string()]).expect("resolve");
            assert!(node.is_always_local(), "{name}");
        }
        for name in ["id", "add", "get"] {
            let node = tree.resolve(&[name.to_string()]).expect("resolve");
            assert!(!node.is_always_local(), "{name}");
        }
    }

    #[test]
    fn stats_is_a_grouping_node_with_a_repo_leaf() {
        let tree = root();
        let stats = tree.resolve(&["stats".to_string()]).expect("resolve");
        assert!(!stats.has_run());
        let repo = tree
            .resolve(&["stats".to_string(), "repo".to_string()])
            .expect("resolve");
        assert!(repo.has_run());
    }

    #[test]
    fn id_prefers_text_encoding() {
        let tree = root();
        let id = tree.resolve(&["id".to_string()]).expect("resolve");
        assert_eq!(id.default_encoding(), Encoding::Text);
        let add = tree.resolve(&["add".to_string()]).expect("resolve");
        assert_eq!(add.default_encoding(), Encoding::Json);
    }

    #[test]
    fn add_appends_and_get_fetches() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tree = root();

        let mut req = request_with_node(temp.path(), &["add"]);
        req.set_arguments(vec!["{\"msg\":\"hello\"}".to_string()]);
        let receipt = read_json(tree.call(&mut req).expect("add"));
        assert_eq!(receipt["seq"], 1);

        let mut req = request_with_node(temp.path(), &["get"]);
        req.set_arguments(vec!["1".to_string()]);
        let record = read_json(tree.call(&mut req).expect("get"));
        assert_eq!(record["data"]["msg"], "hello");
    }

    #[test]
    fn add_rejects_bad_json_as_a_client_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tree = root();
        let mut req = request_with_node(temp.path(), &["add"]);
        req.set_arguments(vec!["not json".to_string()]);
        let err = tree.call(&mut req).expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Client);
    }

    #[test]
    fn get_rejects_a_malformed_seq_as_a_client_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tree = root();
        let mut req = request_with_node(temp.path(), &["get"]);
        req.set_arguments(vec!["abc".to_string()]);
        let err = tree.call(&mut req).expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Client);
    }

    fn read_json(resp: Response) -> serde_json::Value {
        let mut out = String::new();
        resp.into_reader().read_to_string(&mut out).expect("read");
        serde_json::from_str(&out).expect("json")
    }
}
