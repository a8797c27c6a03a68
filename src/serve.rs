//! Purpose: The daemon's HTTP API: execute command-tree invocations against
//! the long-lived node.
//! Exports: `serve`.
//! Role: Server side of the wire protocol the remote backend speaks.
//! Invariants: Success bodies are the raw response stream; failures are JSON
//! error envelopes carrying the error kind.
//! Invariants: Always-local commands are refused here.

use std::collections::BTreeMap;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::post;
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::cmds::{Command, Context, OptValue, Request};
use crate::core::error::{Error, ErrorKind, error_message};
use crate::core::node::Node;

struct AppState {
    node: Arc<Node>,
    root: Arc<Command>,
}

#[derive(Deserialize)]
struct CommandEnvelope {
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    opts: BTreeMap<String, Value>,
}

pub async fn serve(node: Arc<Node>, root: Arc<Command>, bind: SocketAddr) -> Result<(), Error> {
    let state = Arc::new(AppState { node, root });
    let app = Router::new()
        .route("/api/v0/*command", post(exec_command))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(bind).await.map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to bind api listener")
            .with_source(err)
    })?;
    info!("daemon api bound on http://{bind}");
    axum::serve(listener, app).await.map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("api server failed")
            .with_source(err)
    })
}

async fn exec_command(
    State(state): State<Arc<AppState>>,
    UrlPath(command): UrlPath<String>,
    axum::Json(envelope): axum::Json<CommandEnvelope>,
) -> HttpResponse {
    let path: Vec<String> = command
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect();
    match execute(&state, path, envelope) {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(err) => error_response(&err),
    }
}

fn execute(state: &AppState, path: Vec<String>, envelope: CommandEnvelope) -> Result<Vec<u8>, Error> {
    let cmd_node = state.root.resolve(&path)?;
    if cmd_node.is_always_local() {
        return Err(Error::new(ErrorKind::Client).with_message(format!(
            "'{}' cannot be executed remotely",
            path.join(" ")
        )));
    }

    let mut context = Context::new(state.node.config_root().to_path_buf());
    context.set_config(state.node.config().clone());
    context.set_node(state.node.clone());
    let mut req = Request::new(path, context);
    req.set_arguments(envelope.args);
    for (name, value) in &envelope.opts {
        if let Some(opt) = OptValue::from_json(value) {
            req.set_option(name.clone(), opt);
        }
    }
    req.apply_encoding_default(cmd_node);

    let resp = state.root.call(&mut req)?;
    let mut body = Vec::new();
    resp.into_reader().read_to_end(&mut body).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to read command response")
            .with_source(err)
    })?;
    Ok(body)
}

fn error_response(err: &Error) -> HttpResponse {
    let status = match err.kind() {
        ErrorKind::Usage | ErrorKind::Client | ErrorKind::NotCallable => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::AlreadyExists => StatusCode::CONFLICT,
        ErrorKind::Busy => StatusCode::LOCKED,
        ErrorKind::Config | ErrorKind::Transport | ErrorKind::Io | ErrorKind::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    let payload = json!({
        "error": {
            "kind": format!("{:?}", err.kind()),
            "message": error_message(err),
            "hint": err.hint(),
        }
    });
    (status, axum::Json(payload)).into_response()
}

#[cfg(test)]
mod tests {
    use super::{AppState, CommandEnvelope, execute};
    use crate::commands;
    use crate::core::config;
    use crate::core::error::ErrorKind;
    use crate::core::node::Node;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn daemon_state(temp: &std::path::Path) -> AppState {
        let cfg = config::init(temp, None).expect("init");
        let node = Arc::new(Node::open(temp, cfg, true).expect("open"));
        AppState {
            node,
            root: Arc::new(commands::root()),
        }
    }

    fn envelope(args: &[&str]) -> CommandEnvelope {
        CommandEnvelope {
            args: args.iter().map(|s| s.to_string()).collect(),
            opts: BTreeMap::new(),
        }
    }

    #[test]
    fn executes_commands_against_the_daemon_node() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = daemon_state(temp.path());

        let body = execute(
            &state,
            vec!["add".to_string()],
            envelope(&["{\"n\":1}"]),
        )
        .expect("add");
        let receipt: serde_json::Value =
            serde_json::from_slice(&body).expect("json");
        assert_eq!(receipt["seq"], 1);

        let body = execute(&state, vec!["get".to_string()], envelope(&["1"])).expect("get");
        let record: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(record["data"]["n"], 1);
    }

    #[test]
    fn refuses_always_local_commands() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = daemon_state(temp.path());
        let err = execute(&state, vec!["daemon".to_string()], envelope(&[])).expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Client);
    }

    #[test]
    fn unknown_commands_are_usage_errors() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = daemon_state(temp.path());
        let err = execute(&state, vec!["nonesuch".to_string()], envelope(&[])).expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }
}
