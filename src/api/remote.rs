//! Purpose: HTTP client that forwards one command invocation to a daemon.
//! Exports: `RemoteClient`.
//! Role: The remote execution backend; mirrors local invocation over the wire.
//! Invariants: One request/response exchange per invocation; no retries, no
//! connection reuse across invocations.
//! Invariants: Error kinds survive the network hop via the error envelope.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::cmds::{Request, Response};
use crate::core::error::{Error, ErrorKind};

pub struct RemoteClient {
    agent: ureq::Agent,
    base_url: Url,
}

#[derive(Serialize)]
struct CommandEnvelope<'a> {
    args: &'a [String],
    opts: BTreeMap<String, Value>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: RemoteError,
}

#[derive(Deserialize)]
struct RemoteError {
    kind: String,
    message: Option<String>,
    hint: Option<String>,
}

impl RemoteClient {
    /// Builds a client bound to the daemon host in `host:port` dial form.
    pub fn new(host: &str) -> Result<Self, Error> {
        let base_url = Url::parse(&format!("http://{host}/")).map_err(|err| {
            Error::new(ErrorKind::Config)
                .with_message(format!("invalid daemon api host '{host}'"))
                .with_source(err)
        })?;
        Ok(Self {
            agent: ureq::AgentBuilder::new().build(),
            base_url,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Serializes the request (path, options, arguments) and forwards it.
    /// Whatever comes back, stream or failure, is returned unchanged;
    /// retry policy belongs to the operator, not this layer.
    pub fn send(&self, req: &Request) -> Result<Response, Error> {
        let url = api_url(&self.base_url, req.path())?;
        let envelope = CommandEnvelope {
            args: req.arguments(),
            opts: req
                .options()
                .iter()
                .map(|(name, value)| (name.clone(), value.to_json()))
                .collect(),
        };
        let payload = serde_json::to_string(&envelope).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode request envelope")
                .with_source(err)
        })?;

        let response = self
            .agent
            .request("POST", url.as_str())
            .set("Content-Type", "application/json")
            .set("Accept", "application/json")
            .send_string(&payload);
        match response {
            Ok(resp) => Ok(Response::from_reader(Box::new(resp.into_reader()))),
            Err(ureq::Error::Status(status, resp)) => Err(parse_error_response(status, resp)),
            Err(ureq::Error::Transport(err)) => Err(Error::new(ErrorKind::Transport)
                .with_message("failed to reach daemon api")
                .with_source(err)),
        }
    }
}

fn api_url(base_url: &Url, path: &[String]) -> Result<Url, Error> {
    let mut url = base_url.clone();
    {
        let mut segments = url.path_segments_mut().map_err(|_| {
            Error::new(ErrorKind::Internal).with_message("daemon api url cannot be a base")
        })?;
        segments.clear();
        segments.push("api");
        segments.push("v0");
        for segment in path {
            segments.push(segment);
        }
    }
    Ok(url)
}

fn parse_error_response(status: u16, response: ureq::Response) -> Error {
    let body = response.into_string().unwrap_or_default();
    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(&body) {
        return error_from_remote(envelope.error);
    }
    Error::new(error_kind_from_status(status))
        .with_message(format!("daemon api returned status {status}"))
}

fn error_from_remote(remote: RemoteError) -> Error {
    let mut err = Error::new(parse_error_kind(&remote.kind));
    if let Some(message) = remote.message {
        err = err.with_message(message);
    }
    if let Some(hint) = remote.hint {
        err = err.with_hint(hint);
    }
    err
}

fn parse_error_kind(kind: &str) -> ErrorKind {
    match kind {
        "Internal" => ErrorKind::Internal,
        "Usage" => ErrorKind::Usage,
        "Client" => ErrorKind::Client,
        "NotCallable" => ErrorKind::NotCallable,
        "Config" => ErrorKind::Config,
        "NotFound" => ErrorKind::NotFound,
        "AlreadyExists" => ErrorKind::AlreadyExists,
        "Busy" => ErrorKind::Busy,
        "Transport" => ErrorKind::Transport,
        "Io" => ErrorKind::Io,
        _ => ErrorKind::Internal,
    }
}

fn error_kind_from_status(status: u16) -> ErrorKind {
    match status {
        400 => ErrorKind::Usage,
        404 => ErrorKind::NotFound,
        409 => ErrorKind::AlreadyExists,
        423 => ErrorKind::Busy,
        _ => ErrorKind::Internal,
    }
}

#[cfg(test)]
mod tests {
    use super::{RemoteClient, api_url, parse_error_kind};
    use crate::cmds::{Context, OptValue, Request};
    use crate::core::error::ErrorKind;
    use std::net::TcpListener;
    use std::path::PathBuf;

    #[test]
    fn api_url_joins_command_path() {
        let client = RemoteClient::new("127.0.0.1:5201").expect("client");
        let url = api_url(
            client.base_url(),
            &["stats".to_string(), "repo".to_string()],
        )
        .expect("url");
        assert_eq!(url.as_str(), "http://127.0.0.1:5201/api/v0/stats/repo");
    }

    #[test]
    fn error_kinds_round_trip_by_name() {
        for kind in [
            ErrorKind::Client,
            ErrorKind::NotCallable,
            ErrorKind::NotFound,
            ErrorKind::Busy,
        ] {
            assert_eq!(parse_error_kind(&format!("{kind:?}")), kind);
        }
        assert_eq!(parse_error_kind("SomethingNew"), ErrorKind::Internal);
    }

    #[test]
    fn connection_refusal_is_a_transport_error() {
        // Bind then drop a listener so the port is known-closed.
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let client = RemoteClient::new(&addr.to_string()).expect("client");
        let mut req = Request::new(vec!["id".to_string()], Context::new(PathBuf::from(".")));
        req.set_option("encoding", OptValue::Str("json".to_string()));
        let err = client.send(&req).expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Transport);
    }
}
