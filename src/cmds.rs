//! Purpose: Command-tree model shared by the CLI, the dispatcher, and the daemon.
//! Exports: `Command`, `OptDef`, `ArgDef`, `Encoding`, `Request`, `OptValue`,
//! `Context`, `Response`.
//! Role: The tree declares what commands exist; `Request` carries one parsed
//! invocation through whichever backend runs it.
//! Invariants: Command nodes are immutable after construction.
//! Invariants: An option is present in a request's map only when it was set
//! explicitly (or injected as a recorded default); absence means "defaulted".

use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;

use crate::core::config::Config;
use crate::core::error::{Error, ErrorKind};
use crate::core::node::Node;

pub type RunFn = fn(&mut Request) -> Result<Response, Error>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Encoding {
    Text,
    Json,
}

impl Encoding {
    pub fn as_str(self) -> &'static str {
        match self {
            Encoding::Text => "text",
            Encoding::Json => "json",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "text" => Some(Encoding::Text),
            "json" => Some(Encoding::Json),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OptKind {
    Bool,
    Str,
}

#[derive(Clone, Debug)]
pub struct OptDef {
    pub name: &'static str,
    pub short: Option<char>,
    pub kind: OptKind,
    pub help: &'static str,
}

impl OptDef {
    pub fn flag(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            short: None,
            kind: OptKind::Bool,
            help,
        }
    }

    pub fn string(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            short: None,
            kind: OptKind::Str,
            help,
        }
    }

    pub fn with_short(mut self, short: char) -> Self {
        self.short = Some(short);
        self
    }
}

#[derive(Clone, Debug)]
pub struct ArgDef {
    pub name: &'static str,
    pub required: bool,
    pub help: &'static str,
}

impl ArgDef {
    pub fn new(name: &'static str, required: bool, help: &'static str) -> Self {
        Self {
            name,
            required,
            help,
        }
    }
}

/// One node in the command tree: either an executable command or a grouping
/// node that only holds subcommands.
#[derive(Debug)]
pub struct Command {
    help: &'static str,
    options: Vec<OptDef>,
    arguments: Vec<ArgDef>,
    encodings: Vec<Encoding>,
    run: Option<RunFn>,
    always_local: bool,
    subcommands: BTreeMap<&'static str, Command>,
}

impl Command {
    pub fn new(help: &'static str) -> Self {
        Self {
            help,
            options: Vec::new(),
            arguments: Vec::new(),
            encodings: vec![Encoding::Json],
            run: None,
            always_local: false,
            subcommands: BTreeMap::new(),
        }
    }

    pub fn with_run(mut self, run: RunFn) -> Self {
        self.run = Some(run);
        self
    }

    pub fn with_option(mut self, option: OptDef) -> Self {
        self.options.push(option);
        self
    }

    pub fn with_argument(mut self, argument: ArgDef) -> Self {
        self.arguments.push(argument);
        self
    }

    pub fn with_encodings(mut self, encodings: &[Encoding]) -> Self {
        self.encodings = encodings.to_vec();
        self
    }

    /// Marks a command that must run in-process no matter what: the daemon
    /// lifecycle commands themselves, and anything else whose routing through
    /// a daemon would recurse or make no sense.
    pub fn always_local(mut self) -> Self {
        self.always_local = true;
        self
    }

    pub fn with_subcommand(mut self, name: &'static str, command: Command) -> Self {
        self.subcommands.insert(name, command);
        self
    }

    pub fn help(&self) -> &'static str {
        self.help
    }

    pub fn options(&self) -> &[OptDef] {
        &self.options
    }

    pub fn arguments(&self) -> &[ArgDef] {
        &self.arguments
    }

    pub fn encodings(&self) -> &[Encoding] {
        &self.encodings
    }

    pub fn is_always_local(&self) -> bool {
        self.always_local
    }

    pub fn has_run(&self) -> bool {
        self.run.is_some()
    }

    pub fn subcommands(&self) -> impl Iterator<Item = (&'static str, &Command)> {
        self.subcommands.iter().map(|(name, cmd)| (*name, cmd))
    }

    pub fn resolve(&self, path: &[String]) -> Result<&Command, Error> {
        let mut node = self;
        for segment in path {
            node = node.subcommands.get(segment.as_str()).ok_or_else(|| {
                Error::new(ErrorKind::Usage)
                    .with_message(format!("unknown command '{}'", path.join(" ")))
            })?;
        }
        Ok(node)
    }

    /// Resolves the request's path and invokes the node's behavior. A node
    /// without a run function yields the not-callable sentinel.
    pub fn call(&self, req: &mut Request) -> Result<Response, Error> {
        let node = self.resolve(req.path())?;
        let Some(run) = node.run else {
            return Err(Error::not_callable(&req.path().join(" ")));
        };
        run(req)
    }

    /// Preferred encoding when the user did not ask for one: plain text if
    /// the node supports it, the structured encoding otherwise.
    pub fn default_encoding(&self) -> Encoding {
        if self.encodings.contains(&Encoding::Text) {
            Encoding::Text
        } else {
            Encoding::Json
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum OptValue {
    Bool(bool),
    Str(String),
}

impl OptValue {
    pub fn to_json(&self) -> Value {
        match self {
            OptValue::Bool(value) => Value::Bool(*value),
            OptValue::Str(value) => Value::String(value.clone()),
        }
    }

    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(flag) => Some(OptValue::Bool(*flag)),
            Value::String(text) => Some(OptValue::Str(text.clone())),
            _ => None,
        }
    }
}

/// One parsed invocation. Read-only except for the attached context, which
/// the chosen backend populates.
pub struct Request {
    path: Vec<String>,
    options: BTreeMap<String, OptValue>,
    arguments: Vec<String>,
    context: Context,
}

impl Request {
    pub fn new(path: Vec<String>, context: Context) -> Self {
        Self {
            path,
            options: BTreeMap::new(),
            arguments: Vec::new(),
            context,
        }
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    pub fn set_arguments(&mut self, arguments: Vec<String>) {
        self.arguments = arguments;
    }

    pub fn set_option(&mut self, name: impl Into<String>, value: OptValue) {
        self.options.insert(name.into(), value);
    }

    /// `Some(value)` when the option was explicitly set, `None` otherwise.
    pub fn option_bool(&self, name: &str) -> Option<bool> {
        match self.options.get(name) {
            Some(OptValue::Bool(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn option_str(&self, name: &str) -> Option<&str> {
        match self.options.get(name) {
            Some(OptValue::Str(value)) => Some(value),
            _ => None,
        }
    }

    pub fn options(&self) -> &BTreeMap<String, OptValue> {
        &self.options
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.context
    }

    /// Records the node's preferred encoding when the user did not pick one,
    /// so every layer downstream (including the daemon) sees the same choice.
    pub fn apply_encoding_default(&mut self, node: &Command) {
        if self.option_str("encoding").is_none() {
            let encoding = node.default_encoding();
            self.set_option("encoding", OptValue::Str(encoding.as_str().to_string()));
        }
    }

    pub fn encoding(&self) -> Encoding {
        self.option_str("encoding")
            .and_then(Encoding::parse)
            .unwrap_or(Encoding::Json)
    }
}

/// Per-invocation mutable state threaded through parse and dispatch.
pub struct Context {
    config_root: PathBuf,
    config: Option<Config>,
    node: Option<Arc<Node>>,
}

impl Context {
    pub fn new(config_root: PathBuf) -> Self {
        Self {
            config_root,
            config: None,
            node: None,
        }
    }

    pub fn config_root(&self) -> &Path {
        &self.config_root
    }

    pub fn config(&self) -> Result<&Config, Error> {
        self.config.as_ref().ok_or_else(|| {
            Error::new(ErrorKind::NotFound)
                .with_message("no keel configuration found")
                .with_path(crate::core::config::config_filename(&self.config_root))
                .with_hint("Run 'keel init' to create one.")
        })
    }

    pub fn set_config(&mut self, config: Config) {
        self.config = Some(config);
    }

    pub fn node(&self) -> Result<&Arc<Node>, Error> {
        self.node.as_ref().ok_or_else(|| {
            Error::new(ErrorKind::Internal).with_message("no node attached to this invocation")
        })
    }

    pub fn set_node(&mut self, node: Arc<Node>) {
        self.node = Some(node);
    }

    pub fn clear_node(&mut self) {
        self.node = None;
    }
}

/// A command's output: a byte stream whose ownership moves to whoever drains
/// it to the final sink.
pub struct Response {
    reader: Box<dyn Read + Send>,
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response").finish_non_exhaustive()
    }
}

impl Response {
    pub fn from_string(text: impl Into<String>) -> Self {
        Self {
            reader: Box::new(Cursor::new(text.into().into_bytes())),
        }
    }

    pub fn from_json(value: &Value) -> Self {
        Self::from_string(format!("{value}\n"))
    }

    pub fn from_reader(reader: Box<dyn Read + Send>) -> Self {
        Self { reader }
    }

    pub fn into_reader(self) -> Box<dyn Read + Send> {
        self.reader
    }
}
