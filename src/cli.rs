//! Purpose: Bridge the command tree to clap and parsed matches to a `Request`.
//! Exports: `build`, `request_from_matches`, `render_short_help`.
//! Role: Argument parsing and help rendering stay clap's job; this module
//! only translates between the tree's declarations and clap's types.
//! Invariants: An option lands in the request map only when clap saw it on
//! the command line; clap-side defaults stay invisible to dispatch.

use clap::parser::ValueSource;
use clap::{Arg, ArgAction, ArgMatches};

use crate::cmds::{Command, Context, OptDef, OptKind, OptValue, Request};
use crate::core::config;
use crate::core::error::{Error, ErrorKind};

pub fn build(root: &Command) -> clap::Command {
    let mut cmd = clap::Command::new("keel")
        .version(env!("CARGO_PKG_VERSION"))
        .about(root.help())
        .arg_required_else_help(true);
    for opt in root.options() {
        cmd = cmd.arg(arg_from_opt(opt, true));
    }
    for (name, node) in root.subcommands() {
        cmd = cmd.subcommand(subcommand_from_node(name, node));
    }
    cmd
}

fn subcommand_from_node(name: &'static str, node: &Command) -> clap::Command {
    let mut cmd = clap::Command::new(name).about(node.help());
    for opt in node.options() {
        cmd = cmd.arg(arg_from_opt(opt, false));
    }
    for def in node.arguments() {
        cmd = cmd.arg(
            Arg::new(def.name)
                .help(def.help)
                .required(def.required)
                .action(ArgAction::Set),
        );
    }
    for (child_name, child) in node.subcommands() {
        cmd = cmd.subcommand(subcommand_from_node(child_name, child));
    }
    cmd
}

fn arg_from_opt(opt: &OptDef, global: bool) -> Arg {
    let mut arg = Arg::new(opt.name).long(opt.name).help(opt.help);
    if let Some(short) = opt.short {
        arg = arg.short(short);
    }
    arg = match opt.kind {
        OptKind::Bool => arg.action(ArgAction::SetTrue),
        OptKind::Str => arg.action(ArgAction::Set).value_name("VALUE"),
    };
    if global {
        arg = arg.global(true);
    }
    arg
}

/// Turns validated matches into a `Request`: command path, explicitly-set
/// options, positional arguments, and a context with the resolved config
/// root. A missing configuration file is tolerated here (commands that need
/// it fail at use time); a malformed one propagates unchanged.
pub fn request_from_matches(root: &Command, matches: &ArgMatches) -> Result<Request, Error> {
    let mut path = Vec::new();
    let mut current = matches;
    while let Some((name, sub)) = current.subcommand() {
        path.push(name.to_string());
        current = sub;
    }
    let node = root.resolve(&path)?;

    let config_root = match explicit_string(current, "config") {
        Some(dir) => std::path::PathBuf::from(dir),
        None => config::default_config_root(),
    };
    let mut context = Context::new(config_root.clone());
    match config::load(&config_root) {
        Ok(cfg) => context.set_config(cfg),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }

    let mut req = Request::new(path, context);
    for opt in root.options().iter().chain(node.options()) {
        record_option(&mut req, current, opt);
    }

    let mut arguments = Vec::new();
    for def in node.arguments() {
        if let Some(values) = current.get_many::<String>(def.name) {
            arguments.extend(values.cloned());
        }
    }
    req.set_arguments(arguments);
    req.apply_encoding_default(node);
    Ok(req)
}

/// Help for the node a failed invocation resolved to, shown after client
/// errors only.
pub fn render_short_help(root: &Command, path: &[String]) -> String {
    fn descend(cmd: &mut clap::Command, path: &[String]) -> String {
        if let Some((first, rest)) = path.split_first() {
            if let Some(sub) = cmd.find_subcommand_mut(first.as_str()) {
                return descend(sub, rest);
            }
        }
        cmd.render_help().to_string()
    }
    let mut cmd = build(root);
    descend(&mut cmd, path)
}

fn record_option(req: &mut Request, matches: &ArgMatches, opt: &OptDef) {
    if matches.value_source(opt.name) != Some(ValueSource::CommandLine) {
        return;
    }
    match opt.kind {
        OptKind::Bool => req.set_option(opt.name, OptValue::Bool(matches.get_flag(opt.name))),
        OptKind::Str => {
            if let Some(value) = matches.get_one::<String>(opt.name) {
                req.set_option(opt.name, OptValue::Str(value.clone()));
            }
        }
    }
}

fn explicit_string(matches: &ArgMatches, name: &str) -> Option<String> {
    if matches.value_source(name) != Some(ValueSource::CommandLine) {
        return None;
    }
    matches.get_one::<String>(name).cloned()
}
