//! REPL – operator console for one teleoperation session.
//!
//! Supported slash-commands:
//!   /help                 – show this list
//!   /joints               – print the synchronized joint map
//!   /set <joint> <value>  – edit one joint (degrees or millimetres)
//!   /reset                – send every joint back to rest
//!   /status               – connection indicator and last error
//!   /telemetry            – latest telemetry snapshot
//!   /reconnect            – reconnect after the retry limit was reached;
//!                           queued edits replay in order
//!   /quit | /exit         – close the session and exit

use colored::Colorize;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use medbot_sync::{FetchPhase, TeleopSession, TriggerFetchCoordinator};
use medbot_types::{CloseReason, ConnectionState, JointKind};
use serde_json::Value;

use crate::view::NativeJointView;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Joints,
    Set { joint: String, value: f64 },
    Reset,
    Status,
    Telemetry,
    Reconnect,
    Quit,
}

/// Parse one input line.
pub fn parse(line: &str) -> Result<Command, String> {
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return Err("empty command".to_string());
    };

    let command = match head {
        "/help" => Command::Help,
        "/joints" => Command::Joints,
        "/reset" => Command::Reset,
        "/status" => Command::Status,
        "/telemetry" => Command::Telemetry,
        "/reconnect" => Command::Reconnect,
        "/quit" | "/exit" => Command::Quit,
        "/set" => {
            let (Some(joint), Some(raw)) = (words.next(), words.next()) else {
                return Err("usage: /set <joint> <value>".to_string());
            };
            let value = raw
                .parse::<f64>()
                .map_err(|_| format!("'{raw}' is not a number"))?;
            Command::Set {
                joint: joint.to_string(),
                value,
            }
        }
        other => return Err(format!("unknown command '{other}'")),
    };

    match words.next() {
        Some(extra) => Err(format!("unexpected argument '{extra}'")),
        None => Ok(command),
    }
}

/// Everything the console commands act on.
pub struct Console<'a> {
    pub session: &'a mut TeleopSession,
    pub view: &'a NativeJointView,
    pub telemetry: Option<&'a TriggerFetchCoordinator<Value>>,
}

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled each iteration; when set the REPL exits cleanly.
pub fn run(shutdown: Arc<AtomicBool>, mut console: Console<'_>) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        print!("{} ", "medbot>".bold().cyan());
        stdout.flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        }

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match parse(line) {
            Ok(Command::Quit) => {
                println!("{}", "Closing session.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Ok(command) => console.execute(command),
            Err(e) => println!(
                "{} {}. Type {} for available commands.",
                "Error:".red(),
                e.yellow(),
                "/help".bold()
            ),
        }
    }
}

impl Console<'_> {
    fn execute(&mut self, command: Command) {
        match command {
            Command::Help => cmd_help(),
            Command::Joints => self.cmd_joints(),
            Command::Set { joint, value } => self.cmd_set(&joint, value),
            Command::Reset => self.cmd_reset(),
            Command::Status => self.cmd_status(),
            Command::Telemetry => self.cmd_telemetry(),
            Command::Reconnect => {
                self.session.reconnect();
                println!("  {}", "Reconnect requested.".green());
            }
            Command::Quit => {}
        }
    }

    fn cmd_joints(&self) {
        let pipeline = self.session.pipeline();
        let values = pipeline.snapshot();

        println!("{}", "Joints".bold().underline());
        for spec in pipeline.specs() {
            let value = values.get(&spec.id).copied().unwrap_or_default();
            let (unit, native_unit) = units_for(spec.kind);
            let native = self
                .view
                .get(&spec.id)
                .map(|v| format!("{v:>9.4} {native_unit}"))
                .unwrap_or_else(|| "-".to_string());
            println!(
                "  {:<14} {:>9.2} {:<3} [{:>7.1} .. {:<7.1}]  {}",
                spec.id.bold(),
                value,
                unit,
                spec.min,
                spec.max,
                native.dimmed()
            );
        }
    }

    fn cmd_set(&self, joint: &str, value: f64) {
        match self.session.pipeline().set_local(joint, value) {
            Ok(stored) if stored != value => println!(
                "  {} {} clamped to {}",
                "⚠".yellow(),
                joint.bold(),
                stored.to_string().yellow()
            ),
            Ok(stored) => println!("  {} {} = {}", "✓".green(), joint.bold(), stored),
            Err(e) => println!("  {}: {}", "Error".red(), e),
        }
    }

    fn cmd_reset(&self) {
        match self.session.pipeline().reset_all() {
            Ok(()) => println!("  {} All joints reset to rest.", "✓".green()),
            Err(e) => println!("  {}: {}", "Error".red(), e),
        }
    }

    fn cmd_status(&self) {
        let state = self.session.state();
        let indicator = match &state {
            ConnectionState::Open => state.to_string().green(),
            ConnectionState::Closed(CloseReason::Exhausted { .. }) => state.to_string().red(),
            _ => state.to_string().yellow(),
        };
        println!("{}", "Status".bold().underline());
        println!("  Endpoint   : {}", self.session.endpoint().dimmed());
        println!("  Connection : {}", indicator);
        match self.session.pipeline().last_error() {
            Some(e) => println!("  Last error : {}", e.red()),
            None => println!("  Last error : {}", "none".dimmed()),
        }
        if state.is_exhausted() {
            println!("  Type {} to try again.", "/reconnect".bold().cyan());
        }
    }

    fn cmd_telemetry(&self) {
        let Some(coordinator) = self.telemetry else {
            println!("  Telemetry is not configured (trigger_url / snapshot_url).");
            return;
        };
        let state = coordinator.state();
        let phase = match state.phase {
            FetchPhase::Loading => "loading".yellow(),
            FetchPhase::Ready => "ready".green(),
        };
        println!("{}", "Telemetry".bold().underline());
        println!("  Phase   : {}  ({} fetches)", phase, state.fetch_count);
        if let Some(e) = &state.last_error {
            println!("  Error   : {}", e.red());
        }
        match &state.data {
            Some(data) => {
                let pretty = serde_json::to_string_pretty(data).unwrap_or_else(|_| data.to_string());
                for line in pretty.lines() {
                    println!("    {line}");
                }
            }
            None => println!("  {}", "no snapshot yet".dimmed()),
        }
    }
}

fn cmd_help() {
    println!();
    println!("{}", "medbot Commands".bold().underline());
    println!("  {}               – print the joint map", "/joints".bold().cyan());
    println!("  {}  – edit one joint", "/set <joint> <value>".bold().cyan());
    println!("  {}                – send every joint to rest", "/reset".bold().cyan());
    println!("  {}               – connection indicator", "/status".bold().cyan());
    println!("  {}            – latest telemetry snapshot", "/telemetry".bold().cyan());
    println!(
        "  {}            – retry after giving up; edits queued while offline replay in order",
        "/reconnect".bold().cyan()
    );
    println!("  {}          – close the session and exit", "/quit  /exit".bold().cyan());
    println!();
}

/// Display units (UI, native) for a joint kind.
fn units_for(kind: JointKind) -> (&'static str, &'static str) {
    match kind {
        JointKind::Prismatic => ("mm", "m"),
        JointKind::Revolute | JointKind::Continuous => ("°", "rad"),
        JointKind::Fixed => ("", ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_commands() {
        assert_eq!(parse("/help"), Ok(Command::Help));
        assert_eq!(parse("  /joints "), Ok(Command::Joints));
        assert_eq!(parse("/exit"), Ok(Command::Quit));
        assert_eq!(parse("/reconnect"), Ok(Command::Reconnect));
    }

    #[test]
    fn parses_set_with_joint_and_value() {
        assert_eq!(
            parse("/set elbow -42.5"),
            Ok(Command::Set {
                joint: "elbow".to_string(),
                value: -42.5
            })
        );
    }

    #[test]
    fn set_requires_two_arguments() {
        assert!(parse("/set elbow").unwrap_err().contains("usage"));
        assert!(parse("/set elbow fast").unwrap_err().contains("not a number"));
    }

    #[test]
    fn rejects_unknown_commands_and_extra_arguments() {
        assert!(parse("/dance").unwrap_err().contains("unknown command"));
        assert!(parse("/reset now").unwrap_err().contains("unexpected argument"));
    }

    #[test]
    fn units_follow_joint_kind() {
        assert_eq!(units_for(JointKind::Prismatic), ("mm", "m"));
        assert_eq!(units_for(JointKind::Continuous), ("°", "rad"));
    }
}
