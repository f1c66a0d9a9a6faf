//! Operator console – line-oriented commands against the running controllers.
//!
//! Supported commands:
//!   /help                          – show this list
//!   /status                        – one line per loaded controller
//!   /set <target> <value>          – force an output value
//!   /preset <target> <preset>      – force an output from a preset
//!   /param <instance> <key> <value> – write a parameter entity
//!   /diag <instance>               – print the diagnostics snapshot as JSON
//!   /reload <instance>             – re-read the config file and reload
//!   /quit | /exit                  – stop all controllers and exit
//!
//! `<target>` is an entity id, or an instance name standing for its output
//! sensor.

use std::sync::Arc;

use colored::Colorize;
use simplepid_params::ParameterStore;
use simplepid_runtime::{
    DiagnosticsSnapshot, OutputOverrideService, OverrideMode, register_parameter_entities,
};
use simplepid_types::{EntityId, ParameterKey, Preset, SetOutputRequest};
use tracing::warn;

use crate::config;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Status,
    Set { target: String, value: f64 },
    Preset { target: String, preset: String },
    Param { instance: String, key: ParameterKey, value: String },
    Diag { instance: String },
    Reload { instance: String },
    Quit,
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, String> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let usage = |u: &str| Err(format!("usage: {u}"));
        match words.as_slice() {
            ["/help"] => Ok(Command::Help),
            ["/status"] => Ok(Command::Status),
            ["/quit"] | ["/exit"] => Ok(Command::Quit),
            ["/set", target, value] => value
                .parse()
                .map(|value| Command::Set {
                    target: resolve_target(target),
                    value,
                })
                .map_err(|_| format!("'{value}' is not a number")),
            ["/set", ..] => usage("/set <target> <value>"),
            ["/preset", target, preset] => Ok(Command::Preset {
                target: resolve_target(target),
                preset: preset.to_string(),
            }),
            ["/preset", ..] => usage(&format!(
                "/preset <target> <{}>",
                Preset::ALL.map(|p| p.as_str()).join("|")
            )),
            ["/param", instance, key, value] => ParameterKey::ALL
                .into_iter()
                .find(|k| k.as_str() == *key)
                .map(|key| Command::Param {
                    instance: instance.to_string(),
                    key,
                    value: value.to_string(),
                })
                .ok_or_else(|| format!("unknown parameter '{key}'")),
            ["/param", ..] => usage("/param <instance> <key> <value>"),
            ["/diag", instance] => Ok(Command::Diag {
                instance: instance.to_string(),
            }),
            ["/diag", ..] => usage("/diag <instance>"),
            ["/reload", instance] => Ok(Command::Reload {
                instance: instance.to_string(),
            }),
            ["/reload", ..] => usage("/reload <instance>"),
            [other, ..] => Err(format!("unknown command '{other}'")),
            [] => Err("empty command".to_string()),
        }
    }
}

/// Bare instance names stand for the instance's output sensor.
fn resolve_target(raw: &str) -> String {
    if raw.contains('.') {
        raw.to_string()
    } else {
        format!("sensor.{}_pid_output", raw.to_lowercase())
    }
}

/// Whether the console keeps reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

pub struct Console {
    store: ParameterStore,
    service: OutputOverrideService,
}

impl Console {
    pub fn new(store: ParameterStore, service: OutputOverrideService) -> Self {
        Self { store, service }
    }

    pub async fn execute(&self, line: &str) -> Flow {
        let command = match Command::parse(line) {
            Ok(command) => command,
            Err(e) => {
                println!("{} {}. Type {} for available commands.", "Error:".red(), e, "/help".bold());
                return Flow::Continue;
            }
        };
        match command {
            Command::Help => print_help(),
            Command::Status => self.status(),
            Command::Set { target, value } => {
                self.set_output(SetOutputRequest::with_value(&target, value)).await
            }
            Command::Preset { target, preset } => {
                self.set_output(SetOutputRequest::with_preset(&target, &preset)).await
            }
            Command::Param { instance, key, value } => {
                let entity_id = EntityId::new(key.platform(), &key.unique_id(&instance).to_lowercase());
                self.store.set_state(&entity_id, &value);
                println!("  {} {} = {}", "✓".green(), entity_id, value.bold());
            }
            Command::Diag { instance } => self.diag(&instance).await,
            Command::Reload { instance } => self.reload(&instance).await,
            Command::Quit => return Flow::Quit,
        }
        Flow::Continue
    }

    fn status(&self) {
        let registry = self.service.registry();
        let ids = registry.instance_ids();
        if ids.is_empty() {
            println!("  {}", "No controllers loaded.".dimmed());
            return;
        }
        for id in ids {
            let Some(instance) = registry.get(&id) else {
                continue;
            };
            let snapshot = instance.handle().snapshot();
            let mode = if snapshot.auto_mode { "auto".green() } else { "manual".yellow() };
            println!(
                "  {:<12} {:<6} input={} output={} setpoint={} last_known={}",
                id.bold(),
                mode,
                fmt_opt(snapshot.history.input.latest().copied()),
                fmt_opt(instance.coordinator().data()),
                snapshot.setpoint,
                fmt_opt(snapshot.last_known_output),
            );
        }
    }

    async fn set_output(&self, request: SetOutputRequest) {
        match self.service.set_output(request).await {
            Ok(outcome) => {
                let note = match outcome.mode {
                    OverrideMode::Auto => "auto mode, refresh requested",
                    OverrideMode::Manual => "manual mode, held",
                };
                println!(
                    "  {} {} output = {} ({})",
                    "✓".green(),
                    outcome.instance.bold(),
                    outcome.value,
                    note.dimmed()
                );
            }
            Err(e) => println!("  {} {}", "✗".red(), e),
        }
    }

    async fn diag(&self, id: &str) {
        let Some(instance) = self.service.registry().get(id) else {
            println!("  {} controller '{}' is not loaded", "✗".red(), id);
            return;
        };
        match DiagnosticsSnapshot::collect(&instance).await.to_json() {
            Ok(json) => println!("{json}"),
            Err(e) => println!("  {} {}", "✗".red(), e),
        }
    }

    async fn reload(&self, id: &str) {
        let cfg = match config::load() {
            Ok(Some(cfg)) => cfg,
            Ok(None) => {
                println!("  {} no config file at {}", "✗".red(), config::config_path().display());
                return;
            }
            Err(e) => {
                println!("  {} {}", "✗".red(), e);
                return;
            }
        };
        let Some(controller) = cfg.controller(id) else {
            println!("  {} controller '{}' is not configured", "✗".red(), id);
            return;
        };
        // Parameter entities of new controllers must exist before setup.
        if self.service.registry().get(id).is_none() {
            register_parameter_entities(&self.store, &controller.device, &controller.parameters);
        }
        match self.service.registry().reload(controller.device.clone()).await {
            Ok(instance) => println!("  {} {} reloaded", "✓".green(), instance.id().bold()),
            Err(e) => {
                warn!(instance = id, error = %e, "reload failed");
                println!("  {} {}", "✗".red(), e);
            }
        }
    }
}

fn fmt_opt(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{v:.3}"))
}

fn print_help() {
    println!();
    println!("{}", "Commands".bold().underline());
    println!("  {}            – loaded controllers", "/status".bold().cyan());
    println!("  {}  – force an output value", "/set <target> <value>".bold().cyan());
    println!("  {}  – force an output from a preset", "/preset <target> <name>".bold().cyan());
    println!("  {}  – write a parameter", "/param <instance> <key> <value>".bold().cyan());
    println!("  {}   – diagnostics snapshot", "/diag <instance>".bold().cyan());
    println!("  {} – reload from config file", "/reload <instance>".bold().cyan());
    println!("  {}      – exit", "/quit  /exit".bold().cyan());
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_override_commands() {
        assert_eq!(
            Command::parse("/set PID1 0.5"),
            Ok(Command::Set {
                target: "sensor.pid1_pid_output".into(),
                value: 0.5
            })
        );
        assert_eq!(
            Command::parse("/preset number.pid1_kp zero_start"),
            Ok(Command::Preset {
                target: "number.pid1_kp".into(),
                preset: "zero_start".into()
            })
        );
        assert!(Command::parse("/set PID1 lots").is_err());
        assert!(Command::parse("/set PID1").unwrap_err().starts_with("usage"));
    }

    #[test]
    fn parses_param_command() {
        assert_eq!(
            Command::parse("/param PID1 auto_mode off"),
            Ok(Command::Param {
                instance: "PID1".into(),
                key: ParameterKey::AutoMode,
                value: "off".into()
            })
        );
        assert_eq!(
            Command::parse("/param PID1 gain 2").unwrap_err(),
            "unknown parameter 'gain'"
        );
    }

    #[test]
    fn parses_simple_commands() {
        assert_eq!(Command::parse("  /status "), Ok(Command::Status));
        assert_eq!(Command::parse("/exit"), Ok(Command::Quit));
        assert_eq!(
            Command::parse("/diag PID1"),
            Ok(Command::Diag { instance: "PID1".into() })
        );
        assert_eq!(Command::parse("/launch").unwrap_err(), "unknown command '/launch'");
    }
}
