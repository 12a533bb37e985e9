use std::env;

use recall_contracts::{contracts_manifest_v1, ActionParams, Resolution};
use recall_runtime::{verify_audit_chain, Command, Runtime};
use serde::Serialize;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "\
Usage: recall <command> [--config <path>] [--session <path>] [args]

Commands:
  add <callback_id> <behavior_id> [--scenario <name>] [--payload <json>] [--params <json>]
  success|fail|timeout <callback_id>
  expire
  check-saved <behavior_id>
  check-misstate <callback_id>
  set-scenario [name]
  show
  verify-audit <path>
  contracts";

#[derive(Debug, PartialEq)]
enum Invocation {
    Session {
        config_path: String,
        session_path: String,
        command: Command,
    },
    VerifyAudit(String),
    Contracts,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let invocation = match parse_args(env::args().skip(1).collect()) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("{e}\n\n{USAGE}");
            std::process::exit(2);
        }
    };

    match invocation {
        Invocation::Contracts => {
            let manifest = contracts_manifest_v1();
            let schemas: Vec<Value> = manifest
                .schemas
                .iter()
                .map(|s| json!({"name": s.name, "sha256": s.sha256}))
                .collect();
            print_json(&json!({
                "version": manifest.version,
                "schema_set_sha256": manifest.schema_set_sha256,
                "generated_at": manifest.generated_at,
                "schemas": schemas,
            }));
        }
        Invocation::VerifyAudit(path) => match verify_audit_chain(&path) {
            Ok(summary) => println!("{summary}"),
            Err(e) => {
                eprintln!("audit verification failed: {e}");
                std::process::exit(1);
            }
        },
        Invocation::Session {
            config_path,
            session_path,
            command,
        } => {
            tracing::debug!(config = %config_path, session = %session_path, "executing command");
            let cfg = match recall_config::load_and_validate(&config_path) {
                Ok(v) => v,
                Err(e) => {
                    eprintln!("failed to load config: {e}");
                    std::process::exit(1);
                }
            };
            let runtime = match Runtime::from_config(cfg) {
                Ok(v) => v,
                Err(e) => {
                    eprintln!("failed to build runtime: {e}");
                    std::process::exit(1);
                }
            };
            match runtime.execute(&session_path, command) {
                Ok(output) => print_json(&output),
                Err(e) => {
                    eprintln!("command failed: {e}");
                    std::process::exit(1);
                }
            }
        }
    }
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => {
            eprintln!("failed to render output: {e}");
            std::process::exit(1);
        }
    }
}

fn parse_args(args: Vec<String>) -> Result<Invocation, String> {
    let mut args = args.into_iter();
    let cmd = args.next().ok_or_else(|| "missing command".to_string())?;

    let mut config_path = String::from("./config/example-config.yaml");
    let mut session_path = String::from("./session.json");
    let mut scenario: Option<String> = None;
    let mut payload: Option<Value> = None;
    let mut params: Option<ActionParams> = None;
    let mut positional = Vec::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config_path = flag_value(&mut args, "--config")?,
            "--session" => session_path = flag_value(&mut args, "--session")?,
            "--scenario" => scenario = Some(flag_value(&mut args, "--scenario")?),
            "--payload" => {
                let raw = flag_value(&mut args, "--payload")?;
                payload = Some(
                    serde_json::from_str(&raw).map_err(|e| format!("invalid --payload: {e}"))?,
                );
            }
            "--params" => {
                let raw = flag_value(&mut args, "--params")?;
                params = Some(
                    serde_json::from_str(&raw).map_err(|e| format!("invalid --params: {e}"))?,
                );
            }
            other if other.starts_with("--") => return Err(format!("unknown flag: {other}")),
            _ => positional.push(arg),
        }
    }

    let command = match cmd.as_str() {
        "contracts" => return Ok(Invocation::Contracts),
        "verify-audit" => {
            let [path] = take::<1>(positional, "verify-audit <path>")?;
            return Ok(Invocation::VerifyAudit(path));
        }
        "add" => {
            let [callback_id, behavior_id] =
                take::<2>(positional, "add <callback_id> <behavior_id>")?;
            Command::Add {
                callback_id,
                behavior_id,
                scenario_id: scenario,
                text_preprocessing_result: payload,
                action_params: params,
            }
        }
        "success" | "fail" | "timeout" => {
            let resolution = match cmd.as_str() {
                "success" => Resolution::Success,
                "fail" => Resolution::Fail,
                _ => Resolution::Timeout,
            };
            let [callback_id] = take::<1>(positional, "<resolution> <callback_id>")?;
            Command::Resolve {
                callback_id,
                resolution,
            }
        }
        "expire" => {
            take::<0>(positional, "expire")?;
            Command::Expire
        }
        "check-saved" => {
            let [behavior_id] = take::<1>(positional, "check-saved <behavior_id>")?;
            Command::CheckSavedId { behavior_id }
        }
        "check-misstate" => {
            let [callback_id] = take::<1>(positional, "check-misstate <callback_id>")?;
            Command::CheckMisstate { callback_id }
        }
        "set-scenario" => {
            if positional.len() > 1 {
                return Err("set-scenario takes at most one name".to_string());
            }
            Command::SetScenario {
                scenario: positional.into_iter().next(),
            }
        }
        "show" => {
            take::<0>(positional, "show")?;
            Command::Show
        }
        other => return Err(format!("unknown command: {other}")),
    };

    Ok(Invocation::Session {
        config_path,
        session_path,
        command,
    })
}

fn flag_value(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<String, String> {
    args.next().ok_or_else(|| format!("{flag} requires a value"))
}

fn take<const N: usize>(positional: Vec<String>, usage: &str) -> Result<[String; N], String> {
    positional
        .try_into()
        .map_err(|_| format!("expected: {usage}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_add_with_flags() {
        let inv = parse_args(args(&[
            "add",
            "123",
            "test",
            "--scenario",
            "checkout",
            "--params",
            r#"{"timeout": 5}"#,
            "--session",
            "/tmp/s.json",
        ]))
        .unwrap();
        let Invocation::Session {
            session_path,
            command,
            ..
        } = inv
        else {
            panic!("expected session invocation");
        };
        assert_eq!(session_path, "/tmp/s.json");
        let mut params = ActionParams::new();
        params.insert("timeout".to_string(), json!(5));
        assert_eq!(
            command,
            Command::Add {
                callback_id: "123".to_string(),
                behavior_id: "test".to_string(),
                scenario_id: Some("checkout".to_string()),
                text_preprocessing_result: None,
                action_params: Some(params),
            }
        );
    }

    #[test]
    fn parses_resolutions() {
        for (name, resolution) in [
            ("success", Resolution::Success),
            ("fail", Resolution::Fail),
            ("timeout", Resolution::Timeout),
        ] {
            let inv = parse_args(args(&[name, "cb"])).unwrap();
            assert!(matches!(
                inv,
                Invocation::Session { command: Command::Resolve { resolution: r, .. }, .. } if r == resolution
            ));
        }
    }

    #[test]
    fn set_scenario_without_name_clears_it() {
        let inv = parse_args(args(&["set-scenario"])).unwrap();
        assert!(matches!(
            inv,
            Invocation::Session {
                command: Command::SetScenario { scenario: None },
                ..
            }
        ));
    }

    #[test]
    fn rejects_bad_arity_and_unknown_input() {
        assert!(parse_args(args(&["success"])).is_err());
        assert!(parse_args(args(&["expire", "extra"])).is_err());
        assert!(parse_args(args(&["launch"])).is_err());
        assert!(parse_args(args(&["show", "--verbose"])).is_err());
        assert!(parse_args(args(&["add", "1", "b", "--params", "[1]"])).is_err());
        assert!(parse_args(vec![]).is_err());
    }

    #[test]
    fn verify_audit_and_contracts_skip_session() {
        assert_eq!(
            parse_args(args(&["verify-audit", "a.jsonl"])).unwrap(),
            Invocation::VerifyAudit("a.jsonl".to_string())
        );
        assert_eq!(parse_args(args(&["contracts"])).unwrap(), Invocation::Contracts);
    }
}
