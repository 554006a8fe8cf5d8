mod artifact;
mod config;
mod hooks;
mod packager;
mod sandbox;
mod webhook;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::artifact::Artifact;
use crate::config::Config;
use crate::hooks::{HookTable, ScriptHook};
use crate::packager::{Packager, BUNDLE_NAME};
use crate::sandbox::{Sandbox, SandboxLimits, ScriptCache};
use crate::webhook::AppState;

const DEFAULT_CONFIG_PATH: &str = "config/capgate.toml";
const DEFAULT_OUT_DIR: &str = "dist";

fn print_help() {
    println!(
        "\
capgate v{}

Packages TypeScript/JavaScript capabilities and runs them as a Kubernetes
mutating admission webhook.

USAGE:
    capgate build <PATH> [--out DIR]
    capgate run <PATH> --payload <FILE>
    capgate serve [CONFIG_PATH]

COMMANDS:
    build    Bundle, type-strip and minify a capability, then write
             {BUNDLE_NAME}, artifact/{{hash,sig,data}} and the
             data-<digest>.yaml Secret manifest to DIR [default: {DEFAULT_OUT_DIR}]
    run      Build a capability and execute it once with the content of
             FILE as payload; prints the resulting JSON value
    serve    Load the artifact and serve /mutate and /healthz
             [default config: {DEFAULT_CONFIG_PATH}]

OPTIONS:
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG    Log level filter for tracing
                (e.g. debug, capgate=debug,capability=warn)

EXAMPLES:
    capgate build capability.ts                 # writes ./dist
    capgate run capability.ts --payload req.json
    capgate serve /etc/capgate/capgate.toml
    RUST_LOG=debug capgate serve                # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

enum Command {
    Build { source: PathBuf, out: PathBuf },
    Run { source: PathBuf, payload: PathBuf },
    Serve { config_path: String },
}

fn parse_args(args: &[String]) -> Result<Command> {
    let Some((command, rest)) = args.split_first() else {
        bail!("missing command (try --help)");
    };

    let mut positional = Vec::new();
    let mut out = None;
    let mut payload = None;
    let mut iter = rest.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--out" => out = Some(iter.next().ok_or_else(|| anyhow!("--out requires a value"))?),
            "--payload" => payload = Some(iter.next().ok_or_else(|| anyhow!("--payload requires a value"))?),
            flag if flag.starts_with("--") => bail!("unknown option '{flag}'"),
            value => positional.push(value),
        }
    }

    match command.as_str() {
        "build" => {
            let [source] = positional[..] else {
                bail!("usage: capgate build <PATH> [--out DIR]");
            };
            Ok(Command::Build {
                source: PathBuf::from(source),
                out: PathBuf::from(out.map_or(DEFAULT_OUT_DIR, String::as_str)),
            })
        }
        "run" => {
            let ([source], Some(payload)) = (&positional[..], payload) else {
                bail!("usage: capgate run <PATH> --payload <FILE>");
            };
            Ok(Command::Run {
                source: PathBuf::from(source),
                payload: PathBuf::from(payload),
            })
        }
        "serve" => {
            let config_path = match positional[..] {
                [] => DEFAULT_CONFIG_PATH,
                [path] => path,
                _ => bail!("usage: capgate serve [CONFIG_PATH]"),
            };
            Ok(Command::Serve {
                config_path: config_path.to_string(),
            })
        }
        other => bail!("unknown command '{other}' (try --help)"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("capgate v{}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            _ => {}
        }
    }

    // Logs go to stderr so that `build` and `run` output stays pipeable
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("capgate=info,capability=info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match parse_args(&args)? {
        Command::Build { source, out } => build(&source, &out),
        Command::Run { source, payload } => run(&source, &payload).await,
        Command::Serve { config_path } => serve(&config_path).await,
    }
}

fn build(source: &Path, out: &Path) -> Result<()> {
    let script = Packager::new().package(source)?;
    let artifact = Artifact::from_script(&script);

    std::fs::create_dir_all(out).with_context(|| format!("cannot create {}", out.display()))?;
    std::fs::write(out.join(BUNDLE_NAME), &script.code)
        .with_context(|| format!("cannot write {}", out.join(BUNDLE_NAME).display()))?;
    artifact.write_dir(&out.join("artifact"))?;

    let manifest_path = out.join(format!("{}.yaml", artifact.name));
    std::fs::write(&manifest_path, artifact.to_manifest()?)
        .with_context(|| format!("cannot write {}", manifest_path.display()))?;

    info!(out = %out.display(), "Wrote artifact {}", artifact.name);
    println!("{}", artifact.name);
    Ok(())
}

async fn run(source: &Path, payload_path: &Path) -> Result<()> {
    let script = Arc::new(Packager::new().package(source)?);
    let payload = std::fs::read(payload_path)
        .with_context(|| format!("cannot read payload {}", payload_path.display()))?;

    let sandbox = Arc::new(Sandbox::new(SandboxLimits::default(), Arc::new(ScriptCache::new())));
    let value = sandbox.run_blocking_task(script, payload).await?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

async fn serve(config_path: &str) -> Result<()> {
    info!("Loading config from {config_path}");
    let config = Config::load(config_path)
        .with_context(|| format!("cannot load config {config_path}"))?;
    let addr = config.server.socket_addr()?;
    let operations = config.webhook.operations()?;

    let script = Arc::new(artifact::load(&config.artifact.path)?);
    let limits = config.sandbox.limits();
    info!(
        "Sandbox limits: {}ms, {} MiB heap, {} KiB stack",
        limits.timeout.as_millis(),
        config.sandbox.memory_limit_mb,
        config.sandbox.max_stack_kb
    );

    let sandbox = Arc::new(Sandbox::new(limits, Arc::new(ScriptCache::new())));
    sandbox.warm(&script)?;

    let mut hooks = HookTable::new();
    let hook = Arc::new(ScriptHook::new(
        script.digest.artifact_name(),
        Arc::clone(&sandbox),
        Arc::clone(&script),
    ));
    for operation in operations {
        hooks.bind(operation, hook.clone())?;
    }
    if hooks.is_empty() {
        warn!("No operations configured; every admission request will be allowed unchanged");
    }
    info!(
        "Hooks bound to: {}",
        hooks
            .bound_operations()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    );

    webhook::serve(addr, AppState::new(hooks)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_build_default_out() {
        match parse_args(&args(&["build", "cap.ts"])).unwrap() {
            Command::Build { source, out } => {
                assert_eq!(source, PathBuf::from("cap.ts"));
                assert_eq!(out, PathBuf::from("dist"));
            }
            _ => panic!("expected build"),
        }
    }

    #[test]
    fn test_parse_build_with_out() {
        match parse_args(&args(&["build", "--out", "target/cap", "cap.ts"])).unwrap() {
            Command::Build { out, .. } => assert_eq!(out, PathBuf::from("target/cap")),
            _ => panic!("expected build"),
        }
    }

    #[test]
    fn test_parse_run_requires_payload() {
        assert!(parse_args(&args(&["run", "cap.ts"])).is_err());
        match parse_args(&args(&["run", "cap.ts", "--payload", "req.json"])).unwrap() {
            Command::Run { payload, .. } => assert_eq!(payload, PathBuf::from("req.json")),
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_parse_serve_default_config() {
        match parse_args(&args(&["serve"])).unwrap() {
            Command::Serve { config_path } => assert_eq!(config_path, "config/capgate.toml"),
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn test_parse_rejects_unknown() {
        assert!(parse_args(&args(&[])).is_err());
        assert!(parse_args(&args(&["deploy"])).is_err());
        assert!(parse_args(&args(&["build", "a.ts", "--force"])).is_err());
        assert!(parse_args(&args(&["build"])).is_err());
    }

    #[test]
    fn test_build_writes_outputs() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("cap.ts");
        std::fs::write(&source, "export function transform(p: string): null { return null; }").unwrap();
        let out = tmp.path().join("dist");
        build(&source, &out).unwrap();

        let script = artifact::load(&out.join("artifact")).unwrap();
        assert_eq!(std::fs::read_to_string(out.join("capability.js")).unwrap(), script.code);
        assert!(out.join(format!("{}.yaml", script.digest.artifact_name())).exists());
    }
}
