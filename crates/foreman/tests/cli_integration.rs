//! CLI integration tests for the Foreman command-line interface.
//!
//! Every test points `FOREMAN_CONFIG_DIR` at a scratch directory and runs
//! from another one, so no user or project config leaks in.

use std::path::Path;
use std::process::{Child, Stdio};
use std::time::{Duration, Instant};

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::TempDir;

struct Sandbox {
    config_dir: TempDir,
    work_dir: TempDir,
}

impl Sandbox {
    fn new() -> Self {
        Self {
            config_dir: tempfile::tempdir().unwrap(),
            work_dir: tempfile::tempdir().unwrap(),
        }
    }

    fn foreman(&self) -> Command {
        let mut cmd = Command::cargo_bin("foreman").unwrap();
        cmd.env("FOREMAN_CONFIG_DIR", self.config_dir.path())
            .env_remove("RUST_LOG")
            .current_dir(self.work_dir.path());
        cmd
    }

    fn write(&self, name: &str, contents: &str) -> std::path::PathBuf {
        let path = self.work_dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn path(&self) -> &Path {
        self.work_dir.path()
    }
}

const CHAIN: &str = r#"
[workflow]
id = "chain"
name = "Chain"

[[workflow.nodes]]
id = "greet"
type = "shell"
data = { command = "printf 'hello %s' \"${who}\"" }

[[workflow.nodes]]
id = "shout"
type = "shell"
data = { command = "printf '%s!' \"${greet.stdout}\"" }

[[workflow.edges]]
source = "greet"
target = "shout"
"#;

const CYCLE: &str = r#"
[workflow]
id = "loop"
name = "Loop"
nodes = [{ id = "a", type = "shell" }, { id = "b", type = "shell" }]
edges = [{ source = "a", target = "b" }, { source = "b", target = "a" }]
"#;

const BROKEN: &str = r#"
[workflow]
id = "broken"
name = "Broken"

[[workflow.nodes]]
id = "boom"
type = "shell"
data = { command = "echo kaput >&2; exit 7" }
"#;

const GATED: &str = r#"
[workflow]
id = "gated"
name = "Gated"

[[workflow.nodes]]
id = "gate"
type = "approval"
data = { title = "Release?", wait = true }

[[workflow.nodes]]
id = "release"
type = "shell"
data = { command = "printf released" }

[[workflow.edges]]
source = "gate"
target = "release"
"#;

const DYNAMIC: &str = r#"
[workflow]
id = "dyn"
name = "Dynamic"

[[workflow.nodes]]
id = "seed"
type = "shell"
data = { command = "printf 21" }

[[workflow.nodes]]
id = "generated"
type = "dynamic"

[workflow.nodes.data]
steps = [
    { id = "double", type = "shell", data = { command = "printf $((${seed.stdout} * 2))" } },
]

[[workflow.edges]]
source = "seed"
target = "generated"
"#;

fn stdout_json(output: &[u8]) -> Value {
    serde_json::from_slice(output).expect("stdout is not JSON")
}

// ─────────────────────────────────────────────────────────────────────────────
// Help and Version
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_help_lists_subcommands() {
    Sandbox::new()
        .foreman()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("validate"))
        .stdout(predicate::str::contains("generate"))
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("approve"))
        .stdout(predicate::str::contains("config"))
        .stdout(predicate::str::contains("sandbox-exec").not());
}

#[test]
fn test_version_displays() {
    Sandbox::new()
        .foreman()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("foreman"));
}

#[test]
fn test_unknown_subcommand_fails() {
    Sandbox::new()
        .foreman()
        .arg("frobnicate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized subcommand"));
}

// ─────────────────────────────────────────────────────────────────────────────
// validate
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_validate_prints_order() {
    let sb = Sandbox::new();
    let file = sb.write("chain.toml", CHAIN);
    sb.foreman()
        .arg("validate")
        .arg(&file)
        .assert()
        .success()
        .stdout(predicate::str::contains("greet -> shout"));
}

#[test]
fn test_validate_reports_cycle() {
    let sb = Sandbox::new();
    let file = sb.write("loop.toml", CYCLE);
    sb.foreman()
        .arg("validate")
        .arg(&file)
        .assert()
        .failure()
        .stdout(predicate::str::contains("Cycle detected among: a, b"));
}

#[test]
fn test_validate_json_output() {
    let sb = Sandbox::new();
    let file = sb.write("chain.toml", CHAIN);
    let output = sb.foreman().arg("--json").arg("validate").arg(&file).output().unwrap();
    assert!(output.status.success());
    let report = stdout_json(&output.stdout);
    assert_eq!(report["valid"], true);
    assert_eq!(report["order"], serde_json::json!(["greet", "shout"]));
}

#[test]
fn test_validate_missing_file() {
    let sb = Sandbox::new();
    sb.foreman()
        .arg("validate")
        .arg("does-not-exist.toml")
        .assert()
        .failure();
}

// ─────────────────────────────────────────────────────────────────────────────
// run
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_run_prints_execution_record() {
    let sb = Sandbox::new();
    let file = sb.write("chain.toml", CHAIN);
    let output = sb
        .foreman()
        .args(["--json", "run"])
        .arg(&file)
        .args(["--input", r#"{"who": "world"}"#])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let execution = stdout_json(&output.stdout);
    assert_eq!(execution["workflow_id"], "chain");
    assert_eq!(execution["status"], "completed");
    assert_eq!(execution["result"]["steps"]["shout"]["result"]["stdout"], "hello world!");
}

#[test]
fn test_run_failed_workflow_exits_nonzero() {
    let sb = Sandbox::new();
    let file = sb.write("broken.toml", BROKEN);
    sb.foreman()
        .arg("run")
        .arg(&file)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Step 'boom' failed"));
}

#[test]
fn test_run_rejects_bad_input() {
    let sb = Sandbox::new();
    let file = sb.write("chain.toml", CHAIN);
    sb.foreman()
        .arg("run")
        .arg(&file)
        .args(["--input", "not json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--input"));
}

#[test]
fn test_run_auto_approve() {
    let sb = Sandbox::new();
    let file = sb.write("gated.toml", GATED);
    let output = sb
        .foreman()
        .args(["--json", "run", "--auto-approve"])
        .arg(&file)
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let execution = stdout_json(&output.stdout);
    assert_eq!(execution["result"]["steps"]["gate"]["result"]["approved"], true);
    assert_eq!(execution["result"]["steps"]["release"]["result"]["stdout"], "released");
}

// ─────────────────────────────────────────────────────────────────────────────
// generate + dynamic steps through the subprocess sandbox
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_generate_writes_module() {
    let sb = Sandbox::new();
    let file = sb.write("dyn.toml", DYNAMIC);
    let out = sb.path().join("modules");
    sb.foreman()
        .arg("generate")
        .arg(&file)
        .arg("--out")
        .arg(&out)
        .assert()
        .success()
        .stdout(predicate::str::contains("generated dyn/generated"));

    let module_dir = out.join("dyn").join("generated");
    assert!(module_dir.join("module.lua").is_file());
    assert!(module_dir.join("module_test.lua").is_file());
    let manifest: Value =
        serde_json::from_str(&std::fs::read_to_string(module_dir.join("manifest.json")).unwrap()).unwrap();
    assert_eq!(manifest["eligible"], true);
}

#[test]
fn test_generate_without_dynamic_steps() {
    let sb = Sandbox::new();
    let file = sb.write("chain.toml", CHAIN);
    sb.foreman()
        .arg("generate")
        .arg(&file)
        .arg("--out")
        .arg(sb.path().join("modules"))
        .assert()
        .success()
        .stdout(predicate::str::contains("no dynamic steps"));
}

#[test]
fn test_dynamic_step_runs_in_subprocess_sandbox() {
    let sb = Sandbox::new();
    let file = sb.write("dyn.toml", DYNAMIC);
    let modules = sb.path().join("modules");

    let output = sb
        .foreman()
        .args(["--json", "run", "--generate"])
        .arg(&file)
        .arg("--modules")
        .arg(&modules)
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let execution = stdout_json(&output.stdout);
    assert_eq!(execution["status"], "completed");
    assert_eq!(
        execution["result"]["steps"]["generated"]["result"]["double"]["result"]["stdout"],
        "42"
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// approve + serve
// ─────────────────────────────────────────────────────────────────────────────

/// Kills the serving process when the test ends, pass or fail.
struct Serving(Child);

impl Drop for Serving {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn wait_until<T>(limit: Duration, mut poll: impl FnMut() -> Option<T>) -> Option<T> {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if let Some(found) = poll() {
            return Some(found);
        }
        std::thread::sleep(Duration::from_millis(200));
    }
    None
}

fn pending_ids(sb: &Sandbox) -> Vec<String> {
    let output = sb.foreman().args(["--json", "approve", "--list"]).output().unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    stdout_json(&output.stdout)
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["id"].as_str().unwrap().to_string())
        .collect()
}

#[test]
fn test_approve_list_when_nothing_pending() {
    Sandbox::new()
        .foreman()
        .args(["approve", "--list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No pending approvals"));
}

#[test]
fn test_approve_unknown_request_fails() {
    Sandbox::new()
        .foreman()
        .args(["approve", "0b7c0f0e-unknown"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No pending approval '0b7c0f0e-unknown'"));
}

#[test]
fn test_approve_requires_id_or_list() {
    Sandbox::new().foreman().arg("approve").assert().failure();
}

#[test]
fn test_serve_applies_decision_from_approve() {
    let sb = Sandbox::new();
    let drops = sb.path().join("drops");
    std::fs::create_dir_all(&drops).unwrap();
    std::fs::create_dir_all(sb.path().join("workflows")).unwrap();
    let workflow = format!(
        r#"
[workflow]
id = "release"
name = "Release"
status = "active"

[[workflow.triggers]]
type = "file_watch"
path = '{}'
pattern = "*.csv"

[[workflow.nodes]]
id = "gate"
type = "approval"
data = {{ title = "Release?", wait = true }}

[[workflow.nodes]]
id = "publish"
type = "shell"
data = {{ command = "printf released > released.txt" }}

[[workflow.edges]]
source = "gate"
target = "publish"
"#,
        drops.display()
    );
    sb.write("workflows/release.toml", &workflow);

    let child = std::process::Command::new(assert_cmd::cargo::cargo_bin("foreman"))
        .args(["serve", "--workflows", "workflows"])
        .env("FOREMAN_CONFIG_DIR", sb.config_dir.path())
        .env_remove("RUST_LOG")
        .current_dir(sb.path())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    let _serving = Serving(child);

    // Keep dropping files until the watcher is up and a request is raised.
    let mut dropped = 0;
    let ids = wait_until(Duration::from_secs(30), || {
        let ids = pending_ids(&sb);
        if ids.is_empty() {
            dropped += 1;
            std::fs::write(drops.join(format!("batch-{dropped}.csv")), "a,b\n").unwrap();
            return None;
        }
        Some(ids)
    })
    .expect("serve never raised an approval request");

    for id in &ids {
        sb.foreman()
            .args(["approve", id.as_str(), "-m", "ship it"])
            .assert()
            .success()
            .stdout(predicate::str::contains(format!("Approved {id}")));
    }

    let marker = sb.path().join("released.txt");
    let released = wait_until(Duration::from_secs(30), || std::fs::read_to_string(&marker).ok())
        .expect("approved workflow never finished");
    assert_eq!(released, "released");
}

// ─────────────────────────────────────────────────────────────────────────────
// config
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_config_which_without_files() {
    Sandbox::new()
        .foreman()
        .args(["config", "which"])
        .assert()
        .success()
        .stdout(predicate::str::contains("not found"))
        .stdout(predicate::str::contains("foreman config init"));
}

#[test]
fn test_config_init_then_show() {
    let sb = Sandbox::new();
    sb.foreman().args(["config", "init"]).assert().success();
    assert!(sb.config_dir.path().join("config.toml").is_file());

    sb.foreman().args(["config", "init"]).assert().failure();

    sb.foreman()
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[engine]"))
        .stdout(predicate::str::contains("poll_interval_secs = 60"));
}

#[test]
fn test_project_config_overrides_user_config() {
    let sb = Sandbox::new();
    sb.write("foreman.toml", "[engine]\nworkers = 7\n");
    let output = sb.foreman().args(["--json", "config", "show"]).output().unwrap();
    assert!(output.status.success());
    let shown = stdout_json(&output.stdout);
    assert_eq!(shown["config"]["engine"]["workers"], 7);
}
