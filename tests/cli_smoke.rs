use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};

use tempfile::{tempdir, TempDir};

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("models.csv"),
            "provider,model,api\nMeta,llama3.1,ollama\n",
        )
        .unwrap();
        let surveys = dir.path().join("surveys");
        fs::create_dir_all(&surveys).unwrap();
        fs::write(
            surveys.join("acp.json"),
            r#"{"policies": ["Tram", "Road"], "considerations": ["Air", "Cost", "Jobs"]}"#,
        )
        .unwrap();
        fs::write(
            surveys.join("template.json"),
            r#"{"policies": ["P"], "considerations": ["C"]}"#,
        )
        .unwrap();
        Self { dir }
    }

    fn out(&self) -> PathBuf {
        self.dir.path().join("out")
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    fn run(&self, args: &[&str]) -> Output {
        self.command(args).output().unwrap()
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_minipublic"));
        cmd.arg("--output-dir")
            .arg(self.out())
            .arg("--models")
            .arg(self.path("models.csv"))
            .arg("--surveys")
            .arg(self.path("surveys"))
            .args(args)
            // Nothing listens here; any request would fail loudly.
            .env("OLLAMA_BASE_URL", "http://127.0.0.1:9/v1")
            .env_remove("MINIPUBLIC_MIN_ITERATIONS")
            .env_remove("MINIPUBLIC_HTTP_TIMEOUT_SECONDS");
        cmd
    }
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

#[test]
fn reconstruct_then_status() {
    let ws = Workspace::new();

    let output = ws.run(&["reconstruct"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let text = stdout(&output);
    assert!(text.contains("1 entries, 0 done, 1 pending, 0 completions recorded"), "{text}");
    assert!(text.contains("Models with data: none"), "{text}");
    assert!(text.contains("Models done: none"), "{text}");
    assert!(text.contains("APIs without data: ollama"), "{text}");
    assert!(ws.out().join("progress.csv").exists());

    let output = ws.run(&["status"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let text = stdout(&output);
    assert!(text.contains("Meta/llama3.1/acp: 0/100 (100 left)"), "{text}");
    assert!(text.contains("1 of 1 entries pending"), "{text}");
    assert!(!text.contains("template"));
}

#[test]
fn status_without_ledger_fails() {
    let ws = Workspace::new();
    let output = ws.run(&["status"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("run `minipublic reconstruct` first"));
}

#[test]
fn generate_aborts_before_any_request_when_capacity_is_short() {
    let ws = Workspace::new();

    let output = ws.run(&["--min-iterations", "1", "generate", "llama3.1", "5"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("CapacityExceeded"), "{}", stderr(&output));
    assert!(!ws.out().join("request_log.csv").exists());
    assert!(!ws.out().join("Meta").exists());
}

#[test]
fn generate_rejects_unknown_model() {
    let ws = Workspace::new();
    let output = ws.run(&["generate", "gpt-9", "1"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("gpt-9"));
    assert!(!ws.out().join("request_log.csv").exists());
}

#[test]
fn generate_counts_rows_missing_from_the_ledger() {
    let ws = Workspace::new();
    let output = ws.run(&["reconstruct"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));

    // A completion written after the ledger was saved.
    let table = ws.out().join("Meta").join("llama3.1").join("acp");
    fs::create_dir_all(&table).unwrap();
    fs::write(table.join("policies.csv"), "cuid,Tram,Road\nabc,1,2\n").unwrap();

    let output = ws.run(&["--min-iterations", "1", "generate", "llama3.1", "1"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("CapacityExceeded"), "{}", stderr(&output));
    assert!(!ws.out().join("request_log.csv").exists());

    let output = ws.run(&["--min-iterations", "1", "status", "--all"]);
    assert!(stdout(&output).contains("Meta/llama3.1/acp: 1/1 (0 left)"), "{}", stdout(&output));
}

#[test]
fn unparsable_http_timeout_is_rejected() {
    let ws = Workspace::new();
    let output = ws
        .command(&["status"])
        .env("MINIPUBLIC_HTTP_TIMEOUT_SECONDS", "soon")
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(stderr(&output).contains("MINIPUBLIC_HTTP_TIMEOUT_SECONDS"), "{}", stderr(&output));
}
