//! End-to-end tests of the fleetpkg binary

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const CONTROL: &str = r#"[Package]
version: 2

[Product]
type: localboot
id: demo
name: Demo Tool
version: 1.5
priority: 10
productClasses: tools

[ProductProperty]
type: unicode
name: lang
values: de, en
default: de

[Changelog]
demo (1.5-2) stable; urgency=low
  * first packaged release
"#;

/// Temp depot, database and config for one test
struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        for sub in ["depot", "locks", "work", "server", "out"] {
            fs::create_dir_all(root.join(sub)).unwrap();
        }

        let config = format!(
            r#"
[depot]
id = "depot1"
url = "file://{root}/depot"
lock_dir = "{root}/locks"
work_dir = "{root}/work"
server_root = "{root}/server"

[database]
path = "{root}/db.sqlite"

[access_rights]
dir_mode = 0o755
file_mode = 0o644

[build]
compression = "gzip"
output_dir = "{root}/out"

[workers]
threads = 2
"#,
            root = root.display()
        );
        fs::write(root.join("fleetpkg.conf"), config).unwrap();

        Self { dir }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("fleetpkg").unwrap();
        cmd.env("NO_COLOR", "1");
        cmd.env_remove("RUST_LOG");
        cmd.arg("--config").arg(self.path().join("fleetpkg.conf"));
        cmd
    }

    fn source_tree(&self) -> PathBuf {
        let src = self.path().join("src");
        fs::create_dir_all(src.join("OPSI")).unwrap();
        fs::write(src.join("OPSI/control"), CONTROL).unwrap();
        fs::create_dir_all(src.join("CLIENT_DATA/bin")).unwrap();
        fs::write(src.join("CLIENT_DATA/setup.sh"), "echo install\n").unwrap();
        fs::write(src.join("CLIENT_DATA/bin/tool"), "binary").unwrap();
        fs::create_dir_all(src.join("SERVER_DATA/etc")).unwrap();
        fs::write(src.join("SERVER_DATA/etc/demo.conf"), "port=1\n").unwrap();
        src
    }

    fn archive(&self) -> PathBuf {
        self.path().join("out/demo_1.5-2.fpkg")
    }
}

#[test]
fn test_build_and_inspect() {
    let ws = Workspace::new();
    let src = ws.source_tree();

    ws.cmd()
        .arg("build")
        .arg(&src)
        .assert()
        .success()
        .stdout(predicate::str::contains("demo_1.5-2.fpkg"));

    assert!(ws.archive().is_file());

    ws.cmd()
        .arg("info")
        .arg(ws.archive())
        .assert()
        .success()
        .stdout(predicate::str::contains("Demo Tool"))
        .stdout(predicate::str::contains("1.5-2"))
        .stdout(predicate::str::contains("lang"));
}

#[test]
fn test_install_list_verify_uninstall() {
    let ws = Workspace::new();
    let src = ws.source_tree();
    ws.cmd().arg("build").arg(&src).assert().success();

    ws.cmd()
        .args(["install", "--property", "lang=en"])
        .arg(ws.archive())
        .assert()
        .success();

    let client = ws.path().join("depot/demo");
    assert!(client.join("setup.sh").is_file());
    assert!(client.join("demo.files").is_file());
    assert!(ws.path().join("server/etc/demo.conf").is_file());

    ws.cmd()
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("demo"))
        .stdout(predicate::str::contains("1.5-2"));

    ws.cmd()
        .args(["info", "demo"])
        .assert()
        .success()
        .stdout(predicate::str::contains("= [en]"));

    ws.cmd().args(["verify", "demo"]).assert().success();

    fs::write(client.join("bin/tool"), "tampered").unwrap();
    ws.cmd()
        .args(["verify", "demo"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("bin/tool"));

    ws.cmd().args(["uninstall", "demo"]).assert().success();
    assert!(!client.exists());

    ws.cmd()
        .args(["uninstall", "demo"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("not installed"));
}

#[test]
fn test_install_locked_product_fails() {
    let ws = Workspace::new();
    let src = ws.source_tree();
    ws.cmd().arg("build").arg(&src).assert().success();

    // Held by this (live) test process
    fs::write(
        ws.path().join("locks/demo.lock"),
        format!(
            "pid = {}\ntoken = \"x\"\nacquired = \"2024-01-01T00:00:00Z\"\n",
            std::process::id()
        ),
    )
    .unwrap();

    ws.cmd()
        .arg("install")
        .arg(ws.archive())
        .assert()
        .failure()
        .stdout(predicate::str::contains("locked"));

    ws.cmd().args(["unlock", "demo"]).assert().success();
    ws.cmd().arg("install").arg(ws.archive()).assert().success();
}

#[test]
fn test_resolve_plan() {
    let ws = Workspace::new();
    let src = ws.source_tree();
    ws.cmd().arg("build").arg(&src).assert().success();
    ws.cmd().arg("install").arg(ws.archive()).assert().success();

    let input = ws.path().join("desired.json");
    fs::write(
        &input,
        r#"{"host1.example.org": [{"product_id": "demo", "action_request": "setup"}]}"#,
    )
    .unwrap();

    ws.cmd()
        .arg("resolve")
        .arg(&input)
        .arg("--apply")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"action_request\": \"setup\""))
        .stdout(predicate::str::contains("host1.example.org"));
}

#[test]
fn test_build_without_control_fails() {
    let ws = Workspace::new();
    let src = ws.path().join("empty");
    fs::create_dir_all(src.join("OPSI")).unwrap();

    ws.cmd()
        .arg("build")
        .arg(&src)
        .assert()
        .failure()
        .stderr(predicate::str::contains("control"));

    assert_eq!(fs::read_dir(ws.path().join("out")).unwrap().count(), 0);
}
