//! The accessor a remote function sees must answer like the Rust one.

use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};

use clusterfn::fs::{FsFunction, PYTHON_MODULE_NAME, PYTHON_MODULE_SOURCE};
use clusterfn::target::EnvironmentStrategy;
use clusterfn::{analyze, package, CallArguments, ExecutionTarget, FileSystem, FunctionRef};

fn fixture() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    std::fs::create_dir_all(root.join("data/2024")).unwrap();
    std::fs::write(root.join("data/jan.csv"), "a,b\n1,2\n").unwrap();
    std::fs::write(root.join("data/feb.csv"), "a,b\n").unwrap();
    std::fs::write(root.join("data/2024/mar.csv"), "a\n").unwrap();
    std::fs::write(root.join("data/readme.md"), "# data").unwrap();
    dir
}

fn has_python() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Calls the Python accessor rooted at `root` and decodes its JSON answer.
fn python(root: &Path, call: &str) -> Value {
    let module_dir = tempfile::tempdir().unwrap();
    std::fs::write(
        module_dir.path().join(format!("{}.py", PYTHON_MODULE_NAME)),
        PYTHON_MODULE_SOURCE,
    )
    .unwrap();
    let script = format!(
        "import json, {m}\nprint(json.dumps({m}.Accessor({root:?}).{call}))",
        m = PYTHON_MODULE_NAME,
        root = root.to_string_lossy(),
        call = call
    );
    let output = std::process::Command::new("python3")
        .arg("-c")
        .arg(script)
        .env("PYTHONPATH", module_dir.path())
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).unwrap()
}

#[tokio::test]
async fn test_python_accessor_agrees_with_rust() {
    if !has_python() {
        eprintln!("python3 not found, skipping");
        return;
    }
    let dir = fixture();
    let root = dir.path();
    let fs = FileSystem::new(Arc::new(ExecutionTarget::local(root)), None).unwrap();

    let found = fs.find("*.csv", "data/").await.unwrap();
    assert_eq!(json!(found), python(root, "find('*.csv', 'data/')"));
    assert_eq!(found.len(), 3);

    let listed = fs.list("data").await.unwrap();
    assert_eq!(json!(listed), python(root, "list('data')"));

    let globbed = fs.glob("**/*.csv", "data").await.unwrap();
    assert_eq!(json!(globbed), python(root, "glob('**/*.csv', 'data')"));

    let count = fs.count_matching("data", "*.csv").await.unwrap();
    assert_eq!(json!(count), python(root, "countMatching('data', '*.csv')"));

    let usage = fs.disk_usage("data").await.unwrap();
    assert_eq!(json!(usage), python(root, "diskUsage('data')"));

    let stat = fs.stat("data/jan.csv").await.unwrap();
    assert_eq!(json!(stat), python(root, "stat('data/jan.csv')"));

    assert_eq!(
        json!(fs.is_directory("data/2024").await.unwrap()),
        python(root, "isDirectory('data/2024')")
    );
    assert_eq!(
        json!(fs.exists("data/missing.csv").await.unwrap()),
        python(root, "exists('data/missing.csv')")
    );
}

#[tokio::test]
async fn test_symlinked_root_usage_agrees_with_python() {
    if !has_python() {
        eprintln!("python3 not found, skipping");
        return;
    }
    let dir = fixture();
    let root = dir.path();
    std::os::unix::fs::symlink(root.join("data"), root.join("alias")).unwrap();
    let fs = FileSystem::new(Arc::new(ExecutionTarget::local(root)), None).unwrap();

    let usage = fs.disk_usage("alias").await.unwrap();
    assert_eq!(usage.file_count, 0);
    assert_eq!(json!(usage), python(root, "diskUsage('alias')"));
}

#[test]
fn test_accessor_calls_are_bound_in_the_package() {
    let src = tempfile::tempdir().unwrap();
    let file = src.path().join("report.py");
    std::fs::write(
        &file,
        "def report(folder):\n    files = find(\"*.csv\", folder)\n    return {\"count\": len(files), \"first\": list(files)[:1]}\n",
    )
    .unwrap();
    let graph = analyze(&FunctionRef::new(&file, "report")).unwrap();
    let target = ExecutionTarget::local(src.path()).with_environment(EnvironmentStrategy::System);
    let package = package::build(&graph, &target, CallArguments::new().arg("data/")).unwrap();

    let bindings = &package.manifest.fs_bindings;
    assert_eq!(bindings, &vec![FsFunction::Find]);
    let members = package.members().unwrap();
    assert!(members
        .keys()
        .any(|name| name.ends_with(&format!("{}.py", PYTHON_MODULE_NAME))));
    assert!(package.manifest.requirements.is_empty());
}
