//! Files that run one job on the target.
//!
//! A job directory holds the job's `manifest.json`, a Python `bootstrap.py`
//! that unpacks the package and calls the function, and a `job.sh` that
//! every scheduler runs. Targets that provision inside the job also get a
//! `setup.sh`.

use std::collections::BTreeMap;
use std::path::Path;

use handlebars::Handlebars;
use serde::Serialize;

use crate::environment::RemoteEnvironmentHandle;
use crate::error::{BuildStep, Result};
use crate::fs::PYTHON_MODULE_NAME;
use crate::job::{ENVIRONMENT_FAILURE_KIND, ERROR_FILE, EXIT_CODE_FILE, JOB_MANIFEST, RESULT_FILE};
use crate::package::{PackageManifest, FILES_DIR, MODULES_DIR};
use crate::session::{quote, quote_all, quote_path};
use crate::target::ExecutionTarget;

pub const BOOTSTRAP_SCRIPT: &str = "bootstrap.py";
pub const JOB_SCRIPT: &str = "job.sh";
pub const SETUP_SCRIPT: &str = "setup.sh";

const BOOTSTRAP_TEMPLATE: &str = include_str!("bootstrap/bootstrap.py.hbs");
const JOB_TEMPLATE: &str = include_str!("bootstrap/job.sh.hbs");
const SETUP_TEMPLATE: &str = include_str!("bootstrap/setup.sh.hbs");

#[derive(Serialize)]
struct BootstrapContext<'a> {
    job: &'a str,
    /// Python string literal.
    archive: String,
    files_dir: &'a str,
    modules_dir: &'a str,
    fs_module: &'a str,
    manifest_file: &'a str,
    result_file: &'a str,
    error_file: &'a str,
}

#[derive(Serialize)]
struct JobContext<'a> {
    job: &'a str,
    job_dir: String,
    setup: bool,
    setup_script: &'a str,
    activate: Option<&'a str>,
    python: String,
    bootstrap_script: &'a str,
    exit_code_file: &'a str,
}

#[derive(Serialize)]
struct SetupContext<'a> {
    env_dir: String,
    python: String,
    venv: String,
    venv_python: String,
    requirements: String,
    lock: String,
    marker: String,
    marker_json: String,
    error_file: &'a str,
    failure_kind: &'a str,
    interpreter_step: String,
    install_step: String,
}

/// Renders job files. Values are shell-quoted before they reach a template.
pub struct Renderer {
    registry: Handlebars<'static>,
}

impl Renderer {
    pub fn new() -> Result<Self> {
        let mut registry = Handlebars::new();
        registry.register_escape_fn(handlebars::no_escape);
        registry.register_template_string(BOOTSTRAP_SCRIPT, BOOTSTRAP_TEMPLATE)?;
        registry.register_template_string(JOB_SCRIPT, JOB_TEMPLATE)?;
        registry.register_template_string(SETUP_SCRIPT, SETUP_TEMPLATE)?;
        Ok(Self { registry })
    }

    /// Contents of every file of the job, keyed by file name.
    pub fn render(
        &self,
        job: &str,
        job_dir: &Path,
        target: &ExecutionTarget,
        env: &RemoteEnvironmentHandle,
        manifest: &PackageManifest,
    ) -> Result<BTreeMap<&'static str, Vec<u8>>> {
        let mut files = BTreeMap::new();
        files.insert(JOB_MANIFEST, manifest.rooted_at(&target.work_dir).to_json()?);

        let bootstrap = BootstrapContext {
            job,
            archive: serde_json::to_string(&env.archive.to_string_lossy())?,
            files_dir: FILES_DIR,
            modules_dir: MODULES_DIR,
            fs_module: PYTHON_MODULE_NAME,
            manifest_file: JOB_MANIFEST,
            result_file: RESULT_FILE,
            error_file: ERROR_FILE,
        };
        files.insert(
            BOOTSTRAP_SCRIPT,
            self.registry.render(BOOTSTRAP_SCRIPT, &bootstrap)?.into_bytes(),
        );

        let script = JobContext {
            job,
            job_dir: quote_path(job_dir),
            setup: env.deferred,
            setup_script: SETUP_SCRIPT,
            activate: env.activate.as_deref(),
            python: quote(&env.python),
            bootstrap_script: BOOTSTRAP_SCRIPT,
            exit_code_file: EXIT_CODE_FILE,
        };
        files.insert(JOB_SCRIPT, self.registry.render(JOB_SCRIPT, &script)?.into_bytes());

        if env.deferred {
            let venv = env.venv_dir();
            let setup = SetupContext {
                env_dir: env.env_dir.to_string_lossy().into_owned(),
                python: quote(&target.python),
                venv: quote_path(&venv),
                venv_python: quote(&env.python),
                requirements: quote_all(&env.installed),
                lock: quote_path(&env.env_dir.with_extension("lock")),
                marker: quote_path(&env.marker()),
                marker_json: quote(&env.marker_json()?),
                error_file: ERROR_FILE,
                failure_kind: ENVIRONMENT_FAILURE_KIND,
                interpreter_step: BuildStep::Interpreter.to_string(),
                install_step: BuildStep::Install.to_string(),
            };
            files.insert(SETUP_SCRIPT, self.registry.render(SETUP_SCRIPT, &setup)?.into_bytes());
        }
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use chrono::Utc;

    use crate::environment::Installer;
    use crate::package::{CallArguments, FORMAT_VERSION};

    fn manifest() -> PackageManifest {
        PackageManifest {
            format_version: FORMAT_VERSION,
            content_id: "abc".to_string(),
            function: "target".to_string(),
            entry_module: "entry.py".to_string(),
            is_async: false,
            members: vec![],
            requirements: vec![],
            fs_bindings: vec![crate::fs::FsFunction::Find],
            arguments: CallArguments::new().arg(3),
            partition: None,
            fs_root: None,
            created_at: Utc::now(),
        }
    }

    fn env(deferred: bool) -> RemoteEnvironmentHandle {
        let env_dir = PathBuf::from("/work/envs/abc");
        RemoteEnvironmentHandle {
            archive: env_dir.join("package.tar.gz"),
            jobs_dir: PathBuf::from("/work/jobs"),
            python: "/work/envs/abc/venv/bin/python".to_string(),
            activate: Some(". /work/envs/abc/venv/bin/activate".to_string()),
            installer: Installer::Pip,
            installed: vec!["numpy>=1.24".to_string()],
            content_id: "abc".to_string(),
            created_at: Utc::now(),
            reused: false,
            deferred,
            env_dir,
        }
    }

    #[test]
    fn test_render_job_files() {
        let renderer = Renderer::new().unwrap();
        let target = ExecutionTarget::local("/work");
        let job_dir = PathBuf::from("/work/jobs/target-1");
        let files = renderer
            .render("target-1", &job_dir, &target, &env(false), &manifest())
            .unwrap();
        let names: Vec<&str> = files.keys().copied().collect();
        assert_eq!(names, vec![BOOTSTRAP_SCRIPT, JOB_SCRIPT, JOB_MANIFEST]);

        let bootstrap = String::from_utf8(files[BOOTSTRAP_SCRIPT].clone()).unwrap();
        assert!(bootstrap.contains(r#"ARCHIVE = "/work/envs/abc/package.tar.gz""#));
        assert!(bootstrap.contains("import clusterfn_fs"));
        assert!(bootstrap.contains(r#"write_artifact("result.json""#));

        let script = String::from_utf8(files[JOB_SCRIPT].clone()).unwrap();
        assert!(script.contains("cd /work/jobs/target-1 || exit 1"));
        assert!(script.contains(". /work/envs/abc/venv/bin/activate"));
        assert!(script.contains("/work/envs/abc/venv/bin/python ./bootstrap.py"));
        assert!(!script.contains(SETUP_SCRIPT));

        let manifest: PackageManifest = serde_json::from_slice(&files[JOB_MANIFEST]).unwrap();
        assert_eq!(manifest.arguments.args, vec![serde_json::json!(3)]);
        assert_eq!(manifest.fs_root, Some(PathBuf::from("/work")));
        assert!(bootstrap.contains(r#"manifest.get("fs_root") or JOB_DIR"#));
    }

    #[test]
    fn test_deferred_environment_gets_setup_script() {
        let renderer = Renderer::new().unwrap();
        let target = ExecutionTarget::local("/work");
        let files = renderer
            .render("target-1", Path::new("/work/jobs/target-1"), &target, &env(true), &manifest())
            .unwrap();
        let script = String::from_utf8(files[JOB_SCRIPT].clone()).unwrap();
        assert!(script.contains("sh ./setup.sh"));
        let setup = String::from_utf8(files[SETUP_SCRIPT].clone()).unwrap();
        assert!(setup.contains("python3 -m venv /work/envs/abc/venv"));
        assert!(setup.contains("pip install --quiet --disable-pip-version-check 'numpy>=1.24'"));
        assert!(setup.contains("\"kind\": \"EnvironmentBuildFailed\""));
        assert!(setup.contains("> /work/envs/abc/.clusterfn-ready"));
    }
}
