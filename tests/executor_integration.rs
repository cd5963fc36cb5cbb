//! Integration tests for the execution engine.
//!
//! Uses a scripted mock driver behind the `ContainerDriver` trait so no
//! Docker daemon is needed.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crucible::catalog::Catalog;
use crucible::docker::{
    ActiveContainer, CapturedLogs, ComposeSpec, ContainerDriver, ContainerLogs, OneshotSpec,
    RunOutput,
};
use crucible::error::{DriverError, SubmitError};
use crucible::executor::{
    AdmissionController, Execution, ExecutionRequest, ExecutionState, ExecutionStore, Executor,
    WorkspacePaths, INFRA_FAILURE_EXIT_CODE,
};

// ---------------------------------------------------------------------------
// Mock driver
// ---------------------------------------------------------------------------

/// What the mock does when asked to run a container with a given image.
#[derive(Debug, Clone)]
enum MockOutcome {
    Succeed { stdout: String },
    Exit { code: i64, stderr: String },
    /// Never returns; the executor's deadline has to fire.
    Hang,
    /// Driver-level failure (daemon error, bad spec, ...).
    Fail { reason: String },
}

#[derive(Default)]
struct MockDriver {
    /// Outcome per image for one-shot runs.
    outcomes: Mutex<HashMap<String, MockOutcome>>,
    /// Outcome for compose runs.
    compose_outcome: Mutex<Option<MockOutcome>>,
    /// Images that can be neither found nor pulled.
    unavailable_images: Mutex<HashSet<String>>,
    /// Log tail handed back when a run is terminated or torn down.
    recovered_tail: Mutex<CapturedLogs>,
    oneshot_calls: Mutex<Vec<OneshotSpec>>,
    compose_calls: Mutex<Vec<ComposeSpec>>,
    terminated: Mutex<Vec<String>>,
    compose_downs: Mutex<Vec<PathBuf>>,
}

impl MockDriver {
    fn on_image(&self, image: &str, outcome: MockOutcome) {
        self.outcomes
            .lock()
            .unwrap()
            .insert(image.to_string(), outcome);
    }

    fn on_compose(&self, outcome: MockOutcome) {
        *self.compose_outcome.lock().unwrap() = Some(outcome);
    }

    fn mark_unavailable(&self, image: &str) {
        self.unavailable_images
            .lock()
            .unwrap()
            .insert(image.to_string());
    }

    fn set_recovered_tail(&self, stdout: &str, stderr: &str) {
        *self.recovered_tail.lock().unwrap() = CapturedLogs {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        };
    }

    fn oneshot_calls(&self) -> Vec<OneshotSpec> {
        self.oneshot_calls.lock().unwrap().clone()
    }

    fn compose_calls(&self) -> Vec<ComposeSpec> {
        self.compose_calls.lock().unwrap().clone()
    }

    fn terminated(&self) -> Vec<String> {
        self.terminated.lock().unwrap().clone()
    }

    fn compose_downs(&self) -> Vec<PathBuf> {
        self.compose_downs.lock().unwrap().clone()
    }

    async fn play(outcome: MockOutcome) -> Result<RunOutput, DriverError> {
        match outcome {
            MockOutcome::Succeed { stdout } => Ok(RunOutput {
                exit_code: 0,
                stdout,
                stderr: String::new(),
            }),
            MockOutcome::Exit { code, stderr } => Ok(RunOutput {
                exit_code: code,
                stdout: String::new(),
                stderr,
            }),
            MockOutcome::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                unreachable!("hanging run was not cancelled")
            }
            MockOutcome::Fail { reason } => Err(DriverError::Internal(reason)),
        }
    }
}

#[async_trait]
impl ContainerDriver for MockDriver {
    async fn ensure_image(&self, image: &str) -> Result<(), DriverError> {
        if self.unavailable_images.lock().unwrap().contains(image) {
            return Err(DriverError::ImageUnavailable {
                image: image.to_string(),
                reason: "not found locally and pull failed".to_string(),
            });
        }
        Ok(())
    }

    async fn run_oneshot(&self, spec: &OneshotSpec) -> Result<RunOutput, DriverError> {
        self.oneshot_calls.lock().unwrap().push(spec.clone());
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .get(&spec.image)
            .cloned()
            .unwrap_or(MockOutcome::Succeed {
                stdout: String::new(),
            });
        Self::play(outcome).await
    }

    async fn terminate_oneshot(&self, container_name: &str) -> CapturedLogs {
        self.terminated
            .lock()
            .unwrap()
            .push(container_name.to_string());
        self.recovered_tail.lock().unwrap().clone()
    }

    async fn run_compose(&self, spec: &ComposeSpec) -> Result<RunOutput, DriverError> {
        self.compose_calls.lock().unwrap().push(spec.clone());
        let outcome = self
            .compose_outcome
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(MockOutcome::Succeed {
                stdout: String::new(),
            });
        let result = Self::play(outcome).await;
        // the real driver tears down unconditionally after `up` returns
        self.compose_downs
            .lock()
            .unwrap()
            .push(spec.compose_file.clone());
        result
    }

    async fn compose_down(&self, compose_file: &Path) -> CapturedLogs {
        self.compose_downs
            .lock()
            .unwrap()
            .push(compose_file.to_path_buf());
        self.recovered_tail.lock().unwrap().clone()
    }

    async fn list_active(&self) -> Result<Vec<ActiveContainer>, DriverError> {
        Ok(vec![])
    }

    async fn logs_for_image(&self, _image: &str) -> Result<Vec<ContainerLogs>, DriverError> {
        Ok(vec![])
    }
}

// ---------------------------------------------------------------------------
// Test bed
// ---------------------------------------------------------------------------

struct TestBed {
    _dir: tempfile::TempDir,
    root: PathBuf,
    catalog: Arc<Catalog>,
    driver: Arc<MockDriver>,
    store: Arc<ExecutionStore>,
    admission: Arc<AdmissionController>,
    executor: Executor,
}

impl TestBed {
    /// Build a catalog from YAML and program directories from
    /// `(relative path, file name)` pairs.
    fn new(catalog_yaml: &str, files: &[(&str, &str)]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();

        for (rel_dir, file) in files {
            let program_dir = root.join(rel_dir);
            std::fs::create_dir_all(&program_dir).unwrap();
            std::fs::write(program_dir.join(file), "").unwrap();
        }

        let catalog_path = root.join("config.yaml");
        std::fs::write(&catalog_path, catalog_yaml).unwrap();
        let catalog = Arc::new(Catalog::load(&catalog_path).unwrap());

        let driver = Arc::new(MockDriver::default());
        let store = Arc::new(ExecutionStore::default());
        let max_concurrent = catalog.snapshot().settings.max_concurrent_executions;
        let admission = Arc::new(AdmissionController::new(max_concurrent));
        let paths = WorkspacePaths {
            base_dir: root.clone(),
            host_root: root.clone(),
            actions_dir: root.join("actions"),
            host_actions_dir: root.join("actions"),
        };
        let executor = Executor::new(
            Arc::clone(&catalog),
            Arc::clone(&driver) as Arc<dyn ContainerDriver>,
            Arc::clone(&store),
            Arc::clone(&admission),
            paths,
        );

        Self {
            _dir: dir,
            root,
            catalog,
            driver,
            store,
            admission,
            executor,
        }
    }

    async fn submit(&self, program_id: &str) -> Result<Uuid, SubmitError> {
        self.submit_with(program_id, HashMap::new()).await
    }

    async fn submit_with(
        &self,
        program_id: &str,
        parameters: HashMap<String, String>,
    ) -> Result<Uuid, SubmitError> {
        self.executor
            .submit(ExecutionRequest {
                program_id: program_id.to_string(),
                parameters,
            })
            .await
    }

    async fn wait_terminal(&self, execution_id: Uuid) -> Execution {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(execution) = self.store.get(execution_id) {
                if execution.status.is_terminal() {
                    return execution;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "execution {execution_id} did not reach a terminal state"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn wait_slots_free(&self) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.admission.in_flight() > 0 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "admission slots were not released"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

const BASIC_CATALOG: &str = r#"
settings:
  docker_image: base:1
  timeout_seconds: 1
  max_concurrent_executions: 2
  memory_limit: 512m
  cpu_limit: "0.5"
scripts:
  s1:
    path: progs/s1
    main_file: main.py
    docker_image: img-s1:1
  s2:
    path: progs/s2
    main_file: main.py
    docker_image: img-s2:1
  s3:
    path: progs/s3
    main_file: main.py
    docker_image: img-s3:1
  off:
    path: progs/off
    enabled: false
"#;

fn basic_bed() -> TestBed {
    TestBed::new(
        BASIC_CATALOG,
        &[
            ("progs/s1", "main.py"),
            ("progs/s2", "main.py"),
            ("progs/s3", "main.py"),
            ("progs/off", "main.py"),
        ],
    )
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn happy_path_completes_with_captured_output() {
    let bed = basic_bed();
    bed.driver.on_image(
        "img-s1:1",
        MockOutcome::Succeed {
            stdout: "hello\\nworld\n".to_string(),
        },
    );

    let id = bed.submit("s1").await.unwrap();
    let execution = bed.wait_terminal(id).await;

    assert_eq!(execution.status, ExecutionState::Completed);
    assert_eq!(execution.exit_code, Some(0));
    assert_eq!(execution.output, "hello\nworld");
    assert!(execution.end_time.is_some());
    assert!(execution.error.is_empty());

    let calls = bed.driver.oneshot_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].image, "img-s1:1");
    assert_eq!(calls[0].container_name, format!("crucible-exec-{id}"));
    assert_eq!(calls[0].program_dir, bed.root.join("progs/s1"));
    assert_eq!(calls[0].memory_bytes, Some(512 * 1024 * 1024));
    assert_eq!(calls[0].nano_cpus, Some(500_000_000));

    bed.wait_slots_free().await;
}

#[tokio::test]
async fn nonzero_exit_records_failed_with_program_code() {
    let bed = basic_bed();
    bed.driver.on_image(
        "img-s1:1",
        MockOutcome::Exit {
            code: 3,
            stderr: "boom".to_string(),
        },
    );

    let id = bed.submit("s1").await.unwrap();
    let execution = bed.wait_terminal(id).await;

    assert_eq!(execution.status, ExecutionState::Failed);
    assert_eq!(execution.exit_code, Some(3));
    assert_eq!(execution.error, "boom");
}

#[tokio::test]
async fn disabled_program_is_rejected_without_a_record() {
    let bed = basic_bed();

    let err = bed.submit("off").await.unwrap_err();
    assert!(matches!(err, SubmitError::ProgramDisabled(id) if id == "off"));

    assert!(bed.store.is_empty());
    assert_eq!(bed.admission.in_flight(), 0);
    assert!(bed.driver.oneshot_calls().is_empty());
}

#[tokio::test]
async fn unknown_program_is_not_found() {
    let bed = basic_bed();
    let err = bed.submit("ghost").await.unwrap_err();
    assert!(matches!(err, SubmitError::ProgramNotFound(_)));
    assert!(bed.store.is_empty());
}

#[tokio::test]
async fn absent_main_file_falls_back_in_order() {
    let bed = TestBed::new(
        r#"
settings:
  docker_image: base:1
scripts:
  s1:
    path: progs/s1
    main_file: main.py
"#,
        &[("progs/s1", "run.py")],
    );

    let id = bed.submit("s1").await.unwrap();
    let execution = bed.wait_terminal(id).await;
    assert_eq!(execution.status, ExecutionState::Completed);

    let calls = bed.driver.oneshot_calls();
    let script = &calls[0].command[2];
    assert!(script.contains("python run.py"), "script was: {script}");
}

#[tokio::test]
async fn no_main_file_at_all_is_rejected() {
    let bed = TestBed::new(
        r#"
settings:
  docker_image: base:1
scripts:
  s1:
    path: progs/s1
    main_file: main.py
"#,
        &[("progs/s1", "README.md")],
    );

    let err = bed.submit("s1").await.unwrap_err();
    assert!(matches!(err, SubmitError::MainFileMissing { .. }));
    assert!(bed.store.is_empty());
    assert_eq!(bed.admission.in_flight(), 0);
}

#[tokio::test]
async fn unavailable_image_is_rejected_synchronously() {
    let bed = basic_bed();
    bed.driver.mark_unavailable("img-s1:1");

    let err = bed.submit("s1").await.unwrap_err();
    assert!(matches!(err, SubmitError::ImageUnavailable { image, .. } if image == "img-s1:1"));
    assert!(bed.store.is_empty());
    assert_eq!(bed.admission.in_flight(), 0);
}

#[tokio::test]
async fn deadline_terminates_the_container_and_releases_the_slot() {
    let bed = basic_bed();
    bed.driver.on_image("img-s1:1", MockOutcome::Hang);
    bed.driver
        .set_recovered_tail("made it this far\n", "still waiting on upstream\n");

    let id = bed.submit("s1").await.unwrap();
    let execution = bed.wait_terminal(id).await;

    assert_eq!(execution.status, ExecutionState::Timeout);
    assert!(execution.error.contains("time limit"), "{}", execution.error);
    assert_eq!(execution.exit_code, None);

    // output accumulated before termination is preserved on the record
    assert_eq!(execution.output, "made it this far");
    assert!(
        execution.error.contains("still waiting on upstream"),
        "{}",
        execution.error
    );

    let terminated = bed.driver.terminated();
    assert_eq!(terminated, vec![format!("crucible-exec-{id}")]);

    bed.wait_slots_free().await;

    // the freed slot is usable again
    bed.driver.on_image(
        "img-s2:1",
        MockOutcome::Succeed {
            stdout: String::new(),
        },
    );
    let id2 = bed.submit("s2").await.unwrap();
    let execution2 = bed.wait_terminal(id2).await;
    assert_eq!(execution2.status, ExecutionState::Completed);
}

#[tokio::test]
async fn overload_rejects_the_excess_submission() {
    let bed = basic_bed();
    for image in ["img-s1:1", "img-s2:1"] {
        bed.driver.on_image(image, MockOutcome::Hang);
    }

    let _a = bed.submit("s1").await.unwrap();
    let _b = bed.submit("s2").await.unwrap();

    let err = bed.submit("s3").await.unwrap_err();
    assert!(matches!(
        err,
        SubmitError::Overloaded {
            current: 2,
            limit: 2
        }
    ));

    // only the two admitted executions have records
    assert_eq!(bed.store.len(), 2);

    // both hit their 1s deadline, after which capacity is back (P3)
    bed.wait_slots_free().await;
    let id3 = bed.submit("s3").await.unwrap();
    bed.wait_terminal(id3).await;
}

#[tokio::test]
async fn parameters_use_separate_channels() {
    let bed = TestBed::new(
        r#"
settings:
  docker_image: base:1
scripts:
  s1:
    path: progs/s1
    main_file: main.py
    parameters: "--flag"
"#,
        &[("progs/s1", "main.py")],
    );

    let mut params = HashMap::new();
    params.insert("foo".to_string(), "bar".to_string());
    let id = bed.submit_with("s1", params).await.unwrap();
    bed.wait_terminal(id).await;

    let calls = bed.driver.oneshot_calls();
    let spec = &calls[0];

    // request parameters: environment only
    assert!(spec.env.contains(&"PARAM_FOO=bar".to_string()));
    let script = &spec.command[2];
    assert!(!script.contains("PARAM_FOO"));

    // static catalog parameters: argv only
    assert!(script.contains("python main.py --flag"), "{script}");
    assert!(!spec.env.iter().any(|e| e.contains("--flag")));
}

#[tokio::test]
async fn driver_failure_records_the_infra_sentinel() {
    let bed = basic_bed();
    bed.driver.on_image(
        "img-s1:1",
        MockOutcome::Fail {
            reason: "daemon went away".to_string(),
        },
    );

    let id = bed.submit("s1").await.unwrap();
    let execution = bed.wait_terminal(id).await;

    assert_eq!(execution.status, ExecutionState::Failed);
    assert_eq!(execution.exit_code, Some(INFRA_FAILURE_EXIT_CODE));
    assert!(execution.error.contains("daemon went away"));

    bed.wait_slots_free().await;
}

#[tokio::test]
async fn compose_mode_runs_up_and_always_tears_down() {
    let bed = TestBed::new(
        r#"
settings:
  docker_image: base:1
bots:
  stack:
    path: bots/stack
    path_docker_compose_run: docker-compose.yml
"#,
        &[("bots/stack", "docker-compose.yml")],
    );

    let id = bed.submit("stack").await.unwrap();
    let execution = bed.wait_terminal(id).await;
    assert_eq!(execution.status, ExecutionState::Completed);

    let calls = bed.driver.compose_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(
        calls[0].compose_file,
        bed.root.join("bots/stack/docker-compose.yml")
    );
    let env: HashMap<_, _> = calls[0].env.iter().cloned().collect();
    assert_eq!(env.get("PROGRAM_ID").map(String::as_str), Some("stack"));
    assert_eq!(env.get("EXECUTION_ID"), Some(&id.to_string()));

    // no one-shot machinery involved
    assert!(bed.driver.oneshot_calls().is_empty());
    assert_eq!(bed.driver.compose_downs().len(), 1);
}

#[tokio::test]
async fn compose_deadline_still_tears_the_services_down() {
    let bed = TestBed::new(
        r#"
settings:
  docker_image: base:1
  timeout_seconds: 1
bots:
  stack:
    path: bots/stack
    path_docker_compose_run: docker-compose.yml
"#,
        &[("bots/stack", "docker-compose.yml")],
    );
    bed.driver.on_compose(MockOutcome::Hang);
    bed.driver.set_recovered_tail("service-a | booted\n", "");

    let id = bed.submit("stack").await.unwrap();
    let execution = bed.wait_terminal(id).await;

    assert_eq!(execution.status, ExecutionState::Timeout);
    assert_eq!(execution.output, "service-a | booted");
    let downs = bed.driver.compose_downs();
    assert_eq!(downs, vec![bed.root.join("bots/stack/docker-compose.yml")]);

    bed.wait_slots_free().await;
}

#[tokio::test]
async fn missing_compose_file_is_rejected() {
    let bed = TestBed::new(
        r#"
settings:
  docker_image: base:1
bots:
  stack:
    path: bots/stack
    path_docker_compose_run: docker-compose.yml
"#,
        &[("bots/stack", "notes.txt")],
    );

    let err = bed.submit("stack").await.unwrap_err();
    assert!(matches!(err, SubmitError::ComposeFileMissing { .. }));
    assert!(bed.store.is_empty());
}

#[tokio::test]
async fn catalog_reload_affects_later_submissions_only() {
    let bed = basic_bed();
    bed.driver.on_image("img-s1:1", MockOutcome::Hang);

    // resolution for this execution is already done
    let id = bed.submit("s1").await.unwrap();

    // disable s1 on disk and reload
    let rewritten = BASIC_CATALOG.replace(
        "  s1:\n    path: progs/s1\n",
        "  s1:\n    path: progs/s1\n    enabled: false\n",
    );
    std::fs::write(bed.root.join("config.yaml"), rewritten).unwrap();
    bed.catalog.reload().unwrap();

    // new submissions see the reloaded catalog
    let err = bed.submit("s1").await.unwrap_err();
    assert!(matches!(err, SubmitError::ProgramDisabled(_)));

    // the in-flight execution still runs to its own terminal state
    let execution = bed.wait_terminal(id).await;
    assert_eq!(execution.status, ExecutionState::Timeout);
}

#[tokio::test]
async fn hooks_mount_and_wrap_when_present() {
    let bed = TestBed::new(
        r#"
settings:
  docker_image: base:1
scripts:
  s1:
    path: progs/s1
"#,
        &[("progs/s1", "main.py"), ("actions", "act_before.py")],
    );

    let id = bed.submit("s1").await.unwrap();
    bed.wait_terminal(id).await;

    let calls = bed.driver.oneshot_calls();
    let spec = &calls[0];
    assert_eq!(spec.actions_dir, Some(bed.root.join("actions")));
    let script = &spec.command[2];
    assert!(script.contains("/actions/act_before.py"), "{script}");
    assert!(!script.contains("act_after"), "{script}");
}

#[tokio::test]
async fn no_hooks_means_no_actions_mount() {
    let bed = basic_bed();
    let id = bed.submit("s1").await.unwrap();
    bed.wait_terminal(id).await;

    let calls = bed.driver.oneshot_calls();
    assert_eq!(calls[0].actions_dir, None);
}
