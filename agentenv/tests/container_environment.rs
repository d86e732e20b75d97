//! Container-mode environments against the scripted in-memory runtime.

use std::fs;
use std::sync::Arc;

use agentenv::cancel::CancelToken;
use agentenv::environment::backend::CommandSpec;
use agentenv::environment::config::{EnvironmentConfig, ServiceConfig};
use agentenv::environment::registry::EnvironmentRegistry;
use agentenv::environment::state::SnapshotRef;
use agentenv::environment::{CreateRequest, Environment};
use agentenv::error::{BuildPhase, EnvError, ExecutionMode};
use agentenv::runtime::{SnapshotId, SourceTree};
use agentenv::test_support::{ScriptedRuntime, ServiceBehavior, fast_settings, host_workdir};

fn container_config() -> EnvironmentConfig {
    EnvironmentConfig {
        base_image: "alpine:3".to_string(),
        workdir: "/src".to_string(),
        ..EnvironmentConfig::default()
    }
}

fn db_service() -> ServiceConfig {
    ServiceConfig {
        name: "db".to_string(),
        image: "postgres:16".to_string(),
        command: "postgres".to_string(),
        exposed_ports: vec![5432],
        ..ServiceConfig::default()
    }
}

fn setup() -> (Arc<ScriptedRuntime>, EnvironmentRegistry) {
    let runtime = Arc::new(ScriptedRuntime::new());
    let registry = EnvironmentRegistry::with_runtime(fast_settings(), runtime.clone());
    (runtime, registry)
}

fn create(registry: &EnvironmentRegistry, config: EnvironmentConfig) -> Arc<Environment> {
    registry
        .create(CreateRequest::new("container test", config), &CancelToken::new())
        .expect("create environment")
}

fn snapshot_id(env: &Environment) -> SnapshotId {
    env.snapshot()
        .as_container()
        .cloned()
        .expect("container snapshot")
}

fn position(calls: &[String], prefix: &str) -> usize {
    calls
        .iter()
        .position(|c| c.starts_with(prefix))
        .unwrap_or_else(|| panic!("no call starting with {prefix:?} in {calls:#?}"))
}

#[test]
fn build_applies_steps_in_order() {
    let (runtime, registry) = setup();
    let config = EnvironmentConfig {
        env: vec!["RUST_LOG=debug".to_string()],
        setup_commands: vec!["echo base > setup.txt".to_string()],
        install_commands: vec!["touch installed".to_string()],
        services: vec![db_service()],
        ..container_config()
    };

    let env = create(&registry, config);

    assert_eq!(env.mode(), ExecutionMode::Container);
    let calls = runtime.calls();
    let order = [
        "from_image alpine:3",
        "with_workdir /src",
        "with_env RUST_LOG",
        "exec sh -c echo base > setup.txt",
        "from_image postgres:16",
        "with_exposed_port 5432",
        "start_service sh -c postgres",
        "with_service_binding db",
        "exec sh -c touch installed",
        "sync ",
    ];
    let positions: Vec<usize> = order.iter().map(|p| position(&calls, p)).collect();
    assert!(
        positions.windows(2).all(|w| w[0] < w[1]),
        "unexpected call order: {calls:#?}"
    );

    let snapshot = snapshot_id(&env);
    assert_eq!(runtime.file(&snapshot, "setup.txt").as_deref(), Some("base\n"));
    assert_eq!(runtime.file(&snapshot, "installed").as_deref(), Some(""));
    assert_eq!(env.service_names(), vec!["db".to_string()]);
    assert_eq!(runtime.running_services().len(), 1);
    let notes = env.notes().pop();
    assert!(notes.contains("service db: postgres &"));
}

#[test]
fn source_tree_lands_in_workdir() {
    let (runtime, registry) = setup();
    let source = host_workdir();
    fs::create_dir(source.path().join("src")).expect("mkdir");
    fs::write(source.path().join("src/main.rs"), "fn main() {}\n").expect("write");

    let request = CreateRequest::new("with source", container_config())
        .with_source(SourceTree::HostDir(source.path().to_path_buf()));
    let env = registry
        .create(request, &CancelToken::new())
        .expect("create");

    assert_eq!(
        env.file_read("src/main.rs", true, 0, 0).expect("read"),
        "fn main() {}\n"
    );
    assert_eq!(env.file_list(".").expect("list"), vec!["src/".to_string()]);
    assert!(runtime.calls().iter().any(|c| c == "with_directory ."));
}

#[test]
fn failing_install_reports_build_error_with_notes() {
    let (runtime, registry) = setup();
    let config = EnvironmentConfig {
        install_commands: vec!["echo nope >&2; exit 2".to_string()],
        services: vec![db_service()],
        ..container_config()
    };
    let request = CreateRequest::new("broken", config);
    let notes = Arc::clone(&request.notes);

    let err = registry
        .create(request, &CancelToken::new())
        .err()
        .expect("build fails");

    match err {
        EnvError::Build {
            phase,
            exit_code,
            stderr,
            ..
        } => {
            assert_eq!(phase, BuildPhase::Install);
            assert_eq!(exit_code, 2);
            assert_eq!(stderr, "nope\n");
        }
        other => panic!("expected build error, got {other:?}"),
    }
    assert!(notes.pop().contains("exit 2"));
    assert!(runtime.running_services().is_empty());
    assert!(registry.is_empty());
}

#[test]
fn configured_service_exiting_at_startup_fails_the_build() {
    let (runtime, registry) = setup();
    runtime.set_service_behavior(ServiceBehavior::Exit {
        exit_code: 3,
        stderr: "bad config".to_string(),
    });
    let config = EnvironmentConfig {
        services: vec![db_service()],
        ..container_config()
    };

    let err = registry
        .create(CreateRequest::new("svc", config), &CancelToken::new())
        .err()
        .expect("build fails");
    assert!(matches!(
        err,
        EnvError::Build {
            phase: BuildPhase::Service,
            exit_code: 3,
            ..
        }
    ));
}

#[test]
fn failed_command_keeps_its_side_effects() {
    let (runtime, registry) = setup();
    let env = create(&registry, container_config());
    let before = snapshot_id(&env);

    let out = env
        .run(
            &CommandSpec::new("echo hi > out.txt; echo oops >&2; exit 2"),
            &CancelToken::new(),
        )
        .expect("non-zero exit is a result");

    assert_eq!(out, "stderr: oops\n");
    let after = snapshot_id(&env);
    assert_ne!(before, after);
    assert_eq!(runtime.file(&after, "out.txt").as_deref(), Some("hi\n"));
    assert_eq!(runtime.file(&before, "out.txt"), None);
    assert_eq!(
        env.notes().entries().pop().expect("note").exit_code(),
        Some(2)
    );
}

#[test]
fn runtime_failure_is_infra_and_keeps_snapshot() {
    let (runtime, registry) = setup();
    let env = create(&registry, container_config());
    let before = env.snapshot();
    runtime.fail_commands_containing("flaky");

    let err = env
        .run(&CommandSpec::new("flaky --check"), &CancelToken::new())
        .expect_err("engine failure");

    assert!(matches!(err, EnvError::Infra(_)));
    assert_eq!(env.snapshot(), before);
}

#[test]
fn background_service_exposes_endpoints() {
    let (runtime, registry) = setup();
    let env = create(&registry, container_config());

    let endpoints = env
        .run_background(&CommandSpec::new("serve"), &[8080], &CancelToken::new())
        .expect("background");

    let endpoint = &endpoints[&8080];
    assert_eq!(endpoint.host_external, "tcp://127.0.0.1:48080");
    assert!(endpoint.environment_internal.starts_with("tcp://svc-"));
    assert!(endpoint.environment_internal.ends_with(":8080"));
    assert_eq!(env.service_names(), vec!["serve".to_string()]);
    let calls = runtime.calls();
    assert!(calls.iter().any(|c| c == "with_exposed_port 8080"));
    assert!(calls.iter().any(|c| c == "with_env PORT"));
    assert!(env.notes().pop().contains("serve &"));

    registry.remove(env.id());
    assert!(runtime.running_services().is_empty());
}

#[test]
fn hanging_service_times_out_with_a_note() {
    let (runtime, registry) = setup();
    let env = create(&registry, container_config());
    runtime.set_service_behavior(ServiceBehavior::Hang);

    let err = env
        .run_background(&CommandSpec::new("serve"), &[8080], &CancelToken::new())
        .expect_err("timeout");

    assert!(matches!(err, EnvError::ServiceStartTimeout { .. }));
    assert_eq!(
        env.notes().entries().pop().expect("note").exit_code(),
        Some(137)
    );
    assert!(env.service_names().is_empty());
}

#[test]
fn background_service_exiting_early_is_infra() {
    let (runtime, registry) = setup();
    let env = create(&registry, container_config());
    runtime.set_service_behavior(ServiceBehavior::Exit {
        exit_code: 1,
        stderr: "address in use".to_string(),
    });

    let err = env
        .run_background(&CommandSpec::new("serve"), &[8080], &CancelToken::new())
        .expect_err("exit");

    assert!(matches!(err, EnvError::Infra(_)));
    assert_eq!(
        env.notes().entries().pop().expect("note").exit_code(),
        Some(1)
    );
}

#[test]
fn runtime_failure_starting_background_service_is_noted_as_exit_1() {
    let (runtime, registry) = setup();
    let env = create(&registry, container_config());
    runtime.fail_commands_containing("flaky");

    let err = env
        .run_background(&CommandSpec::new("flaky serve"), &[8080], &CancelToken::new())
        .expect_err("engine failure");

    assert!(matches!(err, EnvError::Infra(_)));
    assert_eq!(
        env.notes().entries().pop().expect("note").exit_code(),
        Some(1)
    );
    assert!(env.service_names().is_empty());
}

#[test]
fn edits_are_shipped_as_patches() {
    let (runtime, registry) = setup();
    let env = create(&registry, container_config());
    env.file_write("a.txt", "one\ntwo\nthree\n").expect("write");

    env.file_edit("a.txt", "two", "TWO", None).expect("edit");
    env.file_edit("/src/a.txt", "three", "3", None)
        .expect("edit by absolute path");

    assert_eq!(
        env.file_read("a.txt", true, 0, 0).expect("read"),
        "one\nTWO\n3\n"
    );
    let patches: Vec<String> = runtime
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("with_patch . "))
        .collect();
    assert_eq!(patches.len(), 2);
    assert!(env.notes().pop().contains("Edit a.txt"));
}

#[test]
fn edits_with_parent_components_patch_the_file_that_was_read() {
    let (runtime, registry) = setup();
    let env = create(&registry, container_config());
    env.file_write("b.txt", "x\n").expect("write");
    env.file_write("sub/b.txt", "x\n").expect("write nested");

    env.file_edit("sub/../b.txt", "x", "y", None)
        .expect("edit through parent component");

    let snapshot = snapshot_id(&env);
    assert_eq!(runtime.file(&snapshot, "b.txt").as_deref(), Some("y\n"));
    assert_eq!(runtime.file(&snapshot, "sub/b.txt").as_deref(), Some("x\n"));

    env.file_write("c.txt", "x\n").expect("write");
    env.file_edit("sub/../c.txt", "x", "z", None)
        .expect("edit with no file under sub");
    assert_eq!(
        runtime.file(&snapshot_id(&env), "c.txt").as_deref(),
        Some("z\n")
    );
}

#[test]
fn edits_outside_workdir_patch_from_the_root() {
    let (runtime, registry) = setup();
    let env = create(&registry, container_config());
    env.file_write("/etc/motd", "hello\n").expect("write");
    env.file_write("notes.txt", "up\n").expect("write");
    env.file_write("/notes.txt", "up\n").expect("write at root");

    env.file_edit("/etc/motd", "hello", "bye", None)
        .expect("absolute edit");
    env.file_edit("../notes.txt", "up", "down", None)
        .expect("edit above workdir");

    let snapshot = snapshot_id(&env);
    assert_eq!(runtime.file(&snapshot, "/etc/motd").as_deref(), Some("bye\n"));
    assert_eq!(runtime.file(&snapshot, "notes.txt").as_deref(), Some("up\n"));
    assert_eq!(runtime.file(&snapshot, "/notes.txt").as_deref(), Some("down\n"));
    let root_patches = runtime
        .calls()
        .iter()
        .filter(|c| c.starts_with("with_patch / "))
        .count();
    assert_eq!(root_patches, 2);
}

#[test]
fn delete_removes_file_from_snapshot() {
    let (runtime, registry) = setup();
    let env = create(&registry, container_config());
    env.file_write("tmp.txt", "x").expect("write");

    env.file_delete("tmp.txt").expect("delete");

    assert_eq!(runtime.file(&snapshot_id(&env), "tmp.txt"), None);
    assert!(env.file_delete("tmp.txt").is_err());
}

#[test]
fn failed_config_update_keeps_old_snapshot_and_services() {
    let (runtime, registry) = setup();
    let original = EnvironmentConfig {
        services: vec![db_service()],
        ..container_config()
    };
    let env = create(&registry, original.clone());
    let before = env.snapshot();
    let services_before = runtime.running_services();
    assert_eq!(services_before.len(), 1);

    let broken = EnvironmentConfig {
        install_commands: vec!["exit 5".to_string()],
        services: vec![db_service()],
        ..container_config()
    };
    let err = env
        .update_config(broken, &CancelToken::new())
        .expect_err("install fails");

    assert!(matches!(
        err,
        EnvError::Build {
            phase: BuildPhase::Install,
            ..
        }
    ));
    assert_eq!(env.snapshot(), before);
    assert_eq!(env.config(), original);
    assert_eq!(runtime.running_services(), services_before);
    env.run(&CommandSpec::new("true"), &CancelToken::new())
        .expect("old snapshot still runs");
}

#[test]
fn config_update_carries_files_and_swaps_services() {
    let (runtime, registry) = setup();
    let env = create(
        &registry,
        EnvironmentConfig {
            services: vec![db_service()],
            ..container_config()
        },
    );
    env.file_write("notes.md", "keep me\n").expect("write");
    let old_services = runtime.running_services();

    let updated = EnvironmentConfig {
        install_commands: vec!["touch ready".to_string()],
        services: vec![db_service()],
        ..container_config()
    };
    env.update_config(updated, &CancelToken::new())
        .expect("update");

    let snapshot = snapshot_id(&env);
    assert_eq!(runtime.file(&snapshot, "notes.md").as_deref(), Some("keep me\n"));
    assert_eq!(runtime.file(&snapshot, "ready").as_deref(), Some(""));
    let running = runtime.running_services();
    assert_eq!(running.len(), 1);
    assert_ne!(running, old_services);
}

#[test]
fn mode_switch_is_rejected() {
    let (_runtime, registry) = setup();
    let env = create(&registry, container_config());
    let dir = host_workdir();
    let host = agentenv::test_support::host_config(dir.path());

    assert!(matches!(
        env.update_config(host, &CancelToken::new()),
        Err(EnvError::Config(_))
    ));
}

#[test]
fn terminal_prefers_bash_when_listed() {
    let (runtime, registry) = setup();
    let env = create(&registry, container_config());

    env.terminal().expect("sh terminal");
    env.file_write("/etc/shells", "/bin/sh\n/bin/bash\n")
        .expect("write shells");
    env.terminal().expect("bash terminal");

    let calls = runtime.calls();
    assert!(calls.iter().any(|c| c == "with_new_file /.agentenv/rc.sh"));
    assert!(calls.iter().any(|c| c == "with_env ENV"));
    assert!(calls.iter().any(|c| c == "terminal sh"));
    assert!(
        calls
            .iter()
            .any(|c| c == "terminal /bin/bash --rcfile /.agentenv/rc.sh -i")
    );
}

#[test]
fn checkpoint_publishes_current_snapshot() {
    let (_runtime, registry) = setup();
    let env = create(&registry, container_config());
    env.file_write("a", "b").expect("write");
    let snapshot = snapshot_id(&env);

    let reference = env.checkpoint("registry.local/agent:1").expect("publish");

    assert_eq!(reference, format!("registry.local/agent:1@{snapshot}"));
}

#[test]
fn kill_background_needs_host_mode() {
    let (_runtime, registry) = setup();
    let env = create(&registry, container_config());
    assert!(matches!(
        env.kill_background(42),
        Err(EnvError::Unsupported {
            mode: ExecutionMode::Container,
            ..
        })
    ));
}

#[test]
fn persisted_container_state_reuses_snapshot() {
    let (runtime, registry) = setup();
    let env = create(&registry, container_config());
    env.file_write("state.txt", "v1\n").expect("write");
    let json = env.state_json().expect("serialize");
    let worktree = host_workdir();

    let loaded = registry
        .load("restored", &json, worktree.path())
        .expect("load");

    assert_eq!(loaded.snapshot(), env.snapshot());
    assert_eq!(loaded.workdir(), "/src");
    assert_eq!(
        loaded.file_read("state.txt", true, 0, 0).expect("read"),
        "v1\n"
    );
    let builds = runtime
        .calls()
        .iter()
        .filter(|c| c.starts_with("from_image"))
        .count();
    assert_eq!(builds, 1);
}

#[test]
fn registry_tracks_environments_by_id() {
    let (runtime, registry) = setup();
    let first = create(&registry, container_config());
    let second = create(
        &registry,
        EnvironmentConfig {
            services: vec![db_service()],
            ..container_config()
        },
    );

    assert_eq!(registry.len(), 2);
    assert_ne!(first.id(), second.id());
    let ids: Vec<String> = registry.list().iter().map(|e| e.id().to_string()).collect();
    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(ids, sorted);

    registry.remove(second.id());
    assert_eq!(registry.len(), 1);
    assert!(runtime.running_services().is_empty());
    assert!(matches!(second.snapshot(), SnapshotRef::Container(_)));
}
