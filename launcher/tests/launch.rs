use std::{fs, path::Path, time::Duration};

use launcher::{CommandSpec, LaunchError, LaunchPlan, Launcher};

fn sh(script: &str) -> CommandSpec {
    CommandSpec::new("sh").args(["-c", script])
}

fn plan(workdir: &Path, leader: CommandSpec) -> LaunchPlan {
    let mut plan = LaunchPlan::from_toml(
        r#"
        [env]
        JOB_NAME = "demo"

        [follower]
        program = "true"

        [leader]
        program = "true"
        "#,
    )
    .unwrap();

    plan.workdir = workdir.to_path_buf();
    plan.data = Some(sh("mkdir -p data && echo ready > data/marker"));
    plan.follower = sh("echo follower $JOB_NAME").log("follower.log");
    plan.leader = leader.log("leader.log");
    plan
}

#[tokio::test]
async fn runs_every_step_and_resets_directories() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("model/leader")).unwrap();

    let leader = sh("cat data/marker && test ! -d model");
    let report = Launcher::new(plan(dir.path(), leader)).run().await.unwrap();

    assert!(report.leader.success());
    assert_eq!(report.background.len(), 1);
    assert_eq!(report.background[0].0, "follower");

    assert_eq!(fs::read_to_string(dir.path().join("leader.log")).unwrap(), "ready\n");
    assert_eq!(
        fs::read_to_string(dir.path().join("follower.log")).unwrap(),
        "follower demo\n"
    );
    assert!(!dir.path().join("data").exists());
    assert!(!dir.path().join("model").exists());
}

#[tokio::test]
async fn failing_data_step_never_starts_the_roles() {
    let dir = tempfile::tempdir().unwrap();
    let mut plan = plan(dir.path(), sh("touch leader-ran"));
    plan.data = Some(sh("exit 2"));

    let err = Launcher::new(plan).run().await.unwrap_err();

    assert!(matches!(err, LaunchError::StepFailed { ref name, code: Some(2) } if name == "data"));
    assert_eq!(err.exit_code(), 2);
    assert!(!dir.path().join("leader-ran").exists());
}

#[tokio::test]
async fn failing_leader_stops_the_background_processes() {
    let dir = tempfile::tempdir().unwrap();
    let mut plan = plan(dir.path(), sh("exit 138"));
    plan.follower = sh("sleep 30");

    let res = tokio::time::timeout(Duration::from_secs(10), Launcher::new(plan).run())
        .await
        .expect("the follower should have been killed");

    let err = res.unwrap_err();
    assert!(matches!(err, LaunchError::StepFailed { ref name, code: Some(138) } if name == "leader"));
    // Directories are kept for inspection after a failure.
    assert!(dir.path().join("data/marker").exists());
}

#[tokio::test]
async fn missing_program_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let mut plan = plan(dir.path(), sh("true"));
    plan.follower = CommandSpec::new("definitely-not-a-real-program");

    let err = Launcher::new(plan).run().await.unwrap_err();
    assert!(matches!(err, LaunchError::Spawn { .. }));
}
