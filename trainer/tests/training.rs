use std::{
    fs,
    net::TcpListener,
    num::NonZeroUsize,
    path::Path,
};

use bridge::Role;
use trainer::{
    LogLevel, RoleConfig, RunSummary, RuntimeEnv, TrainerError,
    data::{SynthConfig, generate},
    run_role,
};

fn free_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}

fn make_data(root: &Path) {
    let config = SynthConfig {
        output: root.join("data"),
        blocks: 2,
        examples: 64,
        leader_features: 2,
        follower_features: 2,
        seed: Some(1),
    };
    generate(&config).unwrap();
}

fn role_config(root: &Path, role: Role, local: &str, peer: &str) -> RoleConfig {
    RoleConfig {
        local_addr: local.to_string(),
        peer_addr: peer.to_string(),
        data_path: root.join("data").join(role.as_str()),
        checkpoint_path: Some(root.join("model").join(role.as_str()).join("checkpoint")),
        export_path: Some(root.join("model").join(role.as_str()).join("export")),
        save_checkpoint_steps: 4,
        summary_save_steps: 4,
        epoch_num: 3,
        batch_size: NonZeroUsize::new(16).unwrap(),
        cluster_spec: None,
        loglevel: LogLevel::Info,
        app_id: "test_trainer".to_string(),
        rank: 0,
        waiting_alert_timeout: 10,
        stream_queue_size: NonZeroUsize::new(1024).unwrap(),
        connect_timeout: 30,
        learning_rate: 0.1,
    }
}

fn configs(root: &Path) -> (RoleConfig, RoleConfig) {
    let leader_addr = free_addr();
    let follower_addr = free_addr();
    (
        role_config(root, Role::Leader, &leader_addr, &follower_addr),
        role_config(root, Role::Follower, &follower_addr, &leader_addr),
    )
}

async fn train(leader: RoleConfig, follower: RoleConfig) -> Result<(RunSummary, RunSummary), TrainerError> {
    tokio::try_join!(
        run_role(Role::Leader, leader, RuntimeEnv::default()),
        run_role(Role::Follower, follower, RuntimeEnv::default()),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn both_parties_train_in_lockstep() -> Result<(), TrainerError> {
    let root = tempfile::tempdir()?;
    make_data(root.path());

    let (leader_cfg, follower_cfg) = configs(root.path());
    let leader_export = leader_cfg.export_path.clone().unwrap();
    let follower_ckpt = follower_cfg.checkpoint_path.clone().unwrap();

    let (leader, follower) = train(leader_cfg, follower_cfg).await?;

    // 3 epochs of 2 blocks of 4 batches.
    assert_eq!(leader.steps, 24);
    assert_eq!(follower.steps, 24);
    assert_eq!(leader.examples, 3 * 128);
    assert_eq!(leader.skipped_blocks, 0);

    let first = leader.first_loss.unwrap();
    let last = leader.last_loss.unwrap();
    assert!(last < first, "loss went from {first} to {last}");
    assert!(follower.first_loss.is_none());

    assert!(leader_export.join("model.json").is_file());
    assert_eq!(
        fs::read_to_string(follower_ckpt.join("checkpoint"))?,
        "checkpoint-24.json"
    );
    assert!(follower_ckpt.join("checkpoint-4.json").is_file());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn refused_blocks_are_skipped_by_both() -> Result<(), TrainerError> {
    let root = tempfile::tempdir()?;
    make_data(root.path());
    fs::remove_file(root.path().join("data/follower/part-00001.jsonl"))?;

    let (mut leader_cfg, mut follower_cfg) = configs(root.path());
    leader_cfg.epoch_num = 2;
    follower_cfg.epoch_num = 2;

    let (leader, follower) = train(leader_cfg, follower_cfg).await?;

    assert_eq!(leader.skipped_blocks, 2);
    assert_eq!(leader.steps, 8);
    assert_eq!(follower.steps, 8);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn training_resumes_from_the_latest_checkpoint() -> Result<(), TrainerError> {
    let root = tempfile::tempdir()?;
    make_data(root.path());

    let (mut leader_cfg, mut follower_cfg) = configs(root.path());
    leader_cfg.epoch_num = 1;
    follower_cfg.epoch_num = 1;
    let (leader, _) = train(leader_cfg, follower_cfg).await?;
    assert_eq!(leader.steps, 8);

    let (mut leader_cfg, mut follower_cfg) = configs(root.path());
    leader_cfg.epoch_num = 2;
    follower_cfg.epoch_num = 2;
    let (leader, follower) = train(leader_cfg, follower_cfg).await?;

    assert_eq!(leader.steps, 16);
    assert_eq!(follower.steps, 16);
    assert_eq!(leader.examples, 128);
    Ok(())
}

#[tokio::test]
async fn secure_channel_request_refuses_to_start() {
    let root = tempfile::tempdir().unwrap();
    let (leader_cfg, _) = configs(root.path());

    let env = RuntimeEnv {
        secure_channel: Some("FL_GRPC_SGX_RA_TLS_ENABLE"),
        ..RuntimeEnv::default()
    };

    let err = run_role(Role::Leader, leader_cfg, env).await.unwrap_err();
    assert!(matches!(err, TrainerError::Config(_)));
    assert!(!err.is_channel_failure());
}
