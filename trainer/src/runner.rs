use std::{path::PathBuf, sync::Arc};

use bridge::{Bridge, BridgeError, ChannelEvent, Role};
use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::{
    Batch, LinearSplit, Model, Result, RoleConfig, RuntimeEnv, StepStats, TrainerError,
    checkpoint::{Checkpoint, CheckpointStore, export_model},
    data::{BlockInfo, DataSource},
};

/// What a finished training run did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    /// Completed steps, including those restored from a checkpoint.
    pub steps: u64,
    /// Examples trained on by this run.
    pub examples: u64,
    /// Blocks the peer refused.
    pub skipped_blocks: u64,
    pub first_loss: Option<f32>,
    pub last_loss: Option<f32>,
    pub checkpoint: Option<PathBuf>,
    pub export: Option<PathBuf>,
}

/// Running loss since the last summary.
#[derive(Debug, Default)]
struct LossMeter {
    sum: f64,
    count: u64,
}

impl LossMeter {
    fn add(&mut self, loss: f32) {
        self.sum += loss as f64;
        self.count += 1;
    }

    fn take(&mut self) -> Option<f64> {
        let mean = (self.count > 0).then(|| self.sum / self.count as f64);
        *self = Self::default();
        mean
    }
}

/// Drives a `Model` over this party's data blocks in lockstep with the peer.
///
/// The leader announces every block before training on it, the follower
/// trains on the blocks it accepted in the order they were announced.
pub struct Trainer<M: Model> {
    role: Role,
    config: RoleConfig,
    bridge: Arc<Bridge>,
    model: M,
    data: DataSource,
    checkpoints: Option<CheckpointStore>,
    epoch: u32,
    step: u64,
    resume_skip: u64,
    meter: LossMeter,
    summary: RunSummary,
}

impl<M: Model> Trainer<M> {
    /// Creates a new `Trainer`.
    ///
    /// # Arguments
    /// * `role` - The side this process plays.
    /// * `config` - The flags of the role.
    /// * `model` - The model to train.
    ///
    /// # Errors
    /// Fails if the data path holds no data blocks.
    pub fn new(role: Role, config: RoleConfig, model: M) -> Result<Self> {
        let data = DataSource::scan(&config.data_path)?;
        info!(
            role = role.as_str(), blocks = data.blocks().len(), examples = data.total_examples();
            "found data under {}",
            config.data_path.display()
        );

        let bridge = Arc::new(Bridge::new(config.bridge_config(role)));
        let checkpoints = config.checkpoint_path.clone().map(CheckpointStore::new);

        Ok(Self {
            role,
            config,
            bridge,
            model,
            data,
            checkpoints,
            epoch: 0,
            step: 0,
            resume_skip: 0,
            meter: LossMeter::default(),
            summary: RunSummary::default(),
        })
    }

    /// Trains until the data is exhausted, then terminates the bridge.
    ///
    /// The bridge is terminated even if training fails, the training error
    /// taking precedence over a failure to close.
    pub async fn run(mut self) -> Result<RunSummary> {
        let trained = self.train().await;
        let closed = self.bridge.terminate().await;

        trained?;
        closed?;

        self.summary.steps = self.step;
        info!(
            role = self.role.as_str(), steps = self.step, examples = self.summary.examples;
            "training finished"
        );
        Ok(self.summary)
    }

    async fn train(&mut self) -> Result<()> {
        self.resume()?;

        match self.role {
            Role::Leader => {
                self.bridge.connect().await?;
                self.lead().await?;
            }
            Role::Follower => {
                let blocks = self.accept_blocks()?;
                self.bridge.connect().await?;
                self.follow(blocks).await?;
            }
        }

        self.finish()
    }

    fn resume(&mut self) -> Result<()> {
        let Some(store) = &self.checkpoints else {
            return Ok(());
        };
        let Some(checkpoint) = store.latest()? else {
            return Ok(());
        };

        if checkpoint.role != self.role {
            return Err(TrainerError::ModelRole {
                expected: self.role,
                found: checkpoint.role,
            });
        }

        self.model.restore(checkpoint.model)?;
        self.step = checkpoint.step;
        self.resume_skip = checkpoint.step;
        info!(
            step = checkpoint.step, epoch = checkpoint.epoch;
            "resuming from checkpoint under {}",
            store.dir().display()
        );
        Ok(())
    }

    async fn lead(&mut self) -> Result<()> {
        let blocks = self.data.blocks().to_vec();

        for epoch in 0..self.config.epoch_num {
            self.epoch = epoch;
            info!(epoch = epoch; "starting epoch");

            for block in &blocks {
                if !self.bridge.load_data_block(block.count, &block.id).await? {
                    warn!("peer refused data block {}, skipping it", block.id);
                    self.summary.skipped_blocks += 1;
                    continue;
                }

                self.train_block(block).await?;
            }
        }

        Ok(())
    }

    /// Registers the handler accepting the blocks we also hold.
    ///
    /// # Returns
    /// The ids of the accepted blocks, in announcement order.
    fn accept_blocks(&self) -> Result<mpsc::UnboundedReceiver<String>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let data = self.data.clone();

        self.bridge.register_data_block_handler(move |request| {
            let accepted = data
                .get(&request.block_id)
                .is_some_and(|block| block.count == request.count);

            if !accepted {
                warn!(
                    "refusing data block {} with {} examples",
                    request.block_id, request.count
                );
                return false;
            }

            tx.send(request.block_id.clone()).is_ok()
        })?;

        Ok(rx)
    }

    async fn follow(&mut self, mut blocks: mpsc::UnboundedReceiver<String>) -> Result<()> {
        let mut events = self.bridge.events();
        let mut last_id: Option<String> = None;

        loop {
            tokio::select! {
                biased;
                Some(id) = blocks.recv() => {
                    // Blocks are announced in order, going back means a new epoch.
                    if last_id.as_ref().is_some_and(|last| id <= *last) {
                        self.epoch += 1;
                        info!(epoch = self.epoch; "starting epoch");
                    }

                    let Some(block) = self.data.get(&id).cloned() else {
                        continue;
                    };
                    self.train_block(&block).await?;
                    last_id = Some(id);
                }
                event = events.wait_for(|e| matches!(e, ChannelEvent::PeerClosed | ChannelEvent::Error(_))) => {
                    let event = event.map(|e| (*e).clone()).map_err(|_| BridgeError::Terminated)?;
                    if let ChannelEvent::Error(reason) = event {
                        return Err(BridgeError::Channel(reason).into());
                    }

                    info!("peer finished training");
                    return Ok(());
                }
            }
        }
    }

    async fn train_block(&mut self, block: &BlockInfo) -> Result<()> {
        let examples = block.load()?;
        debug!("training on data block {} with {} examples", block.id, examples.len());

        for chunk in examples.chunks(self.config.batch_size.get()) {
            if self.resume_skip > 0 {
                self.resume_skip -= 1;
                continue;
            }

            let batch = Batch::from_examples(chunk)?;
            let iter_id = self.bridge.new_iter_id();
            self.bridge.start(iter_id).await?;
            let stats = self.model.step(&self.bridge, &batch).await?;
            self.bridge.commit().await?;

            self.after_step(stats)?;
        }

        Ok(())
    }

    fn after_step(&mut self, stats: StepStats) -> Result<()> {
        self.step += 1;
        self.summary.examples += stats.examples as u64;

        if let Some(loss) = stats.loss {
            self.meter.add(loss);
            self.summary.first_loss.get_or_insert(loss);
            self.summary.last_loss = Some(loss);
        }

        let summary_steps = self.config.summary_save_steps;
        if summary_steps > 0 && self.step % summary_steps == 0 {
            match self.meter.take() {
                Some(loss) => info!(
                    step = self.step, epoch = self.epoch, loss = loss;
                    "training summary"
                ),
                None => info!(step = self.step, epoch = self.epoch; "training summary"),
            }
        }

        let checkpoint_steps = self.config.save_checkpoint_steps;
        if checkpoint_steps > 0 && self.step % checkpoint_steps == 0 {
            self.save_checkpoint()?;
        }

        Ok(())
    }

    fn save_checkpoint(&mut self) -> Result<()> {
        let Some(store) = &self.checkpoints else {
            return Ok(());
        };

        let checkpoint = Checkpoint {
            step: self.step,
            epoch: self.epoch,
            role: self.role,
            model: self.model.state()?,
        };

        self.summary.checkpoint = Some(store.save(&checkpoint)?);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let saved_last = self
            .summary
            .checkpoint
            .as_ref()
            .is_some_and(|path| path.ends_with(format!("checkpoint-{}.json", self.step)));

        if !saved_last {
            self.save_checkpoint()?;
        }

        if let Some(dir) = &self.config.export_path {
            self.summary.export = Some(export_model(dir, &self.model.state()?)?);
        }

        Ok(())
    }
}

/// Runs `role` with the demo model until training completes.
///
/// # Arguments
/// * `role` - The side this process plays.
/// * `config` - The flags of the role.
/// * `env` - The settings read from the environment.
///
/// # Errors
/// Fails if the environment asks for an unsupported feature, or on any
/// training failure. A broken channel is reported through
/// `TrainerError::is_channel_failure`.
pub async fn run_role(role: Role, config: RoleConfig, env: RuntimeEnv) -> Result<RunSummary> {
    env.ensure_supported()?;

    if let Some(threads) = env.intra_op_threads {
        info!("intra op parallelism threads: {threads}");
    }

    if let Some(spec) = &config.cluster_spec {
        info!(
            "parameter servers: {:?}, workers: {:?}, synchronized externally",
            spec.ps, spec.workers
        );
    }

    let model = LinearSplit::new(role, config.learning_rate);
    Trainer::new(role, config, model)?.run().await
}
