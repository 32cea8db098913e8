use std::{fs, path::PathBuf};

use log::info;
use rand::{Rng, SeedableRng, rngs::StdRng};
use rand_distr::StandardNormal;

use super::{Example, write_block};
use crate::Result;

const NOISE_STD: f32 = 0.1;

/// The flags of `make-data`.
#[derive(Debug, Clone, clap::Args)]
pub struct SynthConfig {
    /// Directory receiving the `leader/` and `follower/` block directories.
    #[arg(long, default_value = "data")]
    pub output: PathBuf,
    #[arg(long, default_value_t = 4)]
    pub blocks: usize,
    /// Examples per block.
    #[arg(long, default_value_t = 256)]
    pub examples: usize,
    #[arg(long, default_value_t = 4)]
    pub leader_features: usize,
    #[arg(long, default_value_t = 4)]
    pub follower_features: usize,
    #[arg(long)]
    pub seed: Option<u64>,
}

/// What `generate` wrote.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthSummary {
    pub leader_dir: PathBuf,
    pub follower_dir: PathBuf,
    pub examples: usize,
    /// The weights the labels were drawn from, leader features first, then
    /// the follower's, then the bias.
    pub true_weights: Vec<f32>,
}

fn random_features<R: Rng>(rng: &mut R, n: usize) -> Vec<f32> {
    (0..n).map(|_| rng.sample::<f32, _>(StandardNormal)).collect()
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, w)| x * w).sum()
}

/// Writes a vertically partitioned regression dataset.
///
/// Both parties get blocks with the same ids holding the same example ids in
/// the same order. Only the leader's examples carry the label, a linear
/// function of every feature of both parties plus gaussian noise.
pub fn generate(config: &SynthConfig) -> Result<SynthSummary> {
    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };

    let leader_dir = config.output.join("leader");
    let follower_dir = config.output.join("follower");
    fs::create_dir_all(&leader_dir)?;
    fs::create_dir_all(&follower_dir)?;

    let n = config.leader_features + config.follower_features;
    let true_weights: Vec<f32> = (0..=n).map(|_| rng.random_range(-1.0..1.0)).collect();
    let (leader_w, rest) = true_weights.split_at(config.leader_features);
    let (follower_w, bias) = rest.split_at(config.follower_features);
    let bias = bias[0];

    let mut example_id = 0;
    for block in 0..config.blocks {
        let mut leader = Vec::with_capacity(config.examples);
        let mut follower = Vec::with_capacity(config.examples);

        for _ in 0..config.examples {
            let xl = random_features(&mut rng, config.leader_features);
            let xf = random_features(&mut rng, config.follower_features);
            let noise: f32 = rng.sample(StandardNormal);
            let label = dot(&xl, leader_w) + dot(&xf, follower_w) + bias + NOISE_STD * noise;

            leader.push(Example {
                example_id,
                features: xl,
                label: Some(label),
            });
            follower.push(Example {
                example_id,
                features: xf,
                label: None,
            });
            example_id += 1;
        }

        let name = format!("part-{block:05}.jsonl");
        write_block(&leader_dir.join(&name), &leader)?;
        write_block(&follower_dir.join(&name), &follower)?;
    }

    info!(
        blocks = config.blocks,
        examples = example_id;
        "generated synthetic data under {}",
        config.output.display()
    );

    Ok(SynthSummary {
        leader_dir,
        follower_dir,
        examples: example_id as usize,
        true_weights,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DataSource;

    fn config(output: PathBuf) -> SynthConfig {
        SynthConfig {
            output,
            blocks: 3,
            examples: 5,
            leader_features: 2,
            follower_features: 3,
            seed: Some(7),
        }
    }

    #[test]
    fn parties_share_block_and_example_ids() {
        let dir = tempfile::tempdir().unwrap();
        let summary = generate(&config(dir.path().to_path_buf())).unwrap();
        assert_eq!(summary.examples, 15);
        assert_eq!(summary.true_weights.len(), 6);

        let leader = DataSource::scan(&summary.leader_dir).unwrap();
        let follower = DataSource::scan(&summary.follower_dir).unwrap();
        assert_eq!(leader.blocks().len(), 3);

        for (l, f) in leader.blocks().iter().zip(follower.blocks()) {
            assert_eq!(l.id, f.id);
            let l = l.load().unwrap();
            let f = f.load().unwrap();

            for (l, f) in l.iter().zip(&f) {
                assert_eq!(l.example_id, f.example_id);
                assert_eq!(l.features.len(), 2);
                assert_eq!(f.features.len(), 3);
                assert!(l.label.is_some());
                assert!(f.label.is_none());
            }
        }
    }

    #[test]
    fn seeded_generation_is_reproducible() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let sa = generate(&config(a.path().to_path_buf())).unwrap();
        let sb = generate(&config(b.path().to_path_buf())).unwrap();

        assert_eq!(sa.true_weights, sb.true_weights);
        assert_eq!(
            fs::read_to_string(sa.leader_dir.join("part-00001.jsonl")).unwrap(),
            fs::read_to_string(sb.leader_dir.join("part-00001.jsonl")).unwrap(),
        );
    }
}
