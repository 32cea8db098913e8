mod block;
mod synth;

pub use block::{BlockInfo, DataSource, Example, parse_block, write_block};
pub use synth::{SynthConfig, SynthSummary, generate};
