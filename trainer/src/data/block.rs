use std::{
    fs::{self, File},
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{Result, TrainerError};

const BLOCK_EXTENSION: &str = "jsonl";

/// One line of a data block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    pub example_id: u64,
    pub features: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<f32>,
}

/// A data block found on disk, not yet loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    pub id: String,
    pub path: PathBuf,
    pub count: u64,
}

impl BlockInfo {
    /// Reads every example of the block.
    pub fn load(&self) -> Result<Vec<Example>> {
        let examples = parse_block(&self.path)?;

        if examples.len() as u64 != self.count {
            return Err(TrainerError::SizeMismatch {
                what: "data block",
                got: examples.len(),
                expected: self.count as usize,
            });
        }

        Ok(examples)
    }
}

/// The data blocks of a party, in lexical order of their ids.
#[derive(Debug, Clone, Default)]
pub struct DataSource {
    blocks: Vec<BlockInfo>,
}

impl DataSource {
    /// Lists the `*.jsonl` files directly under `dir`, counting their examples.
    pub fn scan(dir: &Path) -> Result<Self> {
        let mut blocks = Vec::new();

        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file() || path.extension().is_none_or(|ext| ext != BLOCK_EXTENSION) {
                continue;
            }

            let Some(id) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };

            let reader = BufReader::new(File::open(&path)?);
            let mut count = 0;
            for line in reader.lines() {
                if !line?.trim().is_empty() {
                    count += 1;
                }
            }

            blocks.push(BlockInfo {
                id: id.to_string(),
                path: path.clone(),
                count,
            });
        }

        if blocks.is_empty() {
            return Err(TrainerError::NoData(dir.to_path_buf()));
        }

        blocks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(Self { blocks })
    }

    pub fn blocks(&self) -> &[BlockInfo] {
        &self.blocks
    }

    pub fn get(&self, id: &str) -> Option<&BlockInfo> {
        self.blocks.iter().find(|block| block.id == id)
    }

    /// The total number of examples over every block.
    pub fn total_examples(&self) -> u64 {
        self.blocks.iter().map(|block| block.count).sum()
    }
}

/// Parses a JSON-lines block, skipping blank lines.
pub fn parse_block(path: &Path) -> Result<Vec<Example>> {
    let reader = BufReader::new(File::open(path)?);
    let mut examples = Vec::new();

    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let example = serde_json::from_str(&line).map_err(|e| TrainerError::Data {
            path: path.to_path_buf(),
            line: i + 1,
            reason: e.to_string(),
        })?;

        examples.push(example);
    }

    Ok(examples)
}

/// Writes `examples` as a JSON-lines block at `path`.
pub fn write_block(path: &Path, examples: &[Example]) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);

    for example in examples {
        serde_json::to_writer(&mut writer, example)?;
        writer.write_all(b"\n")?;
    }

    writer.flush()?;
    Ok(())
}
