use std::fmt;

use serde::{Deserialize, Serialize};

use crate::LaunchError;

const TASKSET: &str = "taskset";

/// A list of cpu cores such as `0-3,8`, as accepted by `taskset -c`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CpuSet {
    ranges: Vec<(usize, usize)>,
}

impl CpuSet {
    /// Parses a comma separated list of cores or inclusive `a-b` ranges.
    pub fn parse(text: &str) -> Result<Self, LaunchError> {
        let invalid = || LaunchError::InvalidCpus(text.to_string());

        let ranges = text
            .split(',')
            .map(|part| {
                let part = part.trim();
                let (first, last) = part.split_once('-').unwrap_or((part, part));
                let first: usize = first.trim().parse().map_err(|_| invalid())?;
                let last: usize = last.trim().parse().map_err(|_| invalid())?;

                if first > last {
                    return Err(invalid());
                }

                Ok((first, last))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { ranges })
    }

    /// The amount of cores in the set, counting overlaps twice.
    pub fn len(&self) -> usize {
        self.ranges.iter().map(|(a, b)| b - a + 1).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Prefixes `program` and `args` so the process is pinned to this set.
    pub fn wrap(&self, program: &str, args: &[String]) -> (String, Vec<String>) {
        let mut wrapped = Vec::with_capacity(args.len() + 3);
        wrapped.push("-c".to_string());
        wrapped.push(self.to_string());
        wrapped.push(program.to_string());
        wrapped.extend_from_slice(args);

        (TASKSET.to_string(), wrapped)
    }
}

impl fmt::Display for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, &(first, last)) in self.ranges.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }

            if first == last {
                write!(f, "{first}")?;
            } else {
                write!(f, "{first}-{last}")?;
            }
        }

        Ok(())
    }
}

impl TryFrom<String> for CpuSet {
    type Error = LaunchError;

    fn try_from(text: String) -> Result<Self, Self::Error> {
        Self::parse(&text)
    }
}

impl From<CpuSet> for String {
    fn from(cpus: CpuSet) -> Self {
        cpus.to_string()
    }
}
