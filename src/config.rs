//! Launch configuration.
//!
//! The group size comes from launcher flags on the command line, then from
//! the environment, then defaults to a single rank.
//!
//! # Sources
//!
//! | Source | Form |
//! |--------|------|
//! | arguments | `-n N`, `-np N`, `--ranks N`, `--ranks=N` |
//! | environment | `RANKCOMM_RANKS` |
//! | environment | `SLURM_NTASKS` (tasks of the current SLURM job) |

use crate::error::{Error, Result};
use std::env;

/// Environment variable holding the number of ranks.
pub const RANKS_VAR: &str = "RANKCOMM_RANKS";

/// SLURM's task count for the current job.
pub const SLURM_NTASKS_VAR: &str = "SLURM_NTASKS";

/// How many ranks to launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    /// Number of ranks in the world group.
    pub ranks: usize,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        LaunchConfig { ranks: 1 }
    }
}

impl LaunchConfig {
    /// Set the number of ranks.
    pub fn with_ranks(mut self, ranks: usize) -> Self {
        self.ranks = ranks;
        self
    }

    /// Resolve the configuration from the process environment alone.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Resolve the configuration through `lookup`, which maps an
    /// environment variable name to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let ranks = match lookup(RANKS_VAR) {
            Some(value) => parse_ranks(RANKS_VAR, &value)?,
            None => match lookup(SLURM_NTASKS_VAR) {
                Some(value) => parse_ranks(SLURM_NTASKS_VAR, &value)?,
                None => 1,
            },
        };
        Ok(LaunchConfig { ranks })
    }

    /// Resolve the configuration from launch arguments, falling back to the
    /// environment.
    ///
    /// Launcher flags are stripped; the remaining arguments are returned in
    /// order for the application.
    pub fn from_args<I, S>(args: I) -> Result<(Self, Vec<String>)>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_args_with(args, |key| env::var(key).ok())
    }

    pub(crate) fn from_args_with<I, S>(
        args: I,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(Self, Vec<String>)>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ranks = None;
        let mut rest = Vec::new();
        let mut args = args.into_iter().map(Into::into);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-n" | "-np" | "--ranks" => {
                    let value = args
                        .next()
                        .ok_or_else(|| Error::Config(format!("{arg} needs a value")))?;
                    ranks = Some(parse_ranks(&arg, &value)?);
                }
                _ => match arg.strip_prefix("--ranks=") {
                    Some(value) => ranks = Some(parse_ranks("--ranks", value)?),
                    None => rest.push(arg),
                },
            }
        }
        let config = match ranks {
            Some(ranks) => LaunchConfig { ranks },
            None => Self::from_lookup(lookup)?,
        };
        Ok((config, rest))
    }

    /// Check that the configuration can be launched.
    pub fn validate(&self) -> Result<()> {
        if self.ranks == 0 {
            return Err(Error::Config("at least one rank is required".into()));
        }
        if self.ranks > i32::MAX as usize {
            return Err(Error::Config(format!("{} ranks is too many", self.ranks)));
        }
        Ok(())
    }
}

fn parse_ranks(source: &str, value: &str) -> Result<usize> {
    let ranks: usize = value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{source}: '{value}' is not a rank count")))?;
    if ranks == 0 {
        return Err(Error::Config(format!("{source}: rank count must be positive")));
    }
    Ok(ranks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_to_one_rank() {
        let config = LaunchConfig::from_lookup(vars(&[])).unwrap();
        assert_eq!(config, LaunchConfig::default());
        assert_eq!(config.ranks, 1);
    }

    #[test]
    fn own_variable_wins_over_slurm() {
        let config =
            LaunchConfig::from_lookup(vars(&[(RANKS_VAR, "3"), (SLURM_NTASKS_VAR, "8")])).unwrap();
        assert_eq!(config.ranks, 3);
        let config = LaunchConfig::from_lookup(vars(&[(SLURM_NTASKS_VAR, "8")])).unwrap();
        assert_eq!(config.ranks, 8);
    }

    #[test]
    fn launcher_flags_are_stripped() {
        let (config, rest) =
            LaunchConfig::from_args_with(["prog", "-np", "4", "--verbose", "input.dat"], vars(&[]))
                .unwrap();
        assert_eq!(config.ranks, 4);
        assert_eq!(rest, vec!["prog", "--verbose", "input.dat"]);

        let (config, rest) =
            LaunchConfig::from_args_with(["prog", "--ranks=2"], vars(&[(RANKS_VAR, "9")])).unwrap();
        assert_eq!(config.ranks, 2);
        assert_eq!(rest, vec!["prog"]);
    }

    #[test]
    fn arguments_fall_back_to_environment() {
        let (config, rest) =
            LaunchConfig::from_args_with(["prog"], vars(&[(RANKS_VAR, "5")])).unwrap();
        assert_eq!(config.ranks, 5);
        assert_eq!(rest, vec!["prog"]);
    }

    #[test]
    fn bad_counts_are_config_errors() {
        for args in [
            vec!["-n"],
            vec!["-n", "zero"],
            vec!["--ranks", "0"],
            vec!["--ranks=-1"],
        ] {
            let err = LaunchConfig::from_args_with(args.clone(), vars(&[])).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{args:?}: {err}");
        }
        assert!(LaunchConfig::from_lookup(vars(&[(RANKS_VAR, "0")])).is_err());
        assert!(LaunchConfig::default().with_ranks(0).validate().is_err());
    }
}
