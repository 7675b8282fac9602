use std::num::ParseIntError;

use derive_more::{Deref, Display, From};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::topology::HardwareTopology;

#[derive(Debug, Error)]
pub enum ThreadCountError {
    #[error("thread count override `{value}` is not a non-negative integer")]
    Parse {
        value: String,
        #[source]
        source: ParseIntError,
    },
}

/// Number of worker threads a backend should run.
#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deref, From)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ThreadCount(pub usize);

/// Where a [`ThreadCountDecision`] came from.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ThreadSource {
    /// The explicit thread-count override.
    #[display("override")]
    Override,
    /// Cores split evenly across chips.
    #[display("topology")]
    Topology,
    /// [`recommended_threads`] over the logical processors.
    #[display("heuristic")]
    Heuristic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ThreadCountDecision {
    pub threads: ThreadCount,
    pub source: ThreadSource,
}

/// Maps a logical processor count to a thread count.
///
/// The table is empirical. Hyperthreads are assumed to come in pairs and are dropped.
/// Small parts get a floor of 4 and many-core accelerator-like parts are capped at 64.
/// Even physical counts of 16 or 20 are halved once more.
pub fn recommended_threads(total: usize) -> usize {
    if total >= 256 {
        return 64;
    }

    let mut half = total / 2;
    if half <= 4 {
        return 4;
    }

    if half > 24 {
        let mut rounds = 0;
        while half > 24 {
            half /= 2;
            rounds += 1;
        }
        if half == 20 && rounds < 2 {
            half /= 2;
        }
        return half;
    }

    // consumer parts and odd counts are final
    if half <= 6 || half % 2 != 0 {
        return half;
    }
    if half == 20 || half == 16 {
        half /= 2;
    }
    half
}

/// Picks the thread count: the override if present, else cores per chip, else [`recommended_threads`].
///
/// A present but malformed override is an error; it never falls back to the hardware.
pub fn decide(
    num_threads: Option<&str>,
    topology: &HardwareTopology,
) -> Result<ThreadCountDecision, ThreadCountError> {
    if let Some(value) = num_threads.filter(|value| !value.is_empty()) {
        let threads = value
            .parse::<usize>()
            .map_err(|source| ThreadCountError::Parse {
                value: value.to_owned(),
                source,
            })?;
        return Ok(ThreadCountDecision {
            threads: threads.into(),
            source: ThreadSource::Override,
        });
    }

    let HardwareTopology {
        logical_processors,
        cores,
        chips,
    } = *topology;
    let decision = match (cores, chips) {
        (cores, chips) if cores > 0 && chips > 0 => ThreadCountDecision {
            threads: (cores / chips).max(1).into(),
            source: ThreadSource::Topology,
        },
        _ => ThreadCountDecision {
            threads: recommended_threads(logical_processors).into(),
            source: ThreadSource::Heuristic,
        },
    };
    Ok(decision)
}

#[cfg(test)]
mod tests {
    use super::{ThreadCountError, ThreadSource, decide, recommended_threads};
    use crate::topology::HardwareTopology;

    #[test]
    fn test_recommended_threads() {
        let cases = [
            // floor
            (0, 4),
            (1, 4),
            (8, 4),
            (9, 4),
            // consumer parts
            (10, 5),
            (12, 6),
            (13, 6),
            // odd physical counts are final
            (14, 7),
            (34, 17),
            // even gap counts
            (32, 8),
            (40, 10),
            (48, 24),
            (24, 12),
            // halving loop
            (50, 12),
            (100, 12),
            (250, 15),
            (255, 15),
            // many-core cap
            (256, 64),
            (512, 64),
            (usize::MAX, 64),
        ];
        for (total, threads) in cases {
            assert_eq!(recommended_threads(total), threads, "total = {total}");
        }
    }

    #[test]
    fn test_twenty_after_halving() {
        // half = 40 → 20 in one round: halved again
        assert_eq!(recommended_threads(80), 10);
        assert_eq!(recommended_threads(81), 10);
        // half = 80 → 40 → 20 in two rounds: kept
        assert_eq!(recommended_threads(160), 20);
        // half = 41 → 20 in one round
        assert_eq!(recommended_threads(82), 10);
        // half = 83 → 41 → 20 in two rounds
        assert_eq!(recommended_threads(166), 20);
    }

    #[test]
    fn test_recommended_threads_bounds() {
        let mut rng = fastrand::Rng::with_seed(0x6b696c6e);
        for _ in 0..10_000 {
            let total = rng.usize(..256);
            let threads = recommended_threads(total);
            assert!((4..=24).contains(&threads), "total = {total}");
            assert_eq!(threads, recommended_threads(total));
        }
    }

    #[test]
    fn test_override_wins() -> Result<(), ThreadCountError> {
        let topology = HardwareTopology {
            logical_processors: 64,
            cores: 32,
            chips: 2,
        };
        let decision = decide(Some("3"), &topology)?;
        assert_eq!(*decision.threads, 3);
        assert_eq!(decision.source, ThreadSource::Override);

        let decision = decide(Some("0"), &topology)?;
        assert_eq!(*decision.threads, 0);
        Ok(())
    }

    #[test]
    fn test_malformed_override() {
        let topology = HardwareTopology::default();
        for value in ["four", "-2", " 4", "4.0", "99999999999999999999999"] {
            match decide(Some(value), &topology) {
                Err(ThreadCountError::Parse { value: v, .. }) => assert_eq!(v, value),
                other => panic!("`{value}` must fail, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_empty_override_is_unset() -> Result<(), ThreadCountError> {
        let topology = HardwareTopology {
            logical_processors: 14,
            cores: 0,
            chips: 0,
        };
        let decision = decide(Some(""), &topology)?;
        assert_eq!(*decision.threads, 7);
        assert_eq!(decision.source, ThreadSource::Heuristic);
        Ok(())
    }

    #[test]
    fn test_cores_per_chip() -> Result<(), ThreadCountError> {
        let topology = HardwareTopology {
            logical_processors: 96,
            cores: 48,
            chips: 2,
        };
        let decision = decide(None, &topology)?;
        assert_eq!(*decision.threads, 24);
        assert_eq!(decision.source, ThreadSource::Topology);

        // more chips than cores still yields one thread
        let topology = HardwareTopology {
            logical_processors: 4,
            cores: 2,
            chips: 4,
        };
        assert_eq!(*decide(None, &topology)?.threads, 1);
        Ok(())
    }

    #[test]
    fn test_unknown_topology_uses_heuristic() -> Result<(), ThreadCountError> {
        for (cores, chips) in [(0, 0), (16, 0), (0, 2)] {
            let topology = HardwareTopology {
                logical_processors: 40,
                cores,
                chips,
            };
            let decision = decide(None, &topology)?;
            assert_eq!(*decision.threads, 10);
            assert_eq!(decision.source, ThreadSource::Heuristic);
        }
        Ok(())
    }
}
