use derive_more::From;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Snapshot of the processors visible to this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HardwareTopology {
    /// OS-visible schedulable units, hyperthreads included. Never 0.
    pub logical_processors: usize,
    /// Physical cores across all chips, or 0 if unknown.
    pub cores: usize,
    /// Physical processor packages, or 0 if unknown.
    pub chips: usize,
}

impl Default for HardwareTopology {
    fn default() -> Self {
        Self {
            logical_processors: 1,
            cores: 0,
            chips: 0,
        }
    }
}

/// Reads the hardware topology. Must not fail: missing data is reported as 0.
pub trait TopologyProbe: Send + Sync {
    fn probe(&self) -> HardwareTopology;
}

/// Probes the machine the process runs on.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl TopologyProbe for SystemProbe {
    fn probe(&self) -> HardwareTopology {
        let topology = HardwareTopology {
            logical_processors: num_cpus::get().max(1),
            cores: num_cpus::get_physical(),
            chips: count_chips(),
        };
        log::debug!(
            "hardware topology: {} logical processors, {} cores, {} chips",
            topology.logical_processors,
            topology.cores,
            topology.chips
        );
        topology
    }
}

/// Always reports the same topology.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, From)]
pub struct FixedProbe(pub HardwareTopology);

impl TopologyProbe for FixedProbe {
    #[inline]
    fn probe(&self) -> HardwareTopology {
        self.0
    }
}

/// Counts distinct physical package ids under sysfs.
#[cfg(target_os = "linux")]
fn count_chips() -> usize {
    use itertools::Itertools;

    let Ok(entries) = std::fs::read_dir("/sys/devices/system/cpu") else {
        return 0;
    };
    entries
        .filter_map(Result::ok)
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            name.strip_prefix("cpu")
                .is_some_and(|index| !index.is_empty() && index.bytes().all(|c| c.is_ascii_digit()))
        })
        .filter_map(|entry| {
            let path = entry.path().join("topology").join("physical_package_id");
            std::fs::read_to_string(path).ok()
        })
        .filter_map(|id| id.trim().parse::<i64>().ok())
        .filter(|&id| id >= 0)
        .unique()
        .count()
}

#[cfg(not(target_os = "linux"))]
fn count_chips() -> usize {
    0
}

#[cfg(test)]
mod tests {
    use super::{FixedProbe, HardwareTopology, SystemProbe, TopologyProbe};

    #[test]
    fn test_system_probe() {
        let topology = SystemProbe.probe();
        println!("{topology:?}");
        assert!(topology.logical_processors >= 1);
        assert_eq!(topology, SystemProbe.probe());
    }

    #[test]
    fn test_fixed_probe() {
        let topology = HardwareTopology {
            logical_processors: 96,
            cores: 48,
            chips: 2,
        };
        let probe = FixedProbe::from(topology);
        assert_eq!(probe.probe(), topology);
        assert_eq!(probe.probe(), probe.probe());
    }

    #[test]
    fn test_default_is_unknown() {
        let topology = HardwareTopology::default();
        assert_eq!(topology.logical_processors, 1);
        assert_eq!(topology.cores, 0);
        assert_eq!(topology.chips, 0);
    }
}
