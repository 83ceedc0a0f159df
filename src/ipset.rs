//! Kernel set management through the `ipset` command-line tool.

use anyhow::{bail, Result};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, info};

use crate::exec::{argv, Exec};

const IPSET_CMD: &str = "ipset";

const DEFAULT_SET_TYPE: &str = "hash:net";
const DEFAULT_FAMILY: &str = "inet";
const DEFAULT_HASH_SIZE: u32 = 1024;
const DEFAULT_MAX_ELEM: u32 = 65536;

/// Parameters of a kernel set. `new` fills the defaults used for every
/// country set: `hash:net`, IPv4, hashsize 1024, maxelem 65536.
#[derive(Debug, Clone)]
pub struct SetSpec {
    pub name: String,
    pub set_type: String,
    pub family: String,
    pub hash_size: u32,
    pub max_elem: u32,
}

impl SetSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            set_type: DEFAULT_SET_TYPE.to_string(),
            family: DEFAULT_FAMILY.to_string(),
            hash_size: DEFAULT_HASH_SIZE,
            max_elem: DEFAULT_MAX_ELEM,
        }
    }

    fn create_args(&self) -> Vec<String> {
        vec![
            "create".to_string(),
            self.name.clone(),
            self.set_type.clone(),
            "family".to_string(),
            self.family.clone(),
            "hashsize".to_string(),
            self.hash_size.to_string(),
            "maxelem".to_string(),
            self.max_elem.to_string(),
        ]
    }
}

/// Stateless façade over the `ipset` tool.
pub struct IpSet {
    exec: Arc<dyn Exec>,
}

impl IpSet {
    pub fn new(exec: Arc<dyn Exec>) -> Self {
        Self { exec }
    }

    /// All set names known to the kernel. The reconciler's LiveSets snapshot
    /// is built exclusively from this call.
    pub fn list_sets(&self) -> Result<Vec<String>> {
        let out = self.exec.run(IPSET_CMD, &argv(&["list", "-n"]))?;
        if !out.success {
            bail!("listing sets failed: {}", out.combined());
        }
        Ok(out
            .stdout
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Bulk-create a set from a single restore stream. With `ignore_exist`
    /// the kernel accepts a create for a set that is already present.
    pub fn restore_set(&self, entries: &[String], spec: &SetSpec, ignore_exist: bool) -> Result<()> {
        let script = restore_script(entries, spec);
        let args = if ignore_exist {
            argv(&["-exist", "restore"])
        } else {
            argv(&["restore"])
        };
        let out = self.exec.run_with_stdin(IPSET_CMD, &args, &script)?;
        if !out.success {
            bail!("restore of set {} failed: {}", spec.name, out.combined());
        }
        debug!(set = %spec.name, entries = entries.len(), "restored set");
        Ok(())
    }

    /// Atomically exchange the contents of two same-typed sets.
    pub fn swap_sets(&self, tmp: &str, target: &str) -> Result<()> {
        let out = self.exec.run(IPSET_CMD, &argv(&["swap", tmp, target]))?;
        if !out.success {
            bail!("swap of {} and {} failed: {}", tmp, target, out.combined());
        }
        Ok(())
    }

    /// Delete all entries from a set.
    pub fn flush_set(&self, name: &str) -> Result<()> {
        let out = self.exec.run(IPSET_CMD, &argv(&["flush", name]))?;
        if !out.success {
            bail!("flush of set {} failed: {}", name, out.combined());
        }
        Ok(())
    }

    /// Delete a set. Fails while any rule still references it.
    pub fn destroy_set(&self, name: &str) -> Result<()> {
        let out = self.exec.run(IPSET_CMD, &argv(&["destroy", name]))?;
        if !out.success {
            bail!("destroy of set {} failed: {}", name, out.combined());
        }
        Ok(())
    }

    /// Create an empty set.
    pub fn create_set(&self, spec: &SetSpec, ignore_exist: bool) -> Result<()> {
        let mut args = spec.create_args();
        if ignore_exist {
            args.push("-exist".to_string());
        }
        let out = self.exec.run(IPSET_CMD, &args)?;
        if !out.success {
            bail!("create of set {} failed: {}", spec.name, out.combined());
        }
        Ok(())
    }

    /// Add a single entry to a set.
    pub fn add_entry(&self, entry: &str, set: &str, ignore_exist: bool) -> Result<()> {
        let mut args = argv(&["add", set, entry]);
        if ignore_exist {
            args.push("-exist".to_string());
        }
        let out = self.exec.run(IPSET_CMD, &args)?;
        if !out.success {
            bail!("adding {} to set {} failed: {}", entry, set, out.combined());
        }
        Ok(())
    }

    /// Delete a single entry from a set.
    pub fn del_entry(&self, entry: &str, set: &str) -> Result<()> {
        let out = self.exec.run(IPSET_CMD, &argv(&["del", set, entry]))?;
        if !out.success {
            bail!(
                "deleting {} from set {} failed: {}",
                entry,
                set,
                out.combined()
            );
        }
        Ok(())
    }

    /// Whether an entry is in a set.
    pub fn test_entry(&self, entry: &str, set: &str) -> Result<bool> {
        let out = self.exec.run(IPSET_CMD, &argv(&["test", set, entry]))?;
        if out.success {
            return Ok(true);
        }
        if out.combined().contains("is NOT in set") {
            return Ok(false);
        }
        bail!("testing {} in set {} failed: {}", entry, set, out.combined())
    }

    /// Current members of a set.
    pub fn list_entries(&self, set: &str) -> Result<Vec<String>> {
        if set.is_empty() {
            bail!("set name cannot be empty");
        }
        let out = self.exec.run(IPSET_CMD, &argv(&["list", set]))?;
        if !out.success {
            bail!("listing set {} failed: {}", set, out.combined());
        }
        Ok(out
            .stdout
            .lines()
            .skip_while(|line| !line.starts_with("Members:"))
            .skip(1)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}

/// Render the restore stream: one `create` directive followed by one `add`
/// per entry. The kernel `hash:net` type rejects the universal prefix, so
/// `0.0.0.0/0` becomes the two halves of the address space.
fn restore_script(entries: &[String], spec: &SetSpec) -> String {
    let mut script = String::new();
    let _ = writeln!(script, "{}", spec.create_args().join(" "));
    for cidr in entries {
        if cidr == "0.0.0.0/0" {
            info!("replacing 0.0.0.0/0 with its two halves (hash:net limitation)");
            let _ = writeln!(script, "add {} 0.0.0.0/1", spec.name);
            let _ = writeln!(script, "add {} 128.0.0.0/1", spec.name);
            continue;
        }
        let _ = writeln!(script, "add {} {}", spec.name, cidr);
    }
    script
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn cidr_strategy() -> impl Strategy<Value = String> {
        (0u8..=255, 0u8..=255, 0u8..=255, 0u8..=255, 1u8..=32)
            .prop_map(|(a, b, c, d, len)| format!("{}.{}.{}.{}/{}", a, b, c, d, len))
    }

    proptest! {
        /// Every entry lands in the script exactly once, after the create line.
        #[test]
        fn script_contains_every_entry(cidrs in prop::collection::vec(cidr_strategy(), 0..50)) {
            let entries: Vec<String> = cidrs;
            let spec = SetSpec::new("fc-XX");
            let script = restore_script(&entries, &spec);
            let lines: Vec<&str> = script.lines().collect();
            prop_assert!(lines[0].starts_with("create fc-XX"));
            for cidr in &entries {
                let needle = format!("add fc-XX {}", cidr);
                prop_assert!(script.contains(&needle));
            }
        }

        /// Line count is 1 + entries, with the universal prefix costing two.
        #[test]
        fn script_line_count(cidrs in prop::collection::vec(cidr_strategy(), 0..50), universal in 0usize..3) {
            let mut entries: Vec<String> = cidrs;
            for _ in 0..universal {
                entries.push("0.0.0.0/0".to_string());
            }
            let script = restore_script(&entries, &SetSpec::new("fc-XX"));
            let expected = 1 + (entries.len() - universal) + 2 * universal;
            prop_assert_eq!(script.lines().count(), expected);
        }
    }
}
