//! The dedicated filter chain, managed through the `iptables` tool.
//!
//! All operations hold one async mutex for their full duration: the
//! command-line tool is not reentrant and the kernel xtables lock is
//! process-level.

use anyhow::{bail, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use crate::exec::{Exec, ExecOutput};

const IPTABLES_CMD: &str = "iptables";

/// Pause after a rule deletion. The kernel releases the rule's ipset
/// references asynchronously; destroying a set sooner fails with EBUSY.
const DELETE_SETTLE: Duration = Duration::from_secs(1);

/// Serialised façade over the `iptables` tool.
pub struct Firewall {
    exec: Arc<dyn Exec>,
    guard: Mutex<()>,
}

impl Firewall {
    pub fn new(exec: Arc<dyn Exec>) -> Self {
        Self {
            exec,
            guard: Mutex::new(()),
        }
    }

    /// Create the chain when absent. Returns whether it was created.
    ///
    /// User-defined chains carry no kernel policy; callers wanting
    /// default-deny append a terminal DROP rule instead.
    pub async fn ensure_chain(&self, table: &str, chain: &str, policy: &str) -> Result<bool> {
        let _guard = self.guard.lock().await;
        if self.chain_exists(table, chain)? {
            return Ok(false);
        }
        debug!(table, chain, policy, "creating chain");
        let out = self.run(&["-t", table, "-N", chain])?;
        if !out.success {
            bail!(
                "creating chain {} in table {} failed: {}",
                chain,
                table,
                out.combined()
            );
        }
        Ok(true)
    }

    /// Flush and delete the chain, if present.
    pub async fn delete_chain(&self, table: &str, chain: &str) -> Result<()> {
        let _guard = self.guard.lock().await;
        if !self.chain_exists(table, chain)? {
            return Ok(());
        }
        for flag in ["-F", "-X"] {
            let out = self.run(&["-t", table, flag, chain])?;
            if !out.success {
                bail!(
                    "deleting chain {} in table {} failed: {}",
                    chain,
                    table,
                    out.combined()
                );
            }
        }
        Ok(())
    }

    /// Insert the rule at the 1-based position unless an identical rule is
    /// already present anywhere in the chain. Returns whether it was
    /// inserted.
    pub async fn ensure_rule(
        &self,
        pos: usize,
        table: &str,
        chain: &str,
        rulespec: &[String],
    ) -> Result<bool> {
        let _guard = self.guard.lock().await;
        if self.rule_exists(table, chain, rulespec)? {
            debug!(table, chain, rule = ?rulespec, "rule already present");
            return Ok(false);
        }
        let mut args = vec![
            "-t".to_string(),
            table.to_string(),
            "-I".to_string(),
            chain.to_string(),
            pos.to_string(),
        ];
        args.extend(rulespec.iter().cloned());
        let out = self.exec.run(IPTABLES_CMD, &args)?;
        if !out.success {
            bail!(
                "inserting rule into chain {} in table {} failed: {}",
                chain,
                table,
                out.combined()
            );
        }
        debug!(table, chain, pos, rule = ?rulespec, "inserted rule");
        Ok(true)
    }

    /// Whether the exact rule is present in the chain.
    pub async fn check_rule(&self, table: &str, chain: &str, rulespec: &[String]) -> Result<bool> {
        let _guard = self.guard.lock().await;
        self.rule_exists(table, chain, rulespec)
    }

    /// Delete the rule if present, then wait for the kernel to settle.
    pub async fn delete_rule(&self, table: &str, chain: &str, rulespec: &[String]) -> Result<()> {
        let _guard = self.guard.lock().await;
        if !self.rule_exists(table, chain, rulespec)? {
            return Ok(());
        }
        let mut args = vec![
            "-t".to_string(),
            table.to_string(),
            "-D".to_string(),
            chain.to_string(),
        ];
        args.extend(rulespec.iter().cloned());
        let out = self.exec.run(IPTABLES_CMD, &args)?;
        if !out.success {
            bail!(
                "deleting rule in chain {} failed: {}",
                chain,
                out.combined()
            );
        }
        debug!(table, chain, rule = ?rulespec, "deleted rule");
        tokio::time::sleep(DELETE_SETTLE).await;
        Ok(())
    }

    fn chain_exists(&self, table: &str, chain: &str) -> Result<bool> {
        let out = self.run(&["-t", table, "-nL", chain])?;
        Ok(out.success)
    }

    fn rule_exists(&self, table: &str, chain: &str, rulespec: &[String]) -> Result<bool> {
        let mut args = vec![
            "-t".to_string(),
            table.to_string(),
            "-C".to_string(),
            chain.to_string(),
        ];
        args.extend(rulespec.iter().cloned());
        let out = self.exec.run(IPTABLES_CMD, &args)?;
        Ok(out.success)
    }

    fn run(&self, args: &[&str]) -> Result<ExecOutput> {
        self.exec.run(IPTABLES_CMD, &crate::exec::argv(args))
    }
}

/// Manipulating kernel state needs an effective UID of 0.
pub fn check_root() -> Result<()> {
    // SAFETY: geteuid reads the effective user ID; it has no preconditions
    // and cannot fail.
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        bail!("ipset and iptables require root privileges, run under sudo or as a root service");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::MockExec;

    fn rule(spec: &[&str]) -> Vec<String> {
        spec.iter().map(|s| s.to_string()).collect()
    }

    fn ok_output() -> ExecOutput {
        ExecOutput {
            success: true,
            code: Some(0),
            ..Default::default()
        }
    }

    fn failed_output(stderr: &str) -> ExecOutput {
        ExecOutput {
            stderr: stderr.to_string(),
            success: false,
            code: Some(1),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn ensure_chain_creates_when_absent() {
        let mut mock = MockExec::new();
        mock.expect_run()
            .withf(|_, args| args[2] == "-nL")
            .times(1)
            .returning(|_, _| Ok(failed_output("No chain/target/match by that name.")));
        mock.expect_run()
            .withf(|_, args| args == ["-t", "filter", "-N", "ipset-filter"])
            .times(1)
            .returning(|_, _| Ok(ok_output()));

        let fw = Firewall::new(Arc::new(mock));
        assert!(fw.ensure_chain("filter", "ipset-filter", "DROP").await.unwrap());
    }

    #[tokio::test]
    async fn ensure_chain_skips_when_present() {
        let mut mock = MockExec::new();
        mock.expect_run()
            .withf(|_, args| args[2] == "-nL")
            .times(1)
            .returning(|_, _| Ok(ok_output()));

        let fw = Firewall::new(Arc::new(mock));
        assert!(!fw.ensure_chain("filter", "ipset-filter", "DROP").await.unwrap());
    }

    #[tokio::test]
    async fn ensure_rule_inserts_at_position() {
        let spec = rule(&["-m", "set", "--match-set", "fc-US", "src", "-j", "RETURN"]);

        let mut mock = MockExec::new();
        mock.expect_run()
            .withf(|_, args| args[2] == "-C")
            .times(1)
            .returning(|_, _| Ok(failed_output("Bad rule")));
        mock.expect_run()
            .withf(|_, args| {
                args[..5] == ["-t", "filter", "-I", "ipset-filter", "2"]
                    && args[5..] == ["-m", "set", "--match-set", "fc-US", "src", "-j", "RETURN"]
            })
            .times(1)
            .returning(|_, _| Ok(ok_output()));

        let fw = Firewall::new(Arc::new(mock));
        assert!(fw.ensure_rule(2, "filter", "ipset-filter", &spec).await.unwrap());
    }

    #[tokio::test]
    async fn ensure_rule_is_idempotent() {
        let spec = rule(&["-j", "DROP"]);

        let mut mock = MockExec::new();
        // The presence check succeeds; no insert may follow.
        mock.expect_run()
            .withf(|_, args| args[2] == "-C")
            .times(1)
            .returning(|_, _| Ok(ok_output()));

        let fw = Firewall::new(Arc::new(mock));
        assert!(!fw.ensure_rule(1, "filter", "ipset-filter", &spec).await.unwrap());
    }

    #[tokio::test]
    async fn check_rule_reports_absence() {
        let mut mock = MockExec::new();
        mock.expect_run()
            .returning(|_, _| Ok(failed_output("Bad rule")));

        let fw = Firewall::new(Arc::new(mock));
        assert!(!fw
            .check_rule("filter", "ipset-filter", &rule(&["-j", "DROP"]))
            .await
            .unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn delete_rule_waits_for_settle() {
        let spec = rule(&["-j", "DROP"]);

        let mut mock = MockExec::new();
        mock.expect_run()
            .withf(|_, args| args[2] == "-C")
            .times(1)
            .returning(|_, _| Ok(ok_output()));
        mock.expect_run()
            .withf(|_, args| args[2] == "-D")
            .times(1)
            .returning(|_, _| Ok(ok_output()));

        let fw = Firewall::new(Arc::new(mock));
        let start = tokio::time::Instant::now();
        fw.delete_rule("filter", "ipset-filter", &spec).await.unwrap();
        assert!(start.elapsed() >= DELETE_SETTLE);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_rule_skips_absent_rule() {
        let mut mock = MockExec::new();
        // Only the presence check runs; no -D, no settle delay.
        mock.expect_run()
            .withf(|_, args| args[2] == "-C")
            .times(1)
            .returning(|_, _| Ok(failed_output("Bad rule")));

        let fw = Firewall::new(Arc::new(mock));
        let start = tokio::time::Instant::now();
        fw.delete_rule("filter", "ipset-filter", &rule(&["-j", "DROP"]))
            .await
            .unwrap();
        assert!(start.elapsed() < DELETE_SETTLE);
    }

    #[tokio::test]
    async fn delete_chain_flushes_then_removes() {
        let mut mock = MockExec::new();
        mock.expect_run()
            .withf(|_, args| args[2] == "-nL")
            .times(1)
            .returning(|_, _| Ok(ok_output()));
        mock.expect_run()
            .withf(|_, args| args == ["-t", "filter", "-F", "ipset-filter"])
            .times(1)
            .returning(|_, _| Ok(ok_output()));
        mock.expect_run()
            .withf(|_, args| args == ["-t", "filter", "-X", "ipset-filter"])
            .times(1)
            .returning(|_, _| Ok(ok_output()));

        let fw = Firewall::new(Arc::new(mock));
        fw.delete_chain("filter", "ipset-filter").await.unwrap();
    }
}
