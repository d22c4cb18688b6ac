//! Scoped loopback traffic shaping via `tc netem`.
//!
//! One composite rule per trial, installed with `qdisc replace` so it never
//! stacks on a leftover rule, and removed by an RAII guard on every exit
//! path. The rule shapes *all* loopback traffic on the host, not just the
//! trial's two ports: trials with different active profiles must be
//! serialized externally.

use std::process::Command;

use crate::error::HarnessError;

/// Fault probabilities for one trial, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FaultProfile {
    pub loss: f64,
    pub duplicate: f64,
    pub reorder: f64,
}

/// Delay paired with the reorder knob; netem cannot reorder without
/// holding some packets back.
const REORDER_DELAY_MS: u32 = 10;

const INTERFACE: &str = "lo";

impl FaultProfile {
    pub fn new(loss: f64, duplicate: f64, reorder: f64) -> Self {
        Self {
            loss,
            duplicate,
            reorder,
        }
    }

    pub fn loss(p: f64) -> Self {
        Self {
            loss: p,
            ..Default::default()
        }
    }

    pub fn duplicate(p: f64) -> Self {
        Self {
            duplicate: p,
            ..Default::default()
        }
    }

    /// Install this profile on the loopback interface.
    ///
    /// Tries an unprivileged `tc` first and retries once under sudo; if both
    /// are refused the trial is aborted before any process spawns. The
    /// returned guard removes the rule when dropped.
    pub fn apply(&self) -> Result<NetemGuard, HarnessError> {
        run_tc(&self.replace_args()).map_err(HarnessError::FaultInjection)?;
        tracing::info!(
            loss = self.loss,
            duplicate = self.duplicate,
            reorder = self.reorder,
            "applied loopback netem profile"
        );
        Ok(NetemGuard { _private: () })
    }

    /// `tc` arguments for the composite replace rule.
    fn replace_args(&self) -> Vec<String> {
        let mut args: Vec<String> = ["qdisc", "replace", "dev", INTERFACE, "root", "netem"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.push("loss".into());
        args.push(percent(self.loss));
        args.push("duplicate".into());
        args.push(percent(self.duplicate));
        if self.reorder > 0.0 {
            // netem's reorder percentage counts packets sent *immediately*,
            // so probability p maps to `reorder (1 - p)`.
            args.push("reorder".into());
            args.push(percent(1.0 - self.reorder));
            args.push("delay".into());
            args.push(format!("{REORDER_DELAY_MS}ms"));
        }
        args
    }
}

fn percent(p: f64) -> String {
    format!("{}%", p * 100.0)
}

fn delete_args() -> Vec<String> {
    ["qdisc", "del", "dev", INTERFACE, "root"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Run `tc` with the given args, retrying once under sudo when the
/// unprivileged invocation is refused.
fn run_tc(args: &[String]) -> Result<(), String> {
    if let Ok(out) = Command::new("tc").args(args).output() {
        if out.status.success() {
            return Ok(());
        }
    }
    match Command::new("sudo").arg("tc").args(args).output() {
        Ok(out) if out.status.success() => Ok(()),
        Ok(out) => Err(format!(
            "tc {}: {}",
            args.join(" "),
            String::from_utf8_lossy(&out.stderr).trim()
        )),
        Err(e) => Err(format!("tc unavailable: {e}")),
    }
}

/// Removes the loopback netem rule when dropped.
///
/// Dropping is the only way out, so the revert runs exactly once per applied
/// profile, on success, error, and panic paths alike.
#[derive(Debug)]
pub struct NetemGuard {
    _private: (),
}

impl Drop for NetemGuard {
    fn drop(&mut self) {
        match run_tc(&delete_args()) {
            Ok(()) => tracing::debug!("removed loopback netem rule"),
            Err(e) => tracing::warn!(error = %e, "failed to remove loopback netem rule"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joined(profile: &FaultProfile) -> String {
        profile.replace_args().join(" ")
    }

    #[test]
    fn loss_and_duplicate_form_one_composite_rule() {
        let profile = FaultProfile::new(0.1, 0.02, 0.0);
        assert_eq!(
            joined(&profile),
            "qdisc replace dev lo root netem loss 10% duplicate 2%"
        );
    }

    #[test]
    fn reorder_adds_inverted_percentage_and_fixed_delay() {
        let profile = FaultProfile::new(0.02, 0.02, 0.01);
        assert_eq!(
            joined(&profile),
            "qdisc replace dev lo root netem loss 2% duplicate 2% reorder 99% delay 10ms"
        );
    }

    #[test]
    fn zero_reorder_emits_no_delay() {
        let profile = FaultProfile::loss(0.5);
        assert!(!joined(&profile).contains("delay"));
        assert!(!joined(&profile).contains("reorder"));
    }

    #[test]
    fn delete_targets_the_loopback_root() {
        assert_eq!(delete_args().join(" "), "qdisc del dev lo root");
    }
}
