//! Environment probes for the privileged integration tests.

use std::process::Command;

/// Whether `tc` can actually shape loopback traffic here, directly or
/// through passwordless sudo. Returns `false` on environments where the
/// netem tests should be skipped.
pub fn can_shape_traffic() -> bool {
    tool_exists("tc", "-V") && privileged()
}

/// Whether tcpdump is present and loopback capture is permitted.
pub fn can_capture() -> bool {
    tool_exists("tcpdump", "--version") && privileged()
}

fn privileged() -> bool {
    // SAFETY: geteuid has no preconditions.
    if unsafe { libc::geteuid() } == 0 {
        return true;
    }
    matches!(
        Command::new("sudo").args(["-n", "true"]).output(),
        Ok(out) if out.status.success()
    )
}

fn tool_exists(name: &str, version_flag: &str) -> bool {
    Command::new(name)
        .arg(version_flag)
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}
