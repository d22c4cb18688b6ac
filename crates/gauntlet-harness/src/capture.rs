//! Passive loopback capture and offline confidentiality inspection.
//!
//! Live capture is delegated to `tcpdump` writing a classic-pcap artifact;
//! once the window closes the artifact is walked record by record. Only
//! IPv4/UDP datagrams come back; anything else in the capture is skipped.
//! No capture library is linked — the offline pass is a plain byte walk.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use bytes::Bytes;
use tokio::process::{Child, Command};
use tokio::time::{self, Instant};

use crate::error::HarnessError;

/// One captured UDP datagram.
#[derive(Debug, Clone)]
pub struct CapturedDatagram {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: Bytes,
}

/// Startup slack given to tcpdump to attach its filter before the trial
/// starts sending, doubling as the window in which a refused unprivileged
/// capture is detected and retried under sudo.
const STARTUP_DELAY: Duration = Duration::from_millis(300);

/// Grace between SIGINT to tcpdump and a hard kill.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// A live capture window on the loopback interface.
///
/// Runs as an independent listener on its own clock, concurrent with the
/// trial; [`finish`](CaptureSession::finish) waits out the remainder of the
/// window, stops tcpdump and decodes the artifact. The session is one-shot:
/// a second verification needs a new session.
pub struct CaptureSession {
    child: Child,
    artifact: PathBuf,
    deadline: Instant,
}

impl CaptureSession {
    /// Start capturing `udp port a or udp port b` on loopback into `artifact`.
    pub async fn start(
        artifact: PathBuf,
        ports: (u16, u16),
        window: Duration,
    ) -> Result<Self, HarnessError> {
        let filter = [
            "udp".to_string(),
            "port".to_string(),
            ports.0.to_string(),
            "or".to_string(),
            "udp".to_string(),
            "port".to_string(),
            ports.1.to_string(),
        ];

        let mut child = spawn_tcpdump(&artifact, &filter, false)?;
        time::sleep(STARTUP_DELAY).await;
        if exited_early(&mut child) {
            tracing::debug!("unprivileged tcpdump refused, retrying with sudo");
            child = spawn_tcpdump(&artifact, &filter, true)?;
            time::sleep(STARTUP_DELAY).await;
            if exited_early(&mut child) {
                return Err(HarnessError::Capture(
                    "tcpdump exited at startup, unprivileged and under sudo".into(),
                ));
            }
        }
        tracing::debug!(artifact = %artifact.display(), ?window, "capture window open");
        Ok(Self {
            child,
            artifact,
            deadline: Instant::now() + window,
        })
    }

    pub fn artifact(&self) -> &Path {
        &self.artifact
    }

    /// Wait for the window to elapse, stop the capture and decode the
    /// artifact into its finite datagram sequence.
    pub async fn finish(mut self) -> Result<Vec<CapturedDatagram>, HarnessError> {
        time::sleep_until(self.deadline).await;
        if let Some(pid) = self.child.id() {
            // SAFETY: tcpdump is our own child; SIGINT makes it flush and
            // close the artifact. ESRCH if it already exited.
            let _ = unsafe { libc::kill(pid as libc::pid_t, libc::SIGINT) };
        }
        if time::timeout(STOP_GRACE, self.child.wait()).await.is_err() {
            tracing::warn!("tcpdump ignored SIGINT, killing");
            let _ = self.child.kill().await;
        }
        let raw = tokio::fs::read(&self.artifact).await?;
        let datagrams = read_datagrams(&raw)?;
        tracing::debug!(count = datagrams.len(), "capture window decoded");
        Ok(datagrams)
    }
}

fn exited_early(child: &mut Child) -> bool {
    matches!(child.try_wait(), Ok(Some(status)) if !status.success())
}

fn spawn_tcpdump(artifact: &Path, filter: &[String], sudo: bool) -> Result<Child, HarnessError> {
    let mut cmd = if sudo {
        let mut c = Command::new("sudo");
        c.arg("tcpdump");
        c
    } else {
        Command::new("tcpdump")
    };
    cmd.args(["-i", "lo", "-U", "-w"])
        .arg(artifact)
        .args(filter)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            HarnessError::Capture("tcpdump not found".into())
        } else {
            HarnessError::Io(e)
        }
    })
}

/// True when `pattern` occurs as a byte substring of `haystack`.
pub fn contains_pattern(haystack: &[u8], pattern: &[u8]) -> bool {
    !pattern.is_empty()
        && haystack.len() >= pattern.len()
        && haystack.windows(pattern.len()).any(|w| w == pattern)
}

// ── pcap decoding ───────────────────────────────────────────────────

const MAGIC_US: u32 = 0xa1b2_c3d4;
const MAGIC_NS: u32 = 0xa1b2_3c4d;

/// Decode every IPv4/UDP datagram in a classic-pcap byte buffer.
///
/// Handles both file endiannesses, microsecond and nanosecond timestamp
/// flavors, and the link layers tcpdump produces on loopback (Ethernet,
/// Linux SLL/SLL2, BSD null). A truncated tail record ends the walk.
pub fn read_datagrams(raw: &[u8]) -> Result<Vec<CapturedDatagram>, HarnessError> {
    if raw.len() < 24 {
        return Err(HarnessError::Capture(
            "artifact too short for a pcap header".into(),
        ));
    }
    let magic_le = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
    let magic_be = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
    let little = if magic_le == MAGIC_US || magic_le == MAGIC_NS {
        true
    } else if magic_be == MAGIC_US || magic_be == MAGIC_NS {
        false
    } else {
        return Err(HarnessError::Capture(format!(
            "unrecognized pcap magic {magic_le:#010x}"
        )));
    };
    let read_u32 = |b: &[u8], off: usize| -> u32 {
        let quad = [b[off], b[off + 1], b[off + 2], b[off + 3]];
        if little {
            u32::from_le_bytes(quad)
        } else {
            u32::from_be_bytes(quad)
        }
    };
    let linktype = read_u32(raw, 20);

    let data = Bytes::copy_from_slice(&raw[24..]);
    let mut datagrams = Vec::new();
    let mut off = 0usize;
    while data.len() - off >= 16 {
        let incl = read_u32(&data, off + 8) as usize;
        off += 16;
        if data.len() - off < incl {
            break;
        }
        let frame = data.slice(off..off + incl);
        off += incl;
        if let Some(datagram) = decode_udp(&frame, linktype) {
            datagrams.push(datagram);
        }
    }
    Ok(datagrams)
}

/// Offset of the IPv4 header within a frame, or `None` when the frame is not
/// IPv4 or the link layer is one we don't understand.
fn ip_offset(frame: &[u8], linktype: u32) -> Option<usize> {
    match linktype {
        // EN10MB: ethertype at 12..14
        1 => (frame.len() >= 14 && frame[12..14] == [0x08, 0x00]).then_some(14),
        // LINUX_SLL: protocol at 14..16
        113 => (frame.len() >= 16 && frame[14..16] == [0x08, 0x00]).then_some(16),
        // LINUX_SLL2: protocol first
        276 => (frame.len() >= 20 && frame[0..2] == [0x08, 0x00]).then_some(20),
        // BSD null/loopback: 4-byte AF_INET in unspecified byte order
        0 | 108 => (frame.len() >= 4 && (frame[0] == 2 || frame[3] == 2)).then_some(4),
        _ => None,
    }
}

fn decode_udp(frame: &Bytes, linktype: u32) -> Option<CapturedDatagram> {
    let ip_off = ip_offset(frame, linktype)?;
    let ip = frame.get(ip_off..)?;
    if ip.len() < 20 || ip[0] >> 4 != 4 {
        return None;
    }
    let ihl = usize::from(ip[0] & 0x0f) * 4;
    if ip[9] != 17 || ip.len() < ihl + 8 {
        return None;
    }
    let udp = &ip[ihl..];
    let src_port = u16::from_be_bytes([udp[0], udp[1]]);
    let dst_port = u16::from_be_bytes([udp[2], udp[3]]);
    let udp_len = usize::from(u16::from_be_bytes([udp[4], udp[5]]));
    let payload_len = udp_len.saturating_sub(8).min(udp.len() - 8);
    let start = ip_off + ihl + 8;
    Some(CapturedDatagram {
        src_port,
        dst_port,
        payload: frame.slice(start..start + payload_len),
    })
}
