//! Built-in reference subject for harness self-tests.
//!
//! Speaks the harness CLI contract: `role laddr lport msg_size raddr rport
//! iterations`, payload on stdin, one stdout record per iteration (client:
//! the echoed payload, server: the received byte count). The wire is a
//! selective-repeat window over UDP with a per-frame keystream XOR, so
//! payload bytes never appear in cleartext. A test fixture, not a real
//! protocol: just enough reliability and confidentiality to exercise the
//! harness's fault and capture matrix.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io::{Read, Write};
use std::net::UdpSocket;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Payload bytes per DATA frame.
const CHUNK: usize = 1200;
/// Max frames retransmitted per tick.
const WINDOW: usize = 512;
/// How long to collect ACKs before retransmitting outstanding frames.
const RETX_TICK: Duration = Duration::from_millis(20);
/// Consecutive ICMP-refused sends after which the peer is assumed to have
/// received everything and exited (it only closes its socket when done).
const REFUSED_LIMIT: u32 = 10;

const HEADER_LEN: usize = 13;
const KIND_DATA: u8 = 0;
const KIND_ACK: u8 = 1;

/// Fixed obfuscation key both ends derive per-frame keystreams from.
const WIRE_KEY: u64 = 0x6761_756e_746c_6574;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 7 {
        bail!("usage: <role> <laddr> <lport> <msg_size> <raddr> <rport> <iterations>");
    }
    let role = args[0].as_str();
    let laddr = args[1].as_str();
    let lport: u16 = args[2].parse().context("lport must be a port number")?;
    let msg_size: usize = args[3].parse().context("msg_size must be a byte count")?;
    let raddr = args[4].as_str();
    let rport: u16 = args[5].parse().context("rport must be a port number")?;
    let iterations: u32 = args[6].parse().context("iterations must be a count")?;
    if msg_size == 0 {
        bail!("msg_size must be positive");
    }

    let mut payload = Vec::new();
    std::io::stdin()
        .read_to_end(&mut payload)
        .context("reading payload from stdin")?;

    let socket = UdpSocket::bind((laddr, lport)).context("binding local endpoint")?;
    socket
        .connect((raddr, rport))
        .context("connecting remote endpoint")?;
    socket.set_read_timeout(Some(RETX_TICK))?;

    tracing::debug!(role, lport, rport, msg_size, iterations, "node up");

    let mut node = Node::new(socket, msg_size);
    let stdout = std::io::stdout();
    match role {
        "client" => {
            for _ in 0..iterations {
                node.send_message(&payload)?;
                let echoed = node.recv_message()?;
                let mut out = stdout.lock();
                out.write_all(&echoed)?;
                out.write_all(b"\n")?;
                out.flush()?;
            }
        }
        "server" => {
            for _ in 0..iterations {
                let msg = node.recv_message()?;
                let received = msg.len();
                node.send_message(&msg)?;
                let mut out = stdout.lock();
                writeln!(out, "{received}")?;
                out.flush()?;
            }
        }
        other => bail!("role must be client or server, got {other}"),
    }
    Ok(())
}

/// One endpoint of the echo conversation.
///
/// Rounds alternate direction: even rounds carry the client's message,
/// odd rounds the server's echo. Each `send_message`/`recv_message` call
/// consumes one round on both sides, keeping them in lockstep without a
/// handshake.
struct Node {
    socket: UdpSocket,
    msg_size: usize,
    round: u64,
    /// DATA frames for a future round that arrived while finishing the
    /// current one (the peer may run ahead once it has our full message).
    pending: VecDeque<(u64, u32, Vec<u8>)>,
    refused: u32,
    buf: Vec<u8>,
}

impl Node {
    fn new(socket: UdpSocket, msg_size: usize) -> Self {
        Self {
            socket,
            msg_size,
            round: 0,
            pending: VecDeque::new(),
            refused: 0,
            buf: vec![0u8; HEADER_LEN + CHUNK + 64],
        }
    }

    /// Transmit `msg` reliably: retransmit outstanding chunks every tick
    /// until each is acknowledged.
    fn send_message(&mut self, msg: &[u8]) -> Result<()> {
        let round = self.round;
        self.round += 1;
        let mut unacked: BTreeSet<u32> = (0..chunk_count(msg.len())).collect();
        self.refused = 0;

        while !unacked.is_empty() {
            let batch: Vec<u32> = unacked.iter().take(WINDOW).copied().collect();
            for seq in batch {
                self.send_data(round, seq, chunk(msg, seq))?;
            }
            let deadline = Instant::now() + RETX_TICK;
            while Instant::now() < deadline && !unacked.is_empty() {
                let Some((fr_round, kind, seq, body)) = self.recv_frame()? else {
                    break;
                };
                match kind {
                    KIND_ACK if fr_round == round => {
                        unacked.remove(&seq);
                    }
                    KIND_ACK => {} // stale ack from an earlier round
                    KIND_DATA if fr_round > round => {
                        // The peer is already replying; it cannot do that
                        // without our full message, so treat this as an
                        // implicit ACK of everything outstanding.
                        self.pending.push_back((fr_round, seq, body));
                        unacked.clear();
                    }
                    KIND_DATA => {
                        // The peer missed one of our earlier ACKs.
                        self.send_ack(fr_round, seq)?;
                    }
                    _ => {}
                }
            }
            if self.refused >= REFUSED_LIMIT {
                tracing::debug!(round, "peer socket closed, assuming delivery complete");
                break;
            }
        }
        Ok(())
    }

    /// Receive one `msg_size`-byte message, acknowledging every DATA frame.
    fn recv_message(&mut self) -> Result<Vec<u8>> {
        let round = self.round;
        self.round += 1;
        let nchunks = chunk_count(self.msg_size) as usize;
        let mut have: BTreeMap<u32, Vec<u8>> = BTreeMap::new();

        // Frames stashed by the preceding send phase may open this round.
        let stashed: Vec<_> = self.pending.drain(..).collect();
        for (fr_round, seq, body) in stashed {
            if fr_round == round {
                self.send_ack(round, seq)?;
                have.insert(seq, body);
            }
        }

        while have.len() < nchunks {
            let Some((fr_round, kind, seq, body)) = self.recv_frame()? else {
                continue;
            };
            if kind != KIND_DATA {
                continue;
            }
            if fr_round == round {
                self.send_ack(round, seq)?;
                have.entry(seq).or_insert(body);
            } else if fr_round < round {
                // Re-ACK: the sender of that round is waiting on a lost ACK.
                self.send_ack(fr_round, seq)?;
            } else {
                self.pending.push_back((fr_round, seq, body));
            }
        }

        let mut msg = Vec::with_capacity(self.msg_size);
        for (_, body) in have {
            msg.extend_from_slice(&body);
        }
        Ok(msg)
    }

    fn send_data(&mut self, round: u64, seq: u32, chunk: &[u8]) -> Result<()> {
        let mut frame = Vec::with_capacity(HEADER_LEN + chunk.len());
        frame.extend_from_slice(&round.to_be_bytes());
        frame.push(KIND_DATA);
        frame.extend_from_slice(&seq.to_be_bytes());
        frame.extend_from_slice(chunk);
        xor_keystream(round, seq, &mut frame[HEADER_LEN..]);
        self.send_frame(&frame)
    }

    fn send_ack(&mut self, round: u64, seq: u32) -> Result<()> {
        let mut frame = [0u8; HEADER_LEN];
        frame[0..8].copy_from_slice(&round.to_be_bytes());
        frame[8] = KIND_ACK;
        frame[9..13].copy_from_slice(&seq.to_be_bytes());
        self.send_frame(&frame)
    }

    fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        match self.socket.send(frame) {
            Ok(_) => Ok(()),
            // ICMP port unreachable bounces back on connected UDP sockets;
            // the peer may simply not be up yet, or already be done.
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                self.refused += 1;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn recv_frame(&mut self) -> Result<Option<(u64, u8, u32, Vec<u8>)>> {
        let n = match self.socket.recv(&mut self.buf) {
            Ok(n) => n,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Ok(None)
            }
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                self.refused += 1;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        if n < HEADER_LEN {
            return Ok(None);
        }
        self.refused = 0;
        let round = u64::from_be_bytes(self.buf[0..8].try_into()?);
        let kind = self.buf[8];
        let seq = u32::from_be_bytes(self.buf[9..13].try_into()?);
        let mut body = self.buf[HEADER_LEN..n].to_vec();
        if kind == KIND_DATA {
            xor_keystream(round, seq, &mut body);
        }
        Ok(Some((round, kind, seq, body)))
    }
}

fn chunk_count(len: usize) -> u32 {
    len.div_ceil(CHUNK).max(1) as u32
}

fn chunk(msg: &[u8], seq: u32) -> &[u8] {
    let start = seq as usize * CHUNK;
    &msg[start..msg.len().min(start + CHUNK)]
}

/// XOR `body` with a keystream derived from the wire key, round and seq.
/// Involutive, so the same call decrypts.
fn xor_keystream(round: u64, seq: u32, body: &mut [u8]) {
    let seed = WIRE_KEY
        ^ round.rotate_left(17)
        ^ u64::from(seq).wrapping_mul(0x9e37_79b9_7f4a_7c15);
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut keystream = vec![0u8; body.len()];
    rng.fill_bytes(&mut keystream);
    for (b, k) in body.iter_mut().zip(keystream) {
        *b ^= k;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keystream_xor_round_trips() {
        let original = b"attack at dawn".to_vec();
        let mut wire = original.clone();
        xor_keystream(3, 7, &mut wire);
        assert_ne!(wire, original);
        xor_keystream(3, 7, &mut wire);
        assert_eq!(wire, original);
    }

    #[test]
    fn keystreams_differ_per_frame() {
        let mut a = vec![0u8; 32];
        let mut b = vec![0u8; 32];
        xor_keystream(0, 0, &mut a);
        xor_keystream(0, 1, &mut b);
        assert_ne!(a, b);
    }

    #[test]
    fn chunking_covers_the_message_exactly() {
        let msg: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
        let n = chunk_count(msg.len());
        assert_eq!(n, 3);
        let total: usize = (0..n).map(|seq| chunk(&msg, seq).len()).sum();
        assert_eq!(total, msg.len());
        assert_eq!(chunk(&msg, 2).len(), 600);
    }

    #[test]
    fn tiny_messages_are_one_chunk() {
        assert_eq!(chunk_count(1), 1);
        assert_eq!(chunk_count(CHUNK), 1);
        assert_eq!(chunk_count(CHUNK + 1), 2);
    }
}
