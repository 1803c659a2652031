//! TCP socket transport.
//!
//! Rank 0 hosts a rendezvous at the master address: every other rank checks
//! in over a control connection, rank 0 assembles a roster of ring addresses
//! and broadcasts it, then each rank links to its ring successor. Barriers
//! run as a two-phase gather/ack through rank 0; all-reduce moves data
//! around the ring (scatter-reduce, then allgather).

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::device::Buffer;
use crate::error::{BenchError, Result};
use crate::group::{ReduceOp, Transport};
use crate::session::SessionConfig;

/// How long a non-zero rank keeps retrying the master before giving up.
const CONNECT_DEADLINE: Duration = Duration::from_secs(60);
const CONNECT_RETRY: Duration = Duration::from_millis(200);
/// Control frames are tiny; anything bigger than this is a framing bug.
const MAX_CONTROL_FRAME: usize = 1 << 20;

#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    rank: usize,
    ring_port: u16,
}

#[derive(Debug, Serialize, Deserialize)]
struct Roster {
    peers: Vec<SocketAddr>,
}

pub struct SocketTransport {
    rank: usize,
    world_size: usize,
    epoch: u64,
    /// Rank 0 holds one stream per non-zero rank (index `r - 1`); every
    /// other rank holds a single stream to rank 0.
    control: Vec<TcpStream>,
    next_tx: Option<TcpStream>,
    prev_rx: Option<TcpStream>,
}

impl SocketTransport {
    /// Establish group membership for this process.
    ///
    /// Blocks until every member has checked in and the ring links are up.
    /// A `world_size == 1` session opens no sockets at all.
    pub fn establish(config: &SessionConfig) -> Result<Self> {
        let world_size = config.world_size;
        let rank = config.global_rank;
        if world_size == 1 {
            return Ok(SocketTransport {
                rank,
                world_size,
                epoch: 0,
                control: Vec::new(),
                next_tx: None,
                prev_rx: None,
            });
        }

        let master = resolve_master(&config.master_addr, config.master_port)?;
        let ring_listener = TcpListener::bind(("0.0.0.0", 0))
            .map_err(|err| BenchError::transport(format!("bind ring listener: {err}")))?;
        let ring_port = ring_listener
            .local_addr()
            .map_err(|err| BenchError::transport(format!("query ring listener: {err}")))?
            .port();

        let (control, roster) = if rank == 0 {
            rendezvous_host(master, ring_port, world_size)?
        } else {
            rendezvous_join(master, rank, ring_port)?
        };
        if roster.peers.len() != world_size {
            return Err(BenchError::transport(format!(
                "roster carries {} peers for a group of {world_size}",
                roster.peers.len()
            )));
        }
        debug!(rank, world_size, "rendezvous complete");

        // Every listener already exists, so connecting to the successor
        // before accepting from the predecessor cannot deadlock.
        let next = (rank + 1) % world_size;
        let next_tx = connect_with_retry(roster.peers[next])?;
        let (prev_rx, _) = ring_listener
            .accept()
            .map_err(|err| BenchError::transport(format!("accept ring predecessor: {err}")))?;
        prev_rx.set_nodelay(true).ok();
        debug!(rank, next, "ring links established");

        Ok(SocketTransport {
            rank,
            world_size,
            epoch: 0,
            control,
            next_tx: Some(next_tx),
            prev_rx: Some(prev_rx),
        })
    }
}

fn rendezvous_host(
    master: SocketAddr,
    ring_port: u16,
    world_size: usize,
) -> Result<(Vec<TcpStream>, Roster)> {
    let listener = TcpListener::bind(master)
        .map_err(|err| BenchError::transport(format!("bind master {master}: {err}")))?;

    let mut control: Vec<Option<TcpStream>> = (1..world_size).map(|_| None).collect();
    let mut peers: Vec<Option<SocketAddr>> = vec![None; world_size];
    peers[0] = Some(SocketAddr::new(master.ip(), ring_port));

    for _ in 1..world_size {
        let (mut stream, peer_addr) = listener
            .accept()
            .map_err(|err| BenchError::transport(format!("accept member: {err}")))?;
        stream.set_nodelay(true).ok();
        let hello: Hello = read_frame(&mut stream)?;
        if hello.rank == 0 || hello.rank >= world_size {
            return Err(BenchError::transport(format!(
                "rendezvous hello carries invalid rank {} for a group of {world_size}",
                hello.rank
            )));
        }
        if peers[hello.rank].is_some() {
            return Err(BenchError::transport(format!(
                "rank {} checked in twice",
                hello.rank
            )));
        }
        peers[hello.rank] = Some(SocketAddr::new(peer_addr.ip(), hello.ring_port));
        control[hello.rank - 1] = Some(stream);
    }

    let peers: Vec<SocketAddr> = peers.into_iter().flatten().collect();
    let roster = Roster { peers };
    let mut streams = Vec::with_capacity(world_size - 1);
    for stream in control.into_iter().flatten() {
        streams.push(stream);
    }
    for stream in &mut streams {
        write_frame(stream, &roster)?;
    }
    Ok((streams, roster))
}

fn rendezvous_join(
    master: SocketAddr,
    rank: usize,
    ring_port: u16,
) -> Result<(Vec<TcpStream>, Roster)> {
    let mut stream = connect_with_retry(master)?;
    write_frame(&mut stream, &Hello { rank, ring_port })?;
    let roster: Roster = read_frame(&mut stream)?;
    Ok((vec![stream], roster))
}

impl Transport for SocketTransport {
    fn world_size(&self) -> usize {
        self.world_size
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn barrier(&mut self) -> Result<()> {
        if self.world_size <= 1 {
            return Ok(());
        }
        if self.control.is_empty() {
            return Err(BenchError::transport("control links closed"));
        }
        self.epoch += 1;
        let epoch = self.epoch;
        if self.rank == 0 {
            for stream in &mut self.control {
                let seen = read_u64(stream)?;
                if seen != epoch {
                    return Err(BenchError::transport(format!(
                        "barrier epoch mismatch: expected {epoch}, peer sent {seen}"
                    )));
                }
            }
            for stream in &mut self.control {
                write_u64(stream, epoch)?;
            }
        } else {
            let stream = &mut self.control[0];
            write_u64(stream, epoch)?;
            let ack = read_u64(stream)?;
            if ack != epoch {
                return Err(BenchError::transport(format!(
                    "barrier epoch mismatch: expected ack {epoch}, got {ack}"
                )));
            }
        }
        Ok(())
    }

    /// Ring all-reduce: `world - 1` scatter-reduce rounds, then `world - 1`
    /// allgather rounds. Chunks are near-equal; the first
    /// `element_count % world` chunks carry one extra element.
    fn all_reduce(&mut self, buffer: &mut Buffer, op: ReduceOp) -> Result<()> {
        let ReduceOp::Sum = op;
        let world = self.world_size;
        if world <= 1 {
            return Ok(());
        }
        let rank = self.rank;
        let elem = buffer.dtype().size_in_bytes();
        let count = buffer.element_count();
        let base = count / world;
        let remainder = count % world;
        let chunk_count = |i: usize| base + usize::from(i < remainder);
        let chunk_offset = |i: usize| i * base + i.min(remainder);

        let next_tx = self
            .next_tx
            .as_mut()
            .ok_or_else(|| BenchError::transport("ring successor link missing"))?;
        let prev_rx = self
            .prev_rx
            .as_mut()
            .ok_or_else(|| BenchError::transport("ring predecessor link missing"))?;

        // Phase 1: scatter-reduce.
        for step in 0..world - 1 {
            let send_idx = (rank + world - step) % world;
            let recv_idx = (rank + world - step - 1) % world;
            let send_off = chunk_offset(send_idx) * elem;
            let send_len = chunk_count(send_idx) * elem;
            let recv_off = chunk_offset(recv_idx) * elem;
            let recv_len = chunk_count(recv_idx) * elem;

            let send_data = buffer.bytes()[send_off..send_off + send_len].to_vec();
            let mut recv_data = vec![0u8; recv_len];
            exchange(next_tx, prev_rx, &send_data, &mut recv_data)?;
            buffer.sum_bytes_at(recv_off, &recv_data)?;
        }

        // Phase 2: allgather. After scatter-reduce, rank r's fully reduced
        // chunk sits at index (r + 1) % world; forward it around the ring.
        for step in 0..world - 1 {
            let send_idx = (rank + world + 1 - step) % world;
            let recv_idx = (rank + world - step) % world;
            let send_off = chunk_offset(send_idx) * elem;
            let send_len = chunk_count(send_idx) * elem;
            let recv_off = chunk_offset(recv_idx) * elem;
            let recv_len = chunk_count(recv_idx) * elem;

            let send_data = buffer.bytes()[send_off..send_off + send_len].to_vec();
            let mut recv_data = vec![0u8; recv_len];
            exchange(next_tx, prev_rx, &send_data, &mut recv_data)?;
            buffer.bytes_mut()[recv_off..recv_off + recv_len].copy_from_slice(&recv_data);
        }
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        self.next_tx = None;
        self.prev_rx = None;
        self.control.clear();
        Ok(())
    }
}

/// Send to the successor while receiving from the predecessor. The send runs
/// on a scoped thread so two mutually-blocked writers cannot deadlock.
fn exchange(
    next_tx: &mut TcpStream,
    prev_rx: &mut TcpStream,
    send: &[u8],
    recv: &mut [u8],
) -> Result<()> {
    std::thread::scope(|scope| -> Result<()> {
        let sender = scope.spawn(|| -> Result<()> {
            next_tx
                .write_all(send)
                .map_err(|err| BenchError::transport(format!("ring send: {err}")))?;
            next_tx
                .flush()
                .map_err(|err| BenchError::transport(format!("ring send: {err}")))
        });
        let recv_result = prev_rx
            .read_exact(recv)
            .map_err(|err| BenchError::transport(format!("ring recv: {err}")));
        let send_result = sender
            .join()
            .map_err(|_| BenchError::transport("ring send thread panicked"))?;
        recv_result?;
        send_result
    })
}

fn resolve_master(addr: &str, port: u16) -> Result<SocketAddr> {
    (addr, port)
        .to_socket_addrs()
        .map_err(|err| BenchError::config(format!("cannot resolve MASTER_ADDR {addr:?}: {err}")))?
        .next()
        .ok_or_else(|| {
            BenchError::config(format!("MASTER_ADDR {addr:?} resolved to no addresses"))
        })
}

fn connect_with_retry(addr: SocketAddr) -> Result<TcpStream> {
    let deadline = Instant::now() + CONNECT_DEADLINE;
    loop {
        match TcpStream::connect_timeout(&addr, CONNECT_RETRY) {
            Ok(stream) => {
                stream.set_nodelay(true).ok();
                return Ok(stream);
            }
            Err(err) => {
                if Instant::now() >= deadline {
                    return Err(BenchError::transport(format!("connect to {addr}: {err}")));
                }
                std::thread::sleep(CONNECT_RETRY);
            }
        }
    }
}

fn write_frame<T: Serialize>(stream: &mut TcpStream, value: &T) -> Result<()> {
    let body = serde_json::to_vec(value)
        .map_err(|err| BenchError::transport(format!("encode control frame: {err}")))?;
    stream
        .write_all(&(body.len() as u32).to_le_bytes())
        .and_then(|()| stream.write_all(&body))
        .and_then(|()| stream.flush())
        .map_err(|err| BenchError::transport(format!("send control frame: {err}")))
}

fn read_frame<T: DeserializeOwned>(stream: &mut TcpStream) -> Result<T> {
    let mut len = [0u8; 4];
    stream
        .read_exact(&mut len)
        .map_err(|err| BenchError::transport(format!("read control frame: {err}")))?;
    let len = u32::from_le_bytes(len) as usize;
    if len > MAX_CONTROL_FRAME {
        return Err(BenchError::transport(format!(
            "oversized control frame of {len} bytes"
        )));
    }
    let mut body = vec![0u8; len];
    stream
        .read_exact(&mut body)
        .map_err(|err| BenchError::transport(format!("read control frame: {err}")))?;
    serde_json::from_slice(&body)
        .map_err(|err| BenchError::transport(format!("decode control frame: {err}")))
}

fn write_u64(stream: &mut TcpStream, value: u64) -> Result<()> {
    stream
        .write_all(&value.to_le_bytes())
        .and_then(|()| stream.flush())
        .map_err(|err| BenchError::transport(format!("barrier send: {err}")))
}

fn read_u64(stream: &mut TcpStream) -> Result<u64> {
    let mut buf = [0u8; 8];
    stream
        .read_exact(&mut buf)
        .map_err(|err| BenchError::transport(format!("barrier recv: {err}")))?;
    Ok(u64::from_le_bytes(buf))
}
