//! Simulated display controller.
//!
//! [`DeviceMemory`] interprets the command stream the way the controller
//! firmware does: register writes, RLX runs into either pixel plane, the
//! copy command used as a latch after register changes, and no-op padding.
//! [`LoopbackTransport`] feeds submitted slots into a `DeviceMemory` from a
//! separate task and completes them there, standing in for the USB host
//! controller's completion context.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::command::{CMD_START, ChannelPixel, NOOP, OP_COPY16, OP_RLX8, OP_RLX16, OP_SET_REGISTER};
use crate::error::{DlfbError, TransportError};
use crate::registers::{REG_BASE8, REG_BASE16, REG_LOCK};
use crate::slots::{BulkTransport, Rejected, SlotLease};

/// Opcode the controller treats as an explicit end-of-transfer sync.
const OP_SYNC: u8 = 0xA0;

// ── DeviceMemory ─────────────────────────────────────────────────

/// Device framebuffer memory plus register file.
#[derive(Debug, Clone)]
pub struct DeviceMemory {
    mem: Vec<u8>,
    registers: [u8; 256],
    lock_depth: i32,
    commands: u64,
}

impl DeviceMemory {
    /// Device with `size` bytes of framebuffer memory, all zero.
    pub fn new(size: usize) -> Self {
        Self {
            mem: vec![0; size],
            registers: [0; 256],
            lock_depth: 0,
            commands: 0,
        }
    }

    /// Raw device memory.
    pub fn bytes(&self) -> &[u8] {
        &self.mem
    }

    /// Big-endian 16-bit pixel at a byte address.
    pub fn read16(&self, addr: u32) -> u16 {
        let a = addr as usize;
        u16::from_be_bytes([self.mem[a], self.mem[a + 1]])
    }

    /// 8-bit pixel at a byte address.
    pub fn read8(&self, addr: u32) -> u8 {
        self.mem[addr as usize]
    }

    /// Current value of a register.
    pub fn register(&self, reg: u8) -> u8 {
        self.registers[reg as usize]
    }

    /// Register pair read high byte first.
    pub fn register16(&self, reg: u8) -> u16 {
        u16::from_be_bytes([self.register(reg), self.register(reg.wrapping_add(1))])
    }

    /// 24-bit base address of the 16-bit plane.
    pub fn base16(&self) -> u32 {
        self.register24(REG_BASE16)
    }

    /// 24-bit base address of the 8-bit plane.
    pub fn base8(&self) -> u32 {
        self.register24(REG_BASE8)
    }

    fn register24(&self, reg: u8) -> u32 {
        (self.register(reg) as u32) << 16
            | (self.register(reg + 1) as u32) << 8
            | self.register(reg + 2) as u32
    }

    /// `true` while a register lock window is open.
    pub fn is_locked(&self) -> bool {
        self.lock_depth > 0
    }

    /// Commands executed so far, padding excluded.
    pub fn commands(&self) -> u64 {
        self.commands
    }

    /// Execute one transfer's worth of commands.
    pub fn apply(&mut self, stream: &[u8]) -> Result<(), DlfbError> {
        let mut i = 0;
        while i < stream.len() {
            if stream[i] != CMD_START {
                return Err(decode_err(i, "expected command start"));
            }
            let Some(&op) = stream.get(i + 1) else {
                // lone trailing sync byte
                break;
            };

            i = match op {
                NOOP => i + 1,
                OP_SYNC => i + 2,
                OP_SET_REGISTER => self.set_register(stream, i)?,
                OP_RLX16 => self.rlx::<u16>(stream, i)?,
                OP_RLX8 => self.rlx::<u8>(stream, i)?,
                OP_COPY16 => self.copy16(stream, i)?,
                _ => return Err(decode_err(i + 1, "unknown opcode")),
            };
        }
        Ok(())
    }

    // ── Command handlers ─────────────────────────────────────────

    fn set_register(&mut self, s: &[u8], at: usize) -> Result<usize, DlfbError> {
        let [reg, value] = take::<2>(s, at + 2)?;
        if reg == REG_LOCK {
            self.lock_depth += if value == 0x00 { 1 } else { -1 };
        }
        self.registers[reg as usize] = value;
        self.commands += 1;
        trace!(reg, value, "register write");
        Ok(at + 4)
    }

    fn rlx<P: ChannelPixel>(&mut self, s: &[u8], at: usize) -> Result<usize, DlfbError> {
        let [a2, a1, a0, n] = take::<4>(s, at + 2)?;
        let mut addr = (a2 as usize) << 16 | (a1 as usize) << 8 | a0 as usize;
        let mut left = count(n);
        let mut i = at + 6;

        while left > 0 {
            let raw = count(*s.get(i).ok_or_else(|| decode_err(i, "missing span count"))?);
            if raw > left {
                return Err(decode_err(i, "raw span longer than command"));
            }
            i += 1;

            let bytes = raw * P::BYTES;
            let span = s.get(i..i + bytes).ok_or_else(|| decode_err(i, "truncated raw span"))?;
            self.store(addr, span, i)?;
            addr += bytes;
            i += bytes;
            left -= raw;

            if left == 0 {
                break;
            }

            let repeat = *s.get(i).ok_or_else(|| decode_err(i, "missing repeat count"))? as usize;
            if repeat > left {
                return Err(decode_err(i, "repeat longer than command"));
            }
            let last = &s[i - P::BYTES..i];
            for _ in 0..repeat {
                self.store(addr, last, i)?;
                addr += P::BYTES;
            }
            i += 1;
            left -= repeat;
        }

        self.commands += 1;
        Ok(i)
    }

    fn copy16(&mut self, s: &[u8], at: usize) -> Result<usize, DlfbError> {
        let [s2, s1, s0, n, d2, d1, d0] = take::<7>(s, at + 2)?;
        let src = (s2 as usize) << 16 | (s1 as usize) << 8 | s0 as usize;
        let dst = (d2 as usize) << 16 | (d1 as usize) << 8 | d0 as usize;
        let bytes = count(n) * 2;
        if src + bytes > self.mem.len() || dst + bytes > self.mem.len() {
            // a latch copy aimed at unallocated memory is harmless on hardware
            self.commands += 1;
            return Ok(at + 9);
        }
        self.mem.copy_within(src..src + bytes, dst);
        self.commands += 1;
        Ok(at + 9)
    }

    fn store(&mut self, addr: usize, bytes: &[u8], at: usize) -> Result<(), DlfbError> {
        let dst = self
            .mem
            .get_mut(addr..addr + bytes.len())
            .ok_or_else(|| decode_err(at, "write beyond device memory"))?;
        dst.copy_from_slice(bytes);
        Ok(())
    }
}

fn count(byte: u8) -> usize {
    if byte == 0 { 256 } else { byte as usize }
}

fn take<const N: usize>(s: &[u8], at: usize) -> Result<[u8; N], DlfbError> {
    s.get(at..at + N)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| decode_err(at, "truncated command"))
}

fn decode_err(offset: usize, reason: &'static str) -> DlfbError {
    DlfbError::Decode { offset, reason }
}

// ── LoopbackDevice ───────────────────────────────────────────────

#[derive(Debug)]
struct DeviceState {
    memory: DeviceMemory,
    transfers: u64,
    bytes: u64,
    capture: Option<Vec<u8>>,
}

/// Handle on the simulated device behind a [`LoopbackTransport`].
#[derive(Debug, Clone)]
pub struct LoopbackDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl LoopbackDevice {
    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` against the device memory.
    pub fn with_memory<R>(&self, f: impl FnOnce(&DeviceMemory) -> R) -> R {
        f(&self.lock().memory)
    }

    /// Transfers completed so far.
    pub fn transfers(&self) -> u64 {
        self.lock().transfers
    }

    /// Payload bytes received so far.
    pub fn bytes_received(&self) -> u64 {
        self.lock().bytes
    }

    /// Everything received so far, when capture was enabled.
    pub fn take_capture(&self) -> Vec<u8> {
        self.lock().capture.as_mut().map(std::mem::take).unwrap_or_default()
    }
}

// ── LoopbackTransport ────────────────────────────────────────────

/// [`BulkTransport`] that executes transfers against a [`DeviceMemory`]
/// on a spawned task.
#[derive(Debug)]
pub struct LoopbackTransport {
    tx: mpsc::Sender<SlotLease>,
    reject_next: AtomicUsize,
}

impl LoopbackTransport {
    /// Spawn the device task. Must be called inside a Tokio runtime.
    ///
    /// `queue` bounds how many transfers may wait for the device; set
    /// `capture` to keep a copy of the whole byte stream.
    pub fn spawn(
        memory_size: usize,
        queue: usize,
        capture: bool,
    ) -> (Self, LoopbackDevice, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<SlotLease>(queue.max(1));
        let device = LoopbackDevice {
            state: Arc::new(Mutex::new(DeviceState {
                memory: DeviceMemory::new(memory_size),
                transfers: 0,
                bytes: 0,
                capture: capture.then(Vec::new),
            })),
        };

        let worker = device.clone();
        let handle = tokio::spawn(async move {
            while let Some(lease) = rx.recv().await {
                let status = {
                    let mut state = worker.lock();
                    state.transfers += 1;
                    state.bytes += lease.len() as u64;
                    if let Some(capture) = state.capture.as_mut() {
                        capture.extend_from_slice(lease.payload());
                    }
                    state.memory.apply(lease.payload()).map_err(|e| {
                        warn!(slot = lease.id(), "device rejected stream: {e}");
                        TransportError::Other(e.to_string())
                    })
                };
                lease.complete(status);
                tokio::task::yield_now().await;
            }
        });

        (
            Self {
                tx,
                reject_next: AtomicUsize::new(0),
            },
            device,
            handle,
        )
    }

    /// Refuse the next `n` submissions with a stall.
    pub fn reject_next(&self, n: usize) {
        self.reject_next.store(n, Ordering::SeqCst);
    }
}

impl BulkTransport for LoopbackTransport {
    fn submit(&self, lease: SlotLease) -> Result<(), Rejected> {
        let injected = self
            .reject_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Rejected {
                lease,
                reason: TransportError::Stall,
            });
        }

        self.tx.try_send(lease).map_err(|e| match e {
            mpsc::error::TrySendError::Full(lease) => Rejected {
                lease,
                reason: TransportError::QueueFull,
            },
            mpsc::error::TrySendError::Closed(lease) => Rejected {
                lease,
                reason: TransportError::Disconnected,
            },
        })
    }
}

// ── Tests ────────────────────────────────────────────────────────
