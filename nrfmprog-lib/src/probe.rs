//! probe-rs backed transport driving the nRF5 NVMC directly.

use crate::transport::{ProbeHandle, ProbeTransport};
use crate::{DeviceFamily, Error, Result, TargetId};
use probe_rs::probe::list::Lister;
use probe_rs::{Core, MemoryInterface, Permissions, Session};
use std::time::{Duration, Instant};

// NVMC register block, identical on nRF51 and nRF52.
const NVMC_BASE: u64 = 0x4001_E000;
const NVMC_READY: u64 = NVMC_BASE + 0x400;
const NVMC_CONFIG: u64 = NVMC_BASE + 0x504;
const NVMC_ERASEPAGE: u64 = NVMC_BASE + 0x508;
const NVMC_ERASEALL: u64 = NVMC_BASE + 0x50C;
const NVMC_ERASEUICR: u64 = NVMC_BASE + 0x514;

const CONFIG_REN: u32 = 0;
const CONFIG_WEN: u32 = 1;
const CONFIG_EEN: u32 = 2;

const DEFAULT_NVMC_TIMEOUT: Duration = Duration::from_secs(5);
const HALT_TIMEOUT: Duration = Duration::from_millis(500);
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Talks to J-Link, CMSIS-DAP, ST-Link... probes through probe-rs.
#[derive(Debug, Clone)]
pub struct ProbeRsTransport {
    nvmc_timeout: Duration,
}

impl ProbeRsTransport {
    pub fn new() -> Self {
        Self {
            nvmc_timeout: DEFAULT_NVMC_TIMEOUT,
        }
    }

    /// Upper bound for a single NVMC erase or write to complete.
    pub fn with_nvmc_timeout(mut self, timeout: Duration) -> Self {
        self.nvmc_timeout = timeout;
        self
    }
}

impl Default for ProbeRsTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ProbeTransport for ProbeRsTransport {
    type Handle = ProbeRsHandle;

    fn open(&self, family: DeviceFamily) -> Result<Self::Handle> {
        Ok(ProbeRsHandle {
            family,
            lister: Lister::new(),
            session: None,
            nvmc_timeout: self.nvmc_timeout,
        })
    }
}

pub struct ProbeRsHandle {
    family: DeviceFamily,
    lister: Lister,
    session: Option<Session>,
    nvmc_timeout: Duration,
}

impl ProbeRsHandle {
    fn with_core<R>(
        &mut self,
        f: impl FnOnce(&mut Core<'_>, Duration) -> Result<R>,
    ) -> Result<R> {
        let timeout = self.nvmc_timeout;
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| Error::transport("not connected to a target"))?;
        let mut core = session.core(0)?;
        f(&mut core, timeout)
    }
}

/// Word access to the NVMC register block and flash.
trait NvmcBus {
    fn read_word(&mut self, address: u64) -> Result<u32>;
    fn write_word(&mut self, address: u64, value: u32) -> Result<()>;
    fn write_words(&mut self, address: u64, words: &[u32]) -> Result<()>;
}

impl NvmcBus for Core<'_> {
    fn read_word(&mut self, address: u64) -> Result<u32> {
        Ok(self.read_word_32(address)?)
    }

    fn write_word(&mut self, address: u64, value: u32) -> Result<()> {
        Ok(self.write_word_32(address, value)?)
    }

    fn write_words(&mut self, address: u64, words: &[u32]) -> Result<()> {
        Ok(self.write_32(address, words)?)
    }
}

fn wait_ready<B: NvmcBus>(bus: &mut B, timeout: Duration) -> Result<()> {
    let start = Instant::now();
    loop {
        let ready = bus.read_word(NVMC_READY)?;
        tracing::trace!("NVMC READY = {:#X}", ready);
        if ready & 1 == 1 {
            return Ok(());
        }
        if start.elapsed() > timeout {
            return Err(Error::timeout("waiting for NVMC to become ready"));
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Runs `operation` with `CONFIG` set to `mode` and waits for it to finish.
///
/// `CONFIG` is back at `REN` afterwards whether or not any step failed; the
/// first error wins.
fn with_nvmc_mode<B: NvmcBus>(
    bus: &mut B,
    timeout: Duration,
    mode: u32,
    operation: impl FnOnce(&mut B) -> Result<()>,
) -> Result<()> {
    bus.write_word(NVMC_CONFIG, mode)?;
    let result = wait_ready(bus, timeout)
        .and_then(|()| operation(bus))
        .and_then(|()| wait_ready(bus, timeout));
    let restored = bus.write_word(NVMC_CONFIG, CONFIG_REN);
    if let Err(e) = &restored {
        tracing::warn!("Failed to put NVMC back into read-only mode: {}", e);
    }
    result.and(restored)
}

/// Runs an NVMC erase by writing `value` to `register` with erase enabled.
fn nvmc_erase<B: NvmcBus>(
    bus: &mut B,
    timeout: Duration,
    register: u64,
    value: u32,
) -> Result<()> {
    with_nvmc_mode(bus, timeout, CONFIG_EEN, |bus| bus.write_word(register, value))
}

fn nvmc_write<B: NvmcBus>(
    bus: &mut B,
    timeout: Duration,
    address: u32,
    words: &[u32],
) -> Result<()> {
    with_nvmc_mode(bus, timeout, CONFIG_WEN, |bus| {
        bus.write_words(address as u64, words)
    })
}

/// Whether a probe reporting `reported` is the one asked for as `wanted`.
///
/// All-digit serials compare as numbers, so the zero-padded form J-Link
/// reports (`000683000001`) matches `683000001`. Anything else must match
/// exactly.
fn serial_matches(reported: &str, wanted: &str) -> bool {
    let decimal = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if decimal(reported) && decimal(wanted) {
        reported.trim_start_matches('0') == wanted.trim_start_matches('0')
    } else {
        reported == wanted
    }
}

/// Widens `data` at `address` to whole words, padding with `0xFF` which
/// leaves the neighbouring flash bits untouched.
fn to_words(address: u32, data: &[u8]) -> (u32, Vec<u32>) {
    let aligned = address & !3;
    let head = (address - aligned) as usize;
    let padded_len = (head + data.len() + 3) & !3;
    let mut buffer = vec![0xFF; padded_len];
    buffer[head..head + data.len()].copy_from_slice(data);
    let words = buffer
        .chunks_exact(4)
        .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        .collect();
    (aligned, words)
}

impl ProbeHandle for ProbeRsHandle {
    fn enumerate(&mut self) -> Result<Vec<TargetId>> {
        let probes = self.lister.list_all();
        tracing::debug!("probe-rs lists {} probe(s)", probes.len());
        Ok(probes
            .into_iter()
            .filter_map(|info| info.serial_number)
            .map(TargetId::from)
            .collect())
    }

    fn connect(&mut self, target: &TargetId, allow_erase_all: bool) -> Result<()> {
        let info = self
            .lister
            .list_all()
            .into_iter()
            .find(|info| {
                info.serial_number
                    .as_deref()
                    .is_some_and(|serial| serial_matches(serial, target.as_str()))
            })
            .ok_or_else(|| Error::ProbeNotFound(target.clone()))?;

        tracing::debug!("Opening {} ({})", info.identifier, target);
        let probe = info.open()?;
        // With erase-all, probe-rs unlocks a read-protected part through
        // CTRL-AP while attaching, which wipes it.
        let permissions = if allow_erase_all {
            Permissions::new().allow_erase_all()
        } else {
            Permissions::new()
        };
        let mut session = probe.attach(self.family.target_name(), permissions)?;
        session.core(0)?.halt(HALT_TIMEOUT)?;
        self.session = Some(session);
        Ok(())
    }

    fn recover_erase(&mut self) -> Result<()> {
        self.with_core(|core, timeout| nvmc_erase(core, timeout, NVMC_ERASEALL, 1))
    }

    fn erase_uicr(&mut self) -> Result<()> {
        self.with_core(|core, timeout| nvmc_erase(core, timeout, NVMC_ERASEUICR, 1))
    }

    fn erase_page(&mut self, address: u32) -> Result<()> {
        self.with_core(|core, timeout| nvmc_erase(core, timeout, NVMC_ERASEPAGE, address))
    }

    fn write(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let (aligned, words) = to_words(address, data);
        self.with_core(|core, timeout| nvmc_write(core, timeout, aligned, &words))
    }

    fn read(&mut self, address: u32, len: u32) -> Result<Vec<u8>> {
        self.with_core(|core, _| {
            let mut buffer = vec![0u8; len as usize];
            core.read_8(address as u64, &mut buffer)?;
            Ok(buffer)
        })
    }

    fn system_reset(&mut self) -> Result<()> {
        self.with_core(|core, _| {
            core.reset()?;
            Ok(())
        })
    }

    fn disconnect(&mut self) -> Result<()> {
        if self.session.is_none() {
            return Ok(());
        }
        let resumed = self.with_core(|core, _| {
            if core.core_halted()? {
                core.run()?;
            }
            Ok(())
        });
        self.session = None;
        resumed
    }

    fn close(&mut self) -> Result<()> {
        self.session = None;
        Ok(())
    }
}
