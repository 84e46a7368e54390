//! In-memory probe transport used by the integration tests.

#![allow(dead_code)]

use nrfmprog_lib::{
    DeviceFamily, Error, FirmwareImage, MemorySegment, ProbeHandle, ProbeTransport, Result,
    TargetId,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

pub const UICR_BASE: u32 = 0x1000_1000;
pub const UICR_SIZE: u32 = 0x1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Open,
    Enumerate,
    Connect,
    RecoverErase,
    EraseUicr,
    ErasePage(u32),
    Write { address: u32, len: usize },
    Read { address: u32, len: u32 },
    SystemReset,
    Disconnect,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    Connect,
    RecoverErase,
    EraseUicr,
    ErasePage,
    Write,
    Read,
    SystemReset,
    Disconnect,
    Close,
    /// Read-back returns the first byte inverted.
    CorruptReadback,
    /// The transport panics inside `write`.
    Panic,
}

#[derive(Default)]
struct MockState {
    attached: Vec<TargetId>,
    enumerate_fails: bool,
    faults: HashMap<TargetId, HashSet<Fault>>,
    flash: HashMap<TargetId, BTreeMap<u32, u8>>,
    log: Vec<(Option<TargetId>, Call)>,
    erase_all_permissions: HashMap<TargetId, Vec<bool>>,
    open_handles: usize,
}

#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attached(self, serials: &[&str]) -> Self {
        self.lock().attached = serials.iter().map(|s| TargetId::from(*s)).collect();
        self
    }

    pub fn fail_enumeration(self) -> Self {
        self.lock().enumerate_fails = true;
        self
    }

    pub fn inject(&self, target: &str, fault: Fault) {
        self.lock()
            .faults
            .entry(TargetId::from(target))
            .or_default()
            .insert(fault);
    }

    pub fn preload(&self, target: &str, address: u32, data: &[u8]) {
        let mut state = self.lock();
        let flash = state.flash.entry(TargetId::from(target)).or_default();
        for (i, byte) in data.iter().enumerate() {
            flash.insert(address + i as u32, *byte);
        }
    }

    /// Calls made by handles connected to `target`, in order.
    pub fn calls(&self, target: &str) -> Vec<Call> {
        let target = TargetId::from(target);
        self.lock()
            .log
            .iter()
            .filter(|(t, _)| t.as_ref() == Some(&target))
            .map(|(_, call)| call.clone())
            .collect()
    }

    pub fn all_calls(&self) -> Vec<(Option<TargetId>, Call)> {
        self.lock().log.clone()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.lock().log.iter().filter(|(_, c)| c == call).count()
    }

    pub fn flash(&self, target: &str, address: u32, len: u32) -> Vec<u8> {
        let state = self.lock();
        let flash = state.flash.get(&TargetId::from(target));
        span(address, len)
            .map(|a| flash.and_then(|f| f.get(&a)).copied().unwrap_or(0xFF))
            .collect()
    }

    /// The `allow_erase_all` flag of every connect to `target`.
    pub fn erase_all_permissions(&self, target: &str) -> Vec<bool> {
        self.lock()
            .erase_all_permissions
            .get(&TargetId::from(target))
            .cloned()
            .unwrap_or_default()
    }

    pub fn open_handles(&self) -> usize {
        self.lock().open_handles
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ProbeTransport for MockTransport {
    type Handle = MockHandle;

    fn open(&self, family: DeviceFamily) -> Result<MockHandle> {
        let mut state = self.lock();
        state.open_handles += 1;
        state.log.push((None, Call::Open));
        Ok(MockHandle {
            transport: self.clone(),
            family,
            target: None,
        })
    }
}

pub struct MockHandle {
    transport: MockTransport,
    family: DeviceFamily,
    target: Option<TargetId>,
}

impl MockHandle {
    fn record(&self, call: Call, fault: Option<Fault>) -> Result<()> {
        let mut state = self.transport.lock();
        state.log.push((self.target.clone(), call.clone()));
        let Some(fault) = fault else {
            return Ok(());
        };
        let hit = self
            .target
            .as_ref()
            .and_then(|t| state.faults.get(t))
            .is_some_and(|faults| faults.contains(&fault));
        if hit {
            return Err(Error::transport(format!("injected fault on {:?}", call)));
        }
        Ok(())
    }

    fn has_fault(&self, fault: Fault) -> bool {
        let state = self.transport.lock();
        self.target
            .as_ref()
            .and_then(|t| state.faults.get(t))
            .is_some_and(|faults| faults.contains(&fault))
    }

    fn with_flash<R>(&self, f: impl FnOnce(&mut BTreeMap<u32, u8>) -> R) -> R {
        let mut state = self.transport.lock();
        let target = self.target.clone().unwrap_or_else(|| TargetId::from(""));
        f(state.flash.entry(target).or_default())
    }
}

impl ProbeHandle for MockHandle {
    fn enumerate(&mut self) -> Result<Vec<TargetId>> {
        self.record(Call::Enumerate, None)?;
        let state = self.transport.lock();
        if state.enumerate_fails {
            return Err(Error::transport("probe driver unavailable"));
        }
        Ok(state.attached.clone())
    }

    fn connect(&mut self, target: &TargetId, allow_erase_all: bool) -> Result<()> {
        self.target = Some(target.clone());
        self.transport
            .lock()
            .erase_all_permissions
            .entry(target.clone())
            .or_default()
            .push(allow_erase_all);
        self.record(Call::Connect, Some(Fault::Connect))?;
        if !self.transport.lock().attached.contains(target) {
            return Err(Error::ProbeNotFound(target.clone()));
        }
        Ok(())
    }

    fn recover_erase(&mut self) -> Result<()> {
        self.record(Call::RecoverErase, Some(Fault::RecoverErase))?;
        self.with_flash(|flash| flash.clear());
        Ok(())
    }

    fn erase_uicr(&mut self) -> Result<()> {
        self.record(Call::EraseUicr, Some(Fault::EraseUicr))?;
        self.with_flash(|flash| flash.retain(|a, _| !(UICR_BASE..UICR_BASE + UICR_SIZE).contains(a)));
        Ok(())
    }

    fn erase_page(&mut self, address: u32) -> Result<()> {
        self.record(Call::ErasePage(address), Some(Fault::ErasePage))?;
        let page_size = self.family.page_size();
        let page = address as u64..address as u64 + page_size as u64;
        self.with_flash(|flash| flash.retain(|a, _| !page.contains(&(*a as u64))));
        Ok(())
    }

    fn write(&mut self, address: u32, data: &[u8]) -> Result<()> {
        self.record(
            Call::Write {
                address,
                len: data.len(),
            },
            Some(Fault::Write),
        )?;
        if self.has_fault(Fault::Panic) {
            panic!("probe firmware crashed");
        }
        self.with_flash(|flash| {
            for (i, byte) in data.iter().enumerate() {
                flash.insert(address + i as u32, *byte);
            }
        });
        Ok(())
    }

    fn read(&mut self, address: u32, len: u32) -> Result<Vec<u8>> {
        self.record(Call::Read { address, len }, Some(Fault::Read))?;
        let mut data: Vec<u8> = self.with_flash(|flash| {
            span(address, len)
                .map(|a| flash.get(&a).copied().unwrap_or(0xFF))
                .collect()
        });
        if self.has_fault(Fault::CorruptReadback) {
            if let Some(first) = data.first_mut() {
                *first = !*first;
            }
        }
        Ok(data)
    }

    fn system_reset(&mut self) -> Result<()> {
        self.record(Call::SystemReset, Some(Fault::SystemReset))
    }

    fn disconnect(&mut self) -> Result<()> {
        self.record(Call::Disconnect, Some(Fault::Disconnect))
    }

    fn close(&mut self) -> Result<()> {
        self.transport.lock().open_handles -= 1;
        self.record(Call::Close, Some(Fault::Close))
    }
}

/// Addresses `address..address + len`, clipped to the 32-bit space.
fn span(address: u32, len: u32) -> impl Iterator<Item = u32> {
    let end = (address as u64 + len as u64).min(u32::MAX as u64 + 1);
    (address as u64..end).map(|a| a as u32)
}

/// The two-segment image used throughout the scenarios.
pub fn two_segment_image() -> FirmwareImage {
    let first: Vec<u8> = (0..0x200u32).map(|i| i as u8).collect();
    let second: Vec<u8> = (0..0x50u32).map(|i| 0xA0 ^ i as u8).collect();
    FirmwareImage::from(vec![
        MemorySegment::new(0x1000, first),
        MemorySegment::new(0x2000, second),
    ])
}
