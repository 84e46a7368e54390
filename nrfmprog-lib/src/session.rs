//! Per-target programming session.
//!
//! A [`DeviceSession`] walks one target through
//! `Created → Connected → Prepared → Programmed → Verified? → Reset? →
//! Disconnected → Closed`. It owns its probe handle exclusively; the handle
//! is released on every exit path, including drop.

use crate::erase_plan::ErasePlan;
use crate::image::{FirmwareImage, MemorySegment};
use crate::progress::{ProgressCallbackArc, ProgressHelper, ProgressOperation, ProgressStatus};
use crate::transport::{ProbeHandle, ProbeTransport};
use crate::{
    DeviceFamily, EraseMode, Error, Phase, ProgrammingRequest, Result, TargetError, TargetId,
};
use std::collections::BTreeSet;
use strum::Display;

/// Writes and read-backs are split on absolute boundaries of this size.
pub const TRANSFER_CHUNK_SIZE: u32 = 16 * 1024;

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Connected,
    Prepared,
    Programmed,
    Verified,
    Reset,
    Disconnected,
    Closed,
}

/// What a successful session did to its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub state: LifecycleState,
    pub recovered: bool,
    pub uicr_erased: bool,
    pub pages_erased: usize,
    pub bytes_written: u64,
    pub verified: bool,
    pub reset: bool,
}

impl Default for SessionReport {
    fn default() -> Self {
        Self {
            state: LifecycleState::Created,
            recovered: false,
            uicr_erased: false,
            pages_erased: 0,
            bytes_written: 0,
            verified: false,
            reset: false,
        }
    }
}

pub struct DeviceSession<'a, T: ProbeTransport> {
    transport: &'a T,
    target: TargetId,
    family: DeviceFamily,
    handle: Option<T::Handle>,
    connected: bool,
    state: LifecycleState,
    erased_pages: BTreeSet<u32>,
    progress: ProgressHelper,
    report: SessionReport,
}

impl<'a, T: ProbeTransport> DeviceSession<'a, T> {
    pub fn new(
        transport: &'a T,
        target: TargetId,
        family: DeviceFamily,
        progress: ProgressCallbackArc,
    ) -> Self {
        Self {
            transport,
            progress: ProgressHelper::new(progress, target.clone()),
            target,
            family,
            handle: None,
            connected: false,
            state: LifecycleState::Created,
            erased_pages: BTreeSet::new(),
            report: SessionReport::default(),
        }
    }

    pub fn target(&self) -> &TargetId {
        &self.target
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Runs every phase the request asks for, then always shuts down.
    pub fn run(
        mut self,
        image: &FirmwareImage,
        request: &ProgrammingRequest,
    ) -> std::result::Result<SessionReport, TargetError> {
        let result = self.execute(image, request);
        let cleanup = self.shutdown();

        match (result, cleanup) {
            (Ok(()), Ok(())) => {
                tracing::info!("[{}] Programming finished", self.target);
                let mut report = self.report.clone();
                report.state = self.state;
                Ok(report)
            }
            (Ok(()), Err(e)) => {
                tracing::error!("[{}] Failed to release probe: {}", self.target, e);
                Err(self.fail(Phase::Disconnect, e))
            }
            (Err(e), cleanup) => {
                tracing::error!("[{}] {}", self.target, e);
                if let Err(cleanup) = cleanup {
                    tracing::warn!(
                        "[{}] Cleanup after failure also failed: {}",
                        self.target,
                        cleanup
                    );
                }
                Err(e)
            }
        }
    }

    fn execute(
        &mut self,
        image: &FirmwareImage,
        request: &ProgrammingRequest,
    ) -> std::result::Result<(), TargetError> {
        self.connect(request.erase_mode())?;
        self.prepare(request.erase_mode())?;
        self.program(image, request.erase_mode())?;
        if request.verify() {
            self.verify(image)?;
        }
        if request.system_reset() {
            self.reset()?;
        }
        Ok(())
    }

    /// `Created → Connected`
    ///
    /// Only [`EraseMode::All`] lets the backend mass-erase a read-protected
    /// device while attaching.
    pub fn connect(&mut self, erase_mode: EraseMode) -> std::result::Result<(), TargetError> {
        self.expect_state(&[LifecycleState::Created])
            .map_err(|e| self.fail(Phase::Connect, e))?;

        let spinner = self.progress.create_spinner(ProgressOperation::Connect);
        tracing::info!("[{}] Connecting ({})", self.target, self.family);

        let handle = self
            .transport
            .open(self.family)
            .map_err(|e| self.fail(Phase::Connect, e))?;
        let handle = self.handle.insert(handle);
        handle
            .connect(&self.target, erase_mode == EraseMode::All)
            .map_err(|e| TargetError::new(self.target.clone(), Phase::Connect, e))?;

        self.connected = true;
        self.state = LifecycleState::Connected;
        spinner.finish(ProgressStatus::Success);
        Ok(())
    }

    /// `Connected → Prepared`: whole-device erases. Sector erases happen per
    /// segment in [`Self::program`].
    pub fn prepare(&mut self, mode: EraseMode) -> std::result::Result<(), TargetError> {
        self.expect_state(&[LifecycleState::Connected])
            .map_err(|e| self.fail(Phase::Erase, e))?;

        match mode {
            EraseMode::All => {
                let spinner = self.progress.create_spinner(ProgressOperation::RecoverErase);
                tracing::info!("[{}] Recovering device", self.target);
                self.handle_mut()
                    .and_then(|handle| handle.recover_erase())
                    .map_err(|e| self.fail(Phase::Erase, e))?;
                self.report.recovered = true;
                spinner.finish(ProgressStatus::Success);
            }
            EraseMode::SectorsAndUicr => {
                let spinner = self.progress.create_spinner(ProgressOperation::EraseUicr);
                tracing::info!("[{}] Erasing UICR", self.target);
                self.handle_mut()
                    .and_then(|handle| handle.erase_uicr())
                    .map_err(|e| self.fail(Phase::Erase, e))?;
                self.report.uicr_erased = true;
                spinner.finish(ProgressStatus::Success);
            }
            EraseMode::None | EraseMode::Sectors => {}
        }

        self.state = LifecycleState::Prepared;
        Ok(())
    }

    /// `Prepared → Programmed`: per segment, optional page erase then write.
    pub fn program(
        &mut self,
        image: &FirmwareImage,
        mode: EraseMode,
    ) -> std::result::Result<(), TargetError> {
        self.expect_state(&[LifecycleState::Prepared])
            .map_err(|e| self.fail(Phase::Write, e))?;

        for segment in image.segments() {
            if mode.erases_sectors() {
                self.erase_segment(segment)
                    .map_err(|e| self.fail(Phase::Erase, e))?;
            }
            self.write_segment(segment)
                .map_err(|e| self.fail(Phase::Write, e))?;
        }

        self.state = LifecycleState::Programmed;
        Ok(())
    }

    /// Erases the pages under `segment`. Pages already erased earlier in this
    /// session are skipped so a shared page does not lose data written for a
    /// previous segment.
    fn erase_segment(&mut self, segment: &MemorySegment) -> Result<()> {
        let plan = ErasePlan::for_segment(segment, self.family.page_size());
        let pending: Vec<u32> = plan
            .pages()
            .iter()
            .copied()
            .filter(|page| !self.erased_pages.contains(page))
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        let spinner = self.progress.create_spinner(ProgressOperation::ErasePages {
            address: pending[0],
            count: pending.len(),
        });
        let handle = self
            .handle
            .as_mut()
            .ok_or_else(|| missing_handle(self.state))?;
        let total = pending.len();
        for (index, page) in pending.into_iter().enumerate() {
            spinner.set_operation(ProgressOperation::ErasePages {
                address: page,
                count: total - index,
            });
            tracing::debug!("[{}] Erasing page 0x{:08X}", self.target, page);
            handle.erase_page(page)?;
            self.erased_pages.insert(page);
            self.report.pages_erased += 1;
        }
        spinner.finish(ProgressStatus::Success);
        Ok(())
    }

    fn write_segment(&mut self, segment: &MemorySegment) -> Result<()> {
        let bar = self.progress.create_bar(
            segment.len() as u64,
            ProgressOperation::Write {
                address: segment.start(),
                size: segment.len() as u64,
            },
        );
        let handle = self
            .handle
            .as_mut()
            .ok_or_else(|| missing_handle(self.state))?;

        for (address, chunk) in transfer_chunks(segment.start(), segment.data()) {
            tracing::debug!(
                "[{}] Writing 0x{:X} bytes at 0x{:08X}",
                self.target,
                chunk.len(),
                address
            );
            handle.write(address, chunk)?;
            self.report.bytes_written += chunk.len() as u64;
            bar.inc(chunk.len() as u64);
        }
        bar.finish(ProgressStatus::Success);
        Ok(())
    }

    /// `Programmed → Verified`: reads every segment back and compares.
    pub fn verify(&mut self, image: &FirmwareImage) -> std::result::Result<(), TargetError> {
        self.expect_state(&[LifecycleState::Programmed])
            .map_err(|e| self.fail(Phase::Verify, e))?;

        for segment in image.segments() {
            self.verify_segment(segment)
                .map_err(|e| self.fail(Phase::Verify, e))?;
        }

        self.report.verified = true;
        self.state = LifecycleState::Verified;
        Ok(())
    }

    fn verify_segment(&mut self, segment: &MemorySegment) -> Result<()> {
        let bar = self.progress.create_bar(
            segment.len() as u64,
            ProgressOperation::Verify {
                address: segment.start(),
                size: segment.len() as u64,
            },
        );
        let handle = self
            .handle
            .as_mut()
            .ok_or_else(|| missing_handle(self.state))?;

        for (address, expected) in transfer_chunks(segment.start(), segment.data()) {
            let actual = handle.read(address, expected.len() as u32)?;
            if let Some(offset) = first_mismatch(expected, &actual) {
                return Err(Error::VerifyMismatch {
                    segment: segment.start(),
                    address: address + offset as u32,
                    expected: expected[offset],
                    actual: actual.get(offset).copied().unwrap_or(0xFF),
                });
            }
            bar.inc(expected.len() as u64);
        }
        bar.finish(ProgressStatus::Success);
        Ok(())
    }

    /// `Programmed | Verified → Reset`
    pub fn reset(&mut self) -> std::result::Result<(), TargetError> {
        self.expect_state(&[LifecycleState::Programmed, LifecycleState::Verified])
            .map_err(|e| self.fail(Phase::Reset, e))?;

        let spinner = self.progress.create_spinner(ProgressOperation::SystemReset);
        tracing::info!("[{}] Issuing system reset", self.target);
        self.handle_mut()
            .and_then(|handle| handle.system_reset())
            .map_err(|e| self.fail(Phase::Reset, e))?;

        self.report.reset = true;
        self.state = LifecycleState::Reset;
        spinner.finish(ProgressStatus::Success);
        Ok(())
    }

    /// Disconnects (if connected) and closes the handle. Both steps are
    /// attempted; the first error is returned. Idempotent.
    pub fn shutdown(&mut self) -> Result<()> {
        let Some(mut handle) = self.handle.take() else {
            return Ok(());
        };

        let spinner = self.progress.create_spinner(ProgressOperation::Disconnect);
        let mut first_error = None;

        if self.connected {
            self.connected = false;
            match handle.disconnect() {
                Ok(()) => self.state = LifecycleState::Disconnected,
                Err(e) => {
                    tracing::warn!("[{}] Disconnect failed: {}", self.target, e);
                    first_error = Some(e);
                }
            }
        }

        if let Err(e) = handle.close() {
            tracing::warn!("[{}] Closing probe handle failed: {}", self.target, e);
            if first_error.is_none() {
                first_error = Some(e);
            }
        }
        self.state = LifecycleState::Closed;

        match first_error {
            Some(e) => {
                spinner.finish(ProgressStatus::Failed);
                Err(e)
            }
            None => {
                spinner.finish(ProgressStatus::Success);
                Ok(())
            }
        }
    }

    fn handle_mut(&mut self) -> Result<&mut T::Handle> {
        let state = self.state;
        self.handle.as_mut().ok_or_else(|| missing_handle(state))
    }

    fn expect_state(&self, allowed: &[LifecycleState]) -> Result<()> {
        if allowed.contains(&self.state) {
            return Ok(());
        }
        Err(Error::InvalidState {
            expected: allowed
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" or "),
            actual: self.state.to_string(),
        })
    }

    fn fail(&self, phase: Phase, source: Error) -> TargetError {
        TargetError::new(self.target.clone(), phase, source)
    }
}

impl<T: ProbeTransport> Drop for DeviceSession<'_, T> {
    fn drop(&mut self) {
        if self.handle.is_some() {
            tracing::warn!(
                "[{}] Session dropped in state {}, releasing probe",
                self.target,
                self.state
            );
            let _ = self.shutdown();
        }
    }
}

fn missing_handle(state: LifecycleState) -> Error {
    Error::InvalidState {
        expected: "an open probe handle".to_string(),
        actual: state.to_string(),
    }
}

/// Splits `data` starting at `start` into pieces that never cross a
/// [`TRANSFER_CHUNK_SIZE`] boundary.
fn transfer_chunks(start: u32, data: &[u8]) -> impl Iterator<Item = (u32, &[u8])> {
    let mut address = start;
    let mut rest = data;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let chunk_size = TRANSFER_CHUNK_SIZE as u64;
        let boundary = (address as u64 / chunk_size + 1) * chunk_size;
        let len = rest.len().min((boundary - address as u64) as usize);
        let (chunk, tail) = rest.split_at(len);
        let chunk_address = address;
        address = address.wrapping_add(len as u32);
        rest = tail;
        Some((chunk_address, chunk))
    })
}

fn first_mismatch(expected: &[u8], actual: &[u8]) -> Option<usize> {
    expected
        .iter()
        .enumerate()
        .find(|(i, byte)| actual.get(*i) != Some(*byte))
        .map(|(i, _)| i)
}
