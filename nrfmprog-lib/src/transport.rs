//! The seam between device sessions and debug-probe hardware.

use crate::{DeviceFamily, Result, TargetId};

/// Opens probe handles. Shared by every worker of a run.
pub trait ProbeTransport: Sync {
    type Handle: ProbeHandle;

    /// Opens a handle for talking to targets of `family`.
    fn open(&self, family: DeviceFamily) -> Result<Self::Handle>;
}

/// One open connection to the probe driver, owned by a single session.
///
/// Every call blocks until the probe has answered.
pub trait ProbeHandle {
    /// Serial numbers of all attached probes.
    fn enumerate(&mut self) -> Result<Vec<TargetId>>;

    /// Attaches to `target`. With `allow_erase_all` the backend may
    /// mass-erase a read-protected device to get access; without it a
    /// protected device fails to connect.
    fn connect(&mut self, target: &TargetId, allow_erase_all: bool) -> Result<()>;

    /// Erases all user flash and UICR and lifts readback protection.
    fn recover_erase(&mut self) -> Result<()>;

    fn erase_uicr(&mut self) -> Result<()>;

    fn erase_page(&mut self, address: u32) -> Result<()>;

    fn write(&mut self, address: u32, data: &[u8]) -> Result<()>;

    fn read(&mut self, address: u32, len: u32) -> Result<Vec<u8>>;

    fn system_reset(&mut self) -> Result<()>;

    fn disconnect(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}
