//! Fan-out of one programming session per target.

use crate::image::FirmwareImage;
use crate::progress::{ProgressCallbackArc, no_op_progress_callback};
use crate::session::{DeviceSession, SessionReport};
use crate::transport::{ProbeHandle, ProbeTransport};
use crate::{DeviceFamily, Error, Phase, ProgrammingRequest, Result, TargetError, TargetId};
use std::any::Any;
use std::sync::{Arc, mpsc};
use std::thread;

/// Result of programming a single target.
#[derive(Debug)]
pub struct OperationOutcome {
    pub target: TargetId,
    pub result: std::result::Result<SessionReport, TargetError>,
}

impl OperationOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Returns `explicit` unchanged when it is non-empty, otherwise the serial
/// numbers of every attached probe.
///
/// Enumeration uses its own short-lived handle that is closed before
/// returning. Duplicates in `explicit` are kept.
pub fn resolve_targets<T: ProbeTransport>(
    transport: &T,
    explicit: &[TargetId],
    family: DeviceFamily,
) -> Result<Vec<TargetId>> {
    if !explicit.is_empty() {
        return Ok(explicit.to_vec());
    }

    tracing::debug!("No targets given, enumerating attached probes");
    let targets = enumerate(transport, family).map_err(|e| Error::Enumeration(Box::new(e)))?;
    tracing::info!("Found {} attached probe(s)", targets.len());
    Ok(targets)
}

fn enumerate<T: ProbeTransport>(transport: &T, family: DeviceFamily) -> Result<Vec<TargetId>> {
    let mut handle = transport.open(family)?;
    let targets = handle.enumerate();
    if let Err(e) = handle.close() {
        tracing::warn!("Failed to close enumeration handle: {}", e);
    }
    targets
}

/// Programs one image onto many targets at once.
pub struct Orchestrator<T: ProbeTransport> {
    transport: T,
    progress: ProgressCallbackArc,
}

impl<T: ProbeTransport> Orchestrator<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            progress: no_op_progress_callback(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressCallbackArc) -> Self {
        self.progress = progress;
        self
    }

    /// Loads the request's image, resolves its targets and programs all of
    /// them concurrently.
    ///
    /// Errors are returned only for pre-flight failures (image, enumeration);
    /// per-target failures are reported in the outcomes, one per resolved
    /// target, in completion order.
    pub fn run(&self, request: &ProgrammingRequest) -> Result<Vec<OperationOutcome>> {
        let image = FirmwareImage::load(request.image_path())?;
        self.program_image(request, &image)
    }

    /// Like [`Self::run`] with an image that is already in memory.
    pub fn program_image(
        &self,
        request: &ProgrammingRequest,
        image: &FirmwareImage,
    ) -> Result<Vec<OperationOutcome>> {
        let targets = resolve_targets(&self.transport, request.targets(), request.family())?;
        if targets.is_empty() {
            tracing::warn!("No targets to program");
            return Ok(Vec::new());
        }

        tracing::info!(
            "Programming {} target(s), family {}, erase mode {:?}",
            targets.len(),
            request.family(),
            request.erase_mode()
        );

        let (tx, rx) = mpsc::channel();
        let outcomes = thread::scope(|scope| {
            let workers: Vec<_> = targets
                .iter()
                .map(|target| {
                    let tx = tx.clone();
                    let spawned = thread::Builder::new()
                        .name(format!("target-{}", target))
                        .spawn_scoped(scope, move || {
                            let session = DeviceSession::new(
                                &self.transport,
                                target.clone(),
                                request.family(),
                                Arc::clone(&self.progress),
                            );
                            let result = session.run(image, request);
                            let _ = tx.send(OperationOutcome {
                                target: target.clone(),
                                result,
                            });
                        });
                    (target, spawned)
                })
                .collect();
            drop(tx);

            let mut outcomes: Vec<OperationOutcome> = rx.iter().collect();

            // Workers that died never sent an outcome; report them here so
            // every target is accounted for.
            for (target, spawned) in workers {
                let source = match spawned {
                    Ok(worker) => match worker.join() {
                        Ok(()) => continue,
                        Err(payload) => Error::WorkerPanic(panic_message(payload.as_ref())),
                    },
                    Err(e) => Error::from(e),
                };
                tracing::error!("[{}] Worker failed: {}", target, source);
                outcomes.push(OperationOutcome {
                    target: target.clone(),
                    result: Err(TargetError::new(target.clone(), Phase::Worker, source)),
                });
            }

            outcomes
        });

        let failed = outcomes.iter().filter(|o| !o.is_success()).count();
        tracing::info!(
            "Finished: {} succeeded, {} failed",
            outcomes.len() - failed,
            failed
        );
        Ok(outcomes)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
