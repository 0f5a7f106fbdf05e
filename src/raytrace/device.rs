//! Render device: a worker thread that owns the raycaster.
//!
//! Each request is answered by exactly one response. [`RenderDevice::render`] submits a request
//! and blocks until the worker signals completion, so buffers are never shared across waits.

use crate::core::framebuffer::FrameBuffer;
use crate::error::{EstimateError, Result};
use crate::raytrace::raycaster::{HitBuffer, Raycaster};
use crate::scene::camera::CameraSetup;
use crate::scene::mesh::Mesh;
use log::{debug, warn};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread::{self, JoinHandle};

enum Request {
    SetMesh(Arc<Mesh>),
    Render(CameraSetup),
    Shutdown,
}

/// What a completed render produced.
#[derive(Debug)]
pub enum RenderOutput {
    /// Acknowledges a mesh swap.
    Ready,
    Hits(HitBuffer),
    Panorama(FrameBuffer),
}

pub struct RenderDevice {
    requests: SyncSender<Request>,
    done: Receiver<Result<RenderOutput>>,
    worker: Option<JoinHandle<()>>,
}

impl RenderDevice {
    /// Starts the worker with `mesh` as its scene.
    pub fn spawn(mesh: Arc<Mesh>) -> Result<Self> {
        // Single-slot channels: one request in flight, one completion signal.
        let (requests, request_rx) = mpsc::sync_channel::<Request>(1);
        let (done_tx, done) = mpsc::sync_channel::<Result<RenderOutput>>(1);

        let worker = thread::Builder::new()
            .name("render-device".into())
            .spawn(move || {
                let mut raycaster = Raycaster::new(mesh);
                while let Ok(request) = request_rx.recv() {
                    let output = match request {
                        Request::Shutdown => break,
                        Request::SetMesh(mesh) => {
                            raycaster = Raycaster::new(mesh);
                            Ok(RenderOutput::Ready)
                        }
                        Request::Render(CameraSetup::RayTargets { eye, targets }) => {
                            Ok(RenderOutput::Hits(raycaster.trace_targets(&eye, &targets)))
                        }
                        Request::Render(CameraSetup::Panoramic(camera)) => raycaster
                            .render_panorama(&camera)
                            .map(RenderOutput::Panorama),
                    };
                    if done_tx.send(output).is_err() {
                        break;
                    }
                }
                debug!("Render device worker stopped");
            })?;

        Ok(Self {
            requests,
            done,
            worker: Some(worker),
        })
    }

    fn round_trip(&self, request: Request) -> Result<RenderOutput> {
        self.requests
            .send(request)
            .map_err(|_| EstimateError::Render("render device is not running".into()))?;
        self.done
            .recv()
            .map_err(|_| EstimateError::Render("render device stopped before completing".into()))?
    }

    /// Replaces the scene mesh (for example once it carries radiance).
    pub fn set_mesh(&self, mesh: Arc<Mesh>) -> Result<()> {
        match self.round_trip(Request::SetMesh(mesh))? {
            RenderOutput::Ready => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Configures the camera, triggers a render and waits for it to finish.
    pub fn render(&self, camera: CameraSetup) -> Result<RenderOutput> {
        self.round_trip(Request::Render(camera))
    }

    pub fn render_hits(&self, camera: CameraSetup) -> Result<HitBuffer> {
        match self.render(camera)? {
            RenderOutput::Hits(hits) => Ok(hits),
            other => Err(unexpected(&other)),
        }
    }

    pub fn render_frame(&self, camera: CameraSetup) -> Result<FrameBuffer> {
        match self.render(camera)? {
            RenderOutput::Panorama(framebuffer) => Ok(framebuffer),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(output: &RenderOutput) -> EstimateError {
    let kind = match output {
        RenderOutput::Ready => "an acknowledgement",
        RenderOutput::Hits(_) => "a hit buffer",
        RenderOutput::Panorama(_) => "a panorama",
    };
    EstimateError::Render(format!("render device answered with {kind}"))
}

impl Drop for RenderDevice {
    fn drop(&mut self) {
        let _ = self.requests.send(Request::Shutdown);
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            warn!("Render device worker panicked");
        }
    }
}
