//! Camera ownership: device selection, geometry negotiation and the
//! capture thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use thiserror::Error;

use crate::config::CaptureConfig;
use crate::geometry::{display_orientation, negotiate_size, CaptureGeometry, Facing, Size};
use crate::types::{Image, PixelFormat};

#[derive(Error, Debug, Clone)]
pub enum CaptureError {
    #[error("no camera found")]
    NoCameraFound,
    #[error("camera {0} is busy")]
    Busy(usize),
    #[error("camera driver error: {0}")]
    Driver(String),
    #[error("failed to spawn capture thread: {0}")]
    ThreadSpawn(#[source] Arc<std::io::Error>),
    #[error("capture source has been released")]
    Released,
}

/// Static properties of a camera device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub facing: Facing,
    /// Mounting angle of the sensor in degrees.
    pub sensor_orientation: u32,
    pub supported_sizes: Vec<Size>,
    /// Size used when no supported size can be negotiated.
    pub default_size: Size,
}

/// Platform camera access.
pub trait CameraDriver: Send + Sync + 'static {
    fn device_count(&self) -> usize;

    fn device_info(&self, camera_id: usize) -> Result<DeviceInfo, CaptureError>;

    /// Open a device at `size`, producing NV21 frames.
    fn open(&self, camera_id: usize, size: Size) -> Result<Box<dyn FrameStream>, CaptureError>;
}

/// An open device's frame sequence.
pub trait FrameStream: Send {
    /// Block until the next frame. `Ok(None)` ends the stream.
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, CaptureError>;
}

#[derive(Debug)]
pub enum CaptureEvent {
    Opened(CaptureGeometry),
    Frame(Image),
    ConfigurationChanged { camera_id: usize, orientation: u32 },
    Closed,
    Error(CaptureError),
}

/// Receives capture events. `Frame` events arrive on the capture thread.
pub trait CaptureListener: Send + Sync {
    fn on_event(&self, event: CaptureEvent);
}

struct Running {
    geometry: CaptureGeometry,
    sensor_orientation: u32,
    stop: Arc<AtomicBool>,
    /// Cleared by whoever announces `Closed`: the thread when the stream
    /// ends by itself, otherwise `stop`.
    open: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Running {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

struct SourceState {
    config: CaptureConfig,
    camera_id: Option<usize>,
    listener: Option<Arc<dyn CaptureListener>>,
    running: Option<Running>,
}

/// Owner of one camera device at a time.
///
/// Start, stop and switch are serialized by a single mutex, so concurrent
/// calls from different threads never interleave a half-open device.
pub struct CaptureSource {
    driver: Arc<dyn CameraDriver>,
    state: Mutex<SourceState>,
}

impl CaptureSource {
    pub fn new(
        driver: Arc<dyn CameraDriver>,
        config: CaptureConfig,
        listener: Arc<dyn CaptureListener>,
    ) -> Self {
        let camera_id = config.camera_id;
        Self {
            driver,
            state: Mutex::new(SourceState {
                config,
                camera_id,
                listener: Some(listener),
                running: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SourceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open the selected device and start delivering frames.
    ///
    /// Starting an open source returns its current geometry. A source whose
    /// stream ended by itself is reopened.
    pub fn start(&self) -> Result<CaptureGeometry, CaptureError> {
        let mut state = self.lock();
        self.start_locked(&mut state)
    }

    /// Stop the capture thread and close the device. No-op when closed.
    pub fn stop(&self) {
        let mut state = self.lock();
        Self::stop_locked(&mut state);
    }

    /// Stop and detach the listener. The source cannot be restarted.
    pub fn release(&self) {
        let mut state = self.lock();
        Self::stop_locked(&mut state);
        state.listener = None;
    }

    /// Reopen on the other device, keeping rotation and mirror settings.
    pub fn switch_device(&self) -> Result<CaptureGeometry, CaptureError> {
        let mut state = self.lock();
        let current = match &state.running {
            Some(running) => running.geometry.camera_id,
            None => select_device(self.driver.device_count(), state.camera_id).unwrap_or(0),
        };
        let next = if current == 0 { 1 } else { 0 };
        tracing::info!(from = current, to = next, "switching camera");
        state.camera_id = Some(next);
        Self::stop_locked(&mut state);
        self.start_locked(&mut state)
    }

    /// Apply a new display rotation (quarter turns) to the open device.
    ///
    /// Returns the recomputed orientation, or `None` when closed.
    pub fn change_display_orientation(&self, device_rotation: u32) -> Option<u32> {
        let mut state = self.lock();
        state.config.device_rotation = device_rotation;
        let additional = state.config.additional_rotation;
        let listener = state.listener.clone();

        let running = state.running.as_mut().filter(|r| r.is_open())?;
        let orientation = display_orientation(
            running.geometry.facing,
            running.sensor_orientation,
            device_rotation,
            additional,
        );
        running.geometry.orientation = orientation;
        let camera_id = running.geometry.camera_id;
        tracing::info!(camera_id, orientation, "display orientation changed");

        if let Some(listener) = listener {
            listener.on_event(CaptureEvent::ConfigurationChanged {
                camera_id,
                orientation,
            });
        }
        Some(orientation)
    }

    pub fn is_open(&self) -> bool {
        self.lock().running.as_ref().is_some_and(Running::is_open)
    }

    pub fn geometry(&self) -> Option<CaptureGeometry> {
        self.lock()
            .running
            .as_ref()
            .filter(|r| r.is_open())
            .map(|r| r.geometry)
    }

    fn start_locked(&self, state: &mut SourceState) -> Result<CaptureGeometry, CaptureError> {
        match &state.running {
            Some(running) if running.is_open() => {
                tracing::debug!(camera_id = running.geometry.camera_id, "capture already started");
                return Ok(running.geometry);
            }
            // Stream ended on its own; reap the thread before reopening.
            Some(_) => Self::stop_locked(state),
            None => {}
        }
        let Some(listener) = state.listener.clone() else {
            return Err(CaptureError::Released);
        };

        match self.open_device(state, Arc::clone(&listener)) {
            Ok(running) => {
                let geometry = running.geometry;
                state.running = Some(running);
                Ok(geometry)
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to start capture");
                listener.on_event(CaptureEvent::Error(e.clone()));
                Err(e)
            }
        }
    }

    fn open_device(
        &self,
        state: &SourceState,
        listener: Arc<dyn CaptureListener>,
    ) -> Result<Running, CaptureError> {
        let camera_id = select_device(self.driver.device_count(), state.camera_id)
            .ok_or(CaptureError::NoCameraFound)?;
        let info = self.driver.device_info(camera_id)?;
        let config = &state.config;

        let sensor_orientation = info.sensor_orientation / 90 * 90 % 360;
        let size = negotiate_size(
            &info.supported_sizes,
            config.view_size(),
            config.requested_size(),
            config.additional_rotation,
            info.default_size,
        );
        let orientation = display_orientation(
            info.facing,
            sensor_orientation,
            config.device_rotation,
            config.additional_rotation,
        );
        let geometry = CaptureGeometry {
            camera_id,
            facing: info.facing,
            size,
            orientation,
            mirror: config.mirror,
            mirror_horizontal: config.mirror_horizontal,
            mirror_vertical: config.mirror_vertical,
        };

        let mut stream = self.driver.open(camera_id, size)?;
        tracing::info!(
            camera_id,
            facing = ?info.facing,
            size = %size,
            orientation,
            "camera opened"
        );
        listener.on_event(CaptureEvent::Opened(geometry));

        let stop = Arc::new(AtomicBool::new(false));
        let open = Arc::new(AtomicBool::new(true));
        let stop_flag = Arc::clone(&stop);
        let open_flag = Arc::clone(&open);
        let thread = std::thread::Builder::new()
            .name("idverify-capture".into())
            .spawn(move || {
                tracing::debug!(camera_id, "capture thread started");
                let mut ended = false;
                while !stop_flag.load(Ordering::SeqCst) {
                    match stream.next_frame() {
                        Ok(Some(data)) => {
                            let image =
                                Image::new(data, size.width, size.height, PixelFormat::Nv21);
                            listener.on_event(CaptureEvent::Frame(image));
                        }
                        Ok(None) => {
                            tracing::info!(camera_id, "frame stream ended");
                            ended = true;
                            break;
                        }
                        Err(e) => {
                            tracing::error!(camera_id, error = %e, "frame capture failed");
                            listener.on_event(CaptureEvent::Error(e));
                            ended = true;
                            break;
                        }
                    }
                }
                drop(stream);
                if ended && open_flag.swap(false, Ordering::SeqCst) {
                    tracing::info!(camera_id, "camera closed");
                    listener.on_event(CaptureEvent::Closed);
                }
                tracing::debug!(camera_id, "capture thread exiting");
            })
            .map_err(|e| CaptureError::ThreadSpawn(Arc::new(e)))?;

        Ok(Running {
            geometry,
            sensor_orientation,
            stop,
            open,
            thread: Some(thread),
        })
    }

    fn stop_locked(state: &mut SourceState) {
        let Some(mut running) = state.running.take() else {
            return;
        };
        running.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = running.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("capture thread panicked");
            }
        }
        if !running.open.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!(camera_id = running.geometry.camera_id, "camera closed");
        if let Some(listener) = &state.listener {
            listener.on_event(CaptureEvent::Closed);
        }
    }
}

impl Drop for CaptureSource {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        Self::stop_locked(state);
    }
}

/// The configured device when it exists, otherwise the last one.
fn select_device(count: usize, configured: Option<usize>) -> Option<usize> {
    match configured {
        _ if count == 0 => None,
        Some(id) if id < count => Some(id),
        Some(id) => {
            tracing::warn!(camera_id = id, count, "configured camera missing, using default");
            Some(count - 1)
        }
        None => Some(count - 1),
    }
}
