//! The single serialization point.
//!
//! Capture events, engine completions, timer firings and references all
//! arrive from different threads. They are funneled into one tokio task that
//! owns the [`VerificationMachine`] and applies them in arrival order. Frames
//! travel on a separate bounded channel and are dropped, not queued, when the
//! machine falls behind; every other event is delivered.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::capture::{CaptureEvent, CaptureListener};
use crate::config::VerifyConfig;
use crate::engine::{EngineError, EngineHandle, FeatureResponse, Recognizer, ResponseFn};
use crate::machine::{MachineSettings, MachineState, VerificationMachine};
use crate::presentation::PresentationSink;
use crate::reference::ReferenceSubject;
use crate::timers::{FireFn, TimerKind, TokioScheduler};
use crate::tracker::RequestTracker;
use crate::types::Image;

#[derive(Debug)]
enum Event {
    Reference(ReferenceSubject),
    Feature(FeatureResponse),
    Timer { kind: TimerKind, generation: u64 },
    Capture(CaptureEvent),
    EngineStatus(Result<(), String>),
    Shutdown,
}

/// Clone-safe handle for feeding the orchestrator.
#[derive(Clone)]
pub struct OrchestratorHandle {
    control: mpsc::UnboundedSender<Event>,
    frames: mpsc::Sender<Image>,
    gate: Arc<AtomicBool>,
    state: watch::Receiver<MachineState>,
}

impl OrchestratorHandle {
    /// Submit a reference subject. Returns `false` once the orchestrator
    /// has stopped.
    pub fn submit_reference(&self, subject: ReferenceSubject) -> bool {
        self.control.send(Event::Reference(subject)).is_ok()
    }

    pub fn shutdown(&self) {
        let _ = self.control.send(Event::Shutdown);
    }

    /// Open while the machine is willing to start a new session.
    pub fn reference_gate(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.gate)
    }

    pub fn state(&self) -> MachineState {
        *self.state.borrow()
    }

    /// Watch state transitions, published after every processed event.
    pub fn subscribe(&self) -> watch::Receiver<MachineState> {
        self.state.clone()
    }

    /// Listener to register with a [`CaptureSource`](crate::CaptureSource).
    pub fn capture_listener(&self) -> Arc<dyn CaptureListener> {
        Arc::new(Forwarder {
            control: self.control.clone(),
            frames: self.frames.clone(),
        })
    }
}

struct Forwarder {
    control: mpsc::UnboundedSender<Event>,
    frames: mpsc::Sender<Image>,
}

impl CaptureListener for Forwarder {
    fn on_event(&self, event: CaptureEvent) {
        match event {
            CaptureEvent::Frame(image) => match self.frames.try_send(image) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!("orchestrator busy, frame dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            },
            other => {
                let _ = self.control.send(Event::Capture(other));
            }
        }
    }
}

type Machine<R, P> = VerificationMachine<EngineHandle<R>, P, TokioScheduler>;

pub struct Orchestrator;

impl Orchestrator {
    /// Spawn the extractor thread, activate the engine in the background and
    /// start the orchestrator task. Must be called within a tokio runtime.
    pub fn spawn<R, P>(
        config: &VerifyConfig,
        recognizer: Arc<R>,
        sink: P,
    ) -> Result<(OrchestratorHandle, JoinHandle<()>), EngineError>
    where
        R: Recognizer,
        P: PresentationSink + Send + 'static,
    {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (frame_tx, frame_rx) = mpsc::channel(config.frame_queue_size.max(1));

        let feature_tx = control_tx.clone();
        let respond: ResponseFn = Arc::new(move |response| {
            let _ = feature_tx.send(Event::Feature(response));
        });
        let engine = EngineHandle::spawn(
            Arc::clone(&recognizer),
            config.extract_queue_size,
            respond,
        )?;

        let timer_tx = control_tx.clone();
        let fire: FireFn = Arc::new(move |kind, generation| {
            let _ = timer_tx.send(Event::Timer { kind, generation });
        });

        let machine = VerificationMachine::new(
            engine,
            sink,
            TokioScheduler::new(fire),
            Arc::new(RequestTracker::new(config.request_timeout())),
            MachineSettings::from_config(config),
        );
        let gate = machine.reference_gate();
        let (state_tx, state_rx) = watch::channel(machine.state());

        let activation_tx = control_tx.clone();
        tokio::spawn(async move {
            let status = match tokio::task::spawn_blocking(move || recognizer.activate()).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(e) => Err(format!("activation task failed: {e}")),
            };
            let _ = activation_tx.send(Event::EngineStatus(status));
        });

        let task = tokio::spawn(run(machine, control_rx, frame_rx, state_tx));

        let handle = OrchestratorHandle {
            control: control_tx,
            frames: frame_tx,
            gate,
            state: state_rx,
        };
        Ok((handle, task))
    }
}

async fn run<R, P>(
    mut machine: Machine<R, P>,
    mut control: mpsc::UnboundedReceiver<Event>,
    mut frames: mpsc::Receiver<Image>,
    state: watch::Sender<MachineState>,
) where
    R: Recognizer,
    P: PresentationSink,
{
    tracing::info!("orchestrator started");
    loop {
        tokio::select! {
            biased;
            event = control.recv() => match event {
                Some(Event::Shutdown) | None => break,
                Some(event) => dispatch(&mut machine, event),
            },
            Some(image) = frames.recv() => machine.on_frame(image),
        }
        state.send_replace(machine.state());
    }
    tracing::info!("orchestrator stopped");
}

fn dispatch<R, P>(machine: &mut Machine<R, P>, event: Event)
where
    R: Recognizer,
    P: PresentationSink,
{
    match event {
        Event::Reference(subject) => machine.submit_reference(subject),
        Event::Feature(response) => machine.on_feature(response),
        Event::Timer { kind, generation } => {
            if machine.scheduler_mut().claim(kind, generation) {
                machine.on_timer(kind);
            }
        }
        Event::Capture(CaptureEvent::Opened(geometry)) => machine.on_capture_opened(geometry),
        Event::Capture(CaptureEvent::Frame(image)) => machine.on_frame(image),
        Event::Capture(CaptureEvent::ConfigurationChanged {
            camera_id,
            orientation,
        }) => machine.on_orientation_changed(camera_id, orientation),
        Event::Capture(CaptureEvent::Closed) => machine.on_capture_closed(),
        Event::Capture(CaptureEvent::Error(e)) => machine.on_capture_error(&e),
        Event::EngineStatus(Ok(())) => machine.set_engine_ready(true),
        Event::EngineStatus(Err(reason)) => {
            tracing::error!(%reason, "engine activation failed");
            machine.set_engine_ready(false);
        }
        Event::Shutdown => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presentation::{Cue, Prompt};
    use crate::types::{DetectedFace, Feature, PixelFormat, Rect};
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;
    use std::time::Duration;

    struct StubRecognizer {
        activation: Result<(), String>,
        panics: bool,
    }

    impl Recognizer for StubRecognizer {
        fn activate(&self) -> Result<(), EngineError> {
            self.activation.clone().map_err(EngineError::Unavailable)
        }

        fn detect_faces(&self, _image: &Image) -> Result<Vec<DetectedFace>, EngineError> {
            if self.panics {
                panic!("detector crashed");
            }
            Ok(vec![DetectedFace {
                track_id: 1,
                rect: Rect::new(0, 0, 2, 2),
            }])
        }

        fn extract_feature(&self, _image: &Image, _face: &DetectedFace) -> Result<Feature, EngineError> {
            Ok(Feature::new(vec![1]))
        }

        fn compare_features(&self, _a: &Feature, _b: &Feature) -> Result<f32, EngineError> {
            Ok(1.0)
        }
    }

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<Prompt>>>);

    impl PresentationSink for SharedSink {
        fn show_prompt(&mut self, prompt: Prompt) {
            self.0.lock().unwrap().push(prompt);
        }

        fn update_overlay(&mut self, _rect: Option<Rect>) {}

        fn play_cue(&mut self, _cue: Cue) {}
    }

    fn frame() -> Image {
        Image::new(vec![0u8; 6], 2, 2, PixelFormat::Nv21)
    }

    async fn wait_for_gate(handle: &OrchestratorHandle) {
        let gate = handle.reference_gate();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !gate.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_unavailable_engine_keeps_gate_closed() {
        let recognizer = Arc::new(StubRecognizer {
            activation: Err("license expired".into()),
            panics: false,
        });
        let sink = SharedSink::default();
        let (handle, task) =
            Orchestrator::spawn(&VerifyConfig::default(), recognizer, sink.clone()).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!handle.reference_gate().load(Ordering::SeqCst));
        assert!(sink.0.lock().unwrap().is_empty());

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_ready_engine_opens_gate_and_shuts_down() {
        let recognizer = Arc::new(StubRecognizer {
            activation: Ok(()),
            panics: false,
        });
        let sink = SharedSink::default();
        let (handle, task) =
            Orchestrator::spawn(&VerifyConfig::default(), recognizer, sink.clone()).unwrap();

        wait_for_gate(&handle).await;
        assert_eq!(*sink.0.lock().unwrap(), vec![Prompt::SubmitReference]);
        assert_eq!(handle.state(), MachineState::AwaitingReference);

        handle.shutdown();
        task.await.unwrap();
        let reference = ReferenceSubject::new("A", Image::new(vec![0u8; 12], 4, 1, PixelFormat::Bgr24));
        assert!(!handle.submit_reference(reference));
    }

    #[tokio::test]
    async fn test_recognizer_panic_skips_frame_and_keeps_running() {
        let recognizer = Arc::new(StubRecognizer {
            activation: Ok(()),
            panics: true,
        });
        let sink = SharedSink::default();
        let (handle, task) =
            Orchestrator::spawn(&VerifyConfig::default(), recognizer, sink.clone()).unwrap();
        wait_for_gate(&handle).await;

        let listener = handle.capture_listener();
        for _ in 0..3 {
            listener.on_event(CaptureEvent::Frame(frame()));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // Detection panics on the reference too, which reads as "no face".
        let reference = ReferenceSubject::new("A", Image::new(vec![0u8; 12], 4, 1, PixelFormat::Bgr24));
        assert!(handle.submit_reference(reference));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!task.is_finished());
        assert_eq!(handle.state(), MachineState::AwaitingReference);
        assert_eq!(
            *sink.0.lock().unwrap(),
            vec![Prompt::SubmitReference, Prompt::SubmitReference]
        );

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_frames_beyond_queue_are_dropped() {
        let (control, _control_rx) = mpsc::unbounded_channel();
        let (frames, mut frame_rx) = mpsc::channel(2);
        let forwarder = Forwarder { control, frames };

        for _ in 0..5 {
            forwarder.on_event(CaptureEvent::Frame(frame()));
        }
        let mut received = 0;
        while frame_rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 2);
    }

    #[tokio::test]
    async fn test_lifecycle_events_are_never_dropped() {
        let (control, mut control_rx) = mpsc::unbounded_channel();
        let (frames, _frame_rx) = mpsc::channel(1);
        let forwarder = Forwarder { control, frames };

        for _ in 0..3 {
            forwarder.on_event(CaptureEvent::Frame(frame()));
        }
        forwarder.on_event(CaptureEvent::Closed);
        assert!(matches!(
            control_rx.try_recv(),
            Ok(Event::Capture(CaptureEvent::Closed))
        ));
    }
}
