//! End-to-end sessions through a capture source, the orchestrator and a
//! mock recognizer.

use idverify_core::{
    CameraDriver, CaptureConfig, CaptureError, CaptureSource, Cue, DetectedFace, DeviceInfo,
    EngineError, Facing, Feature, FrameStream, Image, MachineState, Orchestrator,
    OrchestratorHandle, PixelFormat, PresentationSink, Prompt, Recognizer, Rect,
    ReferenceSubject, Size, Verdict, VerifyConfig,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct MockRecognizer {
    face_present: AtomicBool,
    score: f32,
    compares: AtomicUsize,
}

impl MockRecognizer {
    fn new(face_present: bool, score: f32) -> Arc<Self> {
        Arc::new(Self {
            face_present: AtomicBool::new(face_present),
            score,
            compares: AtomicUsize::new(0),
        })
    }
}

impl Recognizer for MockRecognizer {
    fn detect_faces(&self, image: &Image) -> Result<Vec<DetectedFace>, EngineError> {
        let present = match image.format {
            PixelFormat::Bgr24 => true,
            PixelFormat::Nv21 => self.face_present.load(Ordering::SeqCst),
        };
        Ok(if present {
            vec![DetectedFace {
                track_id: 7,
                rect: Rect::new(20, 20, 60, 80),
            }]
        } else {
            vec![]
        })
    }

    fn extract_feature(&self, image: &Image, _face: &DetectedFace) -> Result<Feature, EngineError> {
        Ok(Feature::new(vec![image.data[0]]))
    }

    fn compare_features(&self, _a: &Feature, _b: &Feature) -> Result<f32, EngineError> {
        self.compares.fetch_add(1, Ordering::SeqCst);
        Ok(self.score)
    }
}

struct TickingStream {
    size: Size,
}

impl FrameStream for TickingStream {
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, CaptureError> {
        std::thread::sleep(Duration::from_millis(10));
        Ok(Some(vec![
            0u8;
            PixelFormat::Nv21.buffer_len(self.size.width, self.size.height)
        ]))
    }
}

struct OneCamera;

impl CameraDriver for OneCamera {
    fn device_count(&self) -> usize {
        1
    }

    fn device_info(&self, _camera_id: usize) -> Result<DeviceInfo, CaptureError> {
        Ok(DeviceInfo {
            facing: Facing::Front,
            sensor_orientation: 270,
            supported_sizes: vec![Size::new(64, 48), Size::new(32, 24)],
            default_size: Size::new(32, 24),
        })
    }

    fn open(&self, _camera_id: usize, size: Size) -> Result<Box<dyn FrameStream>, CaptureError> {
        Ok(Box::new(TickingStream { size }))
    }
}

#[derive(Default)]
struct Recorded {
    prompts: Vec<Prompt>,
    cues: Vec<Cue>,
    overlays: usize,
}

#[derive(Clone, Default)]
struct RecordingSink(Arc<Mutex<Recorded>>);

impl PresentationSink for RecordingSink {
    fn show_prompt(&mut self, prompt: Prompt) {
        self.0.lock().unwrap().prompts.push(prompt);
    }

    fn update_overlay(&mut self, rect: Option<Rect>) {
        if rect.is_some() {
            self.0.lock().unwrap().overlays += 1;
        }
    }

    fn play_cue(&mut self, cue: Cue) {
        self.0.lock().unwrap().cues.push(cue);
    }
}

fn config(read_timeout_ms: u64) -> VerifyConfig {
    VerifyConfig {
        read_timeout_ms,
        restart_delay_ms: 100,
        prompt_interval_ms: 30,
        capture: CaptureConfig {
            view_width: Some(480),
            view_height: Some(640),
            ..CaptureConfig::default()
        },
        ..VerifyConfig::default()
    }
}

fn reference(name: &str) -> ReferenceSubject {
    ReferenceSubject::new(name, Image::new(vec![9u8; 48], 4, 4, PixelFormat::Bgr24))
}

async fn wait_for_state(handle: &OrchestratorHandle, wanted: MachineState) {
    let mut rx = handle.subscribe();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == wanted))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {wanted:?}"))
        .unwrap();
}

async fn wait_for_gate(handle: &OrchestratorHandle) {
    let gate = handle.reference_gate();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !gate.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("engine never became ready");
}

async fn start(
    config: &VerifyConfig,
    recognizer: Arc<MockRecognizer>,
    sink: RecordingSink,
) -> (OrchestratorHandle, tokio::task::JoinHandle<()>, CaptureSource) {
    let (handle, task) = Orchestrator::spawn(config, recognizer, sink).unwrap();
    let source = CaptureSource::new(
        Arc::new(OneCamera),
        config.capture.clone(),
        handle.capture_listener(),
    );
    let geometry = source.start().unwrap();
    assert_eq!(geometry.size, Size::new(64, 48));
    assert_eq!(geometry.orientation, 90);
    wait_for_gate(&handle).await;
    (handle, task, source)
}

#[tokio::test]
async fn test_matching_face_passes_and_session_restarts() {
    let config = config(5000);
    let recognizer = MockRecognizer::new(true, 0.90);
    let sink = RecordingSink::default();
    let (handle, task, source) = start(&config, recognizer.clone(), sink.clone()).await;

    assert!(handle.submit_reference(reference("A")));
    wait_for_state(&handle, MachineState::ResultShown).await;

    {
        let recorded = sink.0.lock().unwrap();
        assert!(recorded.prompts.contains(&Prompt::Result {
            verdict: Verdict::Success,
            display_name: "A".into(),
        }));
        assert_eq!(recorded.cues.last(), Some(&Cue::CompareSuccess));
        assert!(recorded.overlays > 0);
    }
    assert_eq!(recognizer.compares.load(Ordering::SeqCst), 1);

    wait_for_state(&handle, MachineState::AwaitingReference).await;
    assert_eq!(
        sink.0.lock().unwrap().prompts.last(),
        Some(&Prompt::SubmitReference)
    );

    source.stop();
    handle.shutdown();
    task.await.unwrap();
}

#[tokio::test]
async fn test_mismatch_reports_failure() {
    let config = config(5000);
    let recognizer = MockRecognizer::new(true, 0.40);
    let sink = RecordingSink::default();
    let (handle, task, source) = start(&config, recognizer, sink.clone()).await;

    handle.submit_reference(reference("B"));
    wait_for_state(&handle, MachineState::ResultShown).await;

    let recorded = sink.0.lock().unwrap();
    assert!(recorded.prompts.contains(&Prompt::Result {
        verdict: Verdict::Failure,
        display_name: "B".into(),
    }));
    assert_eq!(recorded.cues.last(), Some(&Cue::CompareFail));
    drop(recorded);

    source.stop();
    handle.shutdown();
    task.await.unwrap();
}

#[tokio::test]
async fn test_absent_face_times_out_to_idle() {
    let config = config(300);
    let recognizer = MockRecognizer::new(false, 0.90);
    let sink = RecordingSink::default();
    let (handle, task, source) = start(&config, recognizer.clone(), sink.clone()).await;

    handle.submit_reference(reference("A"));
    wait_for_state(&handle, MachineState::Armed).await;
    wait_for_state(&handle, MachineState::AwaitingReference).await;

    assert_eq!(recognizer.compares.load(Ordering::SeqCst), 0);
    let recorded = sink.0.lock().unwrap();
    assert!(recorded.cues.iter().any(|c| *c == Cue::LookAtScreen));
    assert!(recorded.prompts.contains(&Prompt::LookAtCamera));
    assert_eq!(recorded.prompts.last(), Some(&Prompt::SubmitReference));
    assert!(handle.reference_gate().load(Ordering::SeqCst));
    drop(recorded);

    source.stop();
    handle.shutdown();
    task.await.unwrap();
}
