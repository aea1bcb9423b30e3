use chrono::{NaiveDate, NaiveTime};
use image::RgbImage;
use rollcall_core::{FaceEncoder, FrameSource, ReportRow, Session, SessionError, Student};
use rollcall_hw::{Camera, CameraError, Frame};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("no frame available from the camera")]
    NoFrame,
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Snapshot of engine state for the `Status` call.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub camera_on: bool,
    pub gallery_size: usize,
    pub pending_capture: bool,
    pub frames_processed: u64,
    pub last_marked: Option<(String, NaiveTime)>,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    StartCamera {
        reply: oneshot::Sender<()>,
    },
    StopCamera {
        reply: oneshot::Sender<()>,
    },
    Capture {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Register {
        student_id: String,
        name: String,
        age: String,
        reply: oneshot::Sender<Result<Student, EngineError>>,
    },
    Report {
        date: Option<NaiveDate>,
        reply: oneshot::Sender<Result<Vec<ReportRow>, EngineError>>,
    },
    ListStudents {
        reply: oneshot::Sender<Result<Vec<Student>, EngineError>>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    pub async fn start_camera(&self) -> Result<(), EngineError> {
        self.call(|reply| EngineRequest::StartCamera { reply }).await
    }

    pub async fn stop_camera(&self) -> Result<(), EngineError> {
        self.call(|reply| EngineRequest::StopCamera { reply }).await
    }

    /// Grab a frame and keep its first face for the next registration.
    pub async fn capture(&self) -> Result<(), EngineError> {
        self.call(|reply| EngineRequest::Capture { reply }).await?
    }

    pub async fn register(
        &self,
        student_id: String,
        name: String,
        age: String,
    ) -> Result<Student, EngineError> {
        self.call(|reply| EngineRequest::Register { student_id, name, age, reply })
            .await?
    }

    pub async fn report(&self, date: Option<NaiveDate>) -> Result<Vec<ReportRow>, EngineError> {
        self.call(|reply| EngineRequest::Report { date, reply }).await?
    }

    pub async fn list_students(&self) -> Result<Vec<Student>, EngineError> {
        self.call(|reply| EngineRequest::ListStudents { reply }).await?
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.call(|reply| EngineRequest::Status { reply }).await
    }
}

/// Camera adapter for the session tick.
///
/// Warmup frames are discarded each time the stream (re)starts; dark frames
/// are dropped before they reach the encoder.
pub struct CameraSource {
    camera: Camera,
    warmup_frames: usize,
}

impl CameraSource {
    pub fn new(camera: Camera, warmup_frames: usize) -> Self {
        Self {
            camera,
            warmup_frames,
        }
    }
}

impl FrameSource for CameraSource {
    fn next_frame(&mut self) -> Option<RgbImage> {
        if !self.camera.is_streaming() && self.warmup_frames > 0 {
            tracing::info!(count = self.warmup_frames, "discarding warmup frames");
            self.camera.discard_frames(self.warmup_frames);
        }
        match self.camera.capture_frame() {
            Ok(frame) => usable_image(frame),
            Err(e) => {
                tracing::warn!(error = %e, "frame capture failed; skipping tick");
                None
            }
        }
    }

    fn release(&mut self) {
        self.camera.stop_stream();
    }
}

fn usable_image(frame: Frame) -> Option<RgbImage> {
    if frame.is_dark {
        tracing::debug!(seq = frame.sequence, "dark frame skipped");
        return None;
    }
    Some(frame.image)
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread owns the session and frame source. While the camera is on it
/// ticks every `tick_interval`, serving requests in between; while off it
/// just waits for requests.
pub fn spawn_engine<E, S>(
    session: Session<E>,
    source: S,
    tick_interval: Duration,
    preview_path: Option<PathBuf>,
) -> std::io::Result<EngineHandle>
where
    E: FaceEncoder + Send + 'static,
    S: FrameSource + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<EngineRequest>();

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            let mut engine = Engine {
                session,
                source,
                preview_path,
                frames_processed: 0,
                last_marked: None,
            };
            let mut next_tick = Instant::now();

            loop {
                let request = if engine.session.is_camera_on() {
                    let wait = next_tick.saturating_duration_since(Instant::now());
                    match rx.recv_timeout(wait) {
                        Ok(req) => Some(req),
                        Err(RecvTimeoutError::Timeout) => None,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                } else {
                    match rx.recv() {
                        Ok(req) => Some(req),
                        Err(_) => break,
                    }
                };

                match request {
                    Some(req) => {
                        let was_on = engine.session.is_camera_on();
                        engine.handle(req);
                        if !was_on && engine.session.is_camera_on() {
                            next_tick = Instant::now();
                        }
                    }
                    None => {
                        engine.tick();
                        next_tick = Instant::now() + tick_interval;
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx })
}

struct Engine<E, S> {
    session: Session<E>,
    source: S,
    preview_path: Option<PathBuf>,
    frames_processed: u64,
    last_marked: Option<(String, NaiveTime)>,
}

impl<E: FaceEncoder, S: FrameSource> Engine<E, S> {
    fn handle(&mut self, req: EngineRequest) {
        match req {
            EngineRequest::StartCamera { reply } => {
                self.session.start_camera();
                let _ = reply.send(());
            }
            EngineRequest::StopCamera { reply } => {
                self.session.stop_camera();
                self.source.release();
                let _ = reply.send(());
            }
            EngineRequest::Capture { reply } => {
                let _ = reply.send(self.capture());
            }
            EngineRequest::Register {
                student_id,
                name,
                age,
                reply,
            } => {
                let result = self
                    .session
                    .register_student(&student_id, &name, &age)
                    .map_err(EngineError::from);
                let _ = reply.send(result);
            }
            EngineRequest::Report { date, reply } => {
                let _ = reply.send(self.session.report(date).map_err(EngineError::from));
            }
            EngineRequest::ListStudents { reply } => {
                let _ = reply.send(self.session.list_students().map_err(EngineError::from));
            }
            EngineRequest::Status { reply } => {
                let _ = reply.send(EngineStatus {
                    camera_on: self.session.is_camera_on(),
                    gallery_size: self.session.gallery().len(),
                    pending_capture: self.session.has_pending_template(),
                    frames_processed: self.frames_processed,
                    last_marked: self.last_marked.clone(),
                });
            }
        }
    }

    fn capture(&mut self) -> Result<(), EngineError> {
        if !self.session.is_camera_on() {
            return Err(SessionError::CameraOff.into());
        }
        let frame = self.source.next_frame().ok_or(EngineError::NoFrame)?;
        self.session.capture_template(&frame)?;
        Ok(())
    }

    fn tick(&mut self) {
        let outcome = match self.session.tick(&mut self.source) {
            Ok(Some(outcome)) => outcome,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, "frame processing failed");
                return;
            }
        };
        self.frames_processed += 1;

        for (student_id, time) in &outcome.marked {
            tracing::info!(student_id, %time, "attendance marked");
        }
        if let Some(last) = outcome.marked.last() {
            self.last_marked = Some(last.clone());
        }

        if let Some(path) = &self.preview_path {
            if let Err(e) = outcome.annotated.save(path) {
                tracing::debug!(path = %path.display(), error = %e, "preview write failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::{
        BoundingBox, DetectedFace, EncoderError, FixedClock, GalleryCache, Store, Template,
    };
    use image::Rgb;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Reports one face with the same template for every frame.
    struct SameFace;

    impl FaceEncoder for SameFace {
        fn detect_and_encode(&mut self, _: &RgbImage) -> Result<Vec<DetectedFace>, EncoderError> {
            Ok(vec![DetectedFace {
                location: BoundingBox { top: 1, right: 4, bottom: 4, left: 1 },
                template: Template::new(vec![0.1, 0.2]),
            }])
        }
    }

    /// Blank frames; counts how often the stream was released.
    #[derive(Default)]
    struct BlankFrames {
        released: Arc<AtomicUsize>,
    }

    impl FrameSource for BlankFrames {
        fn next_frame(&mut self) -> Option<RgbImage> {
            Some(RgbImage::new(32, 32))
        }

        fn release(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn engine() -> (EngineHandle, Arc<Store>) {
        let (handle, store, _) = engine_with_source(BlankFrames::default());
        (handle, store)
    }

    fn engine_with_source(source: BlankFrames) -> (EngineHandle, Arc<Store>, Arc<AtomicUsize>) {
        let released = Arc::clone(&source.released);
        let store = Arc::new(Store::open_in_memory().unwrap());
        let clock = FixedClock(
            NaiveDate::from_ymd_opt(2024, 1, 1)
                .unwrap()
                .and_hms_opt(9, 0, 0)
                .unwrap(),
        );
        let session = Session::new(Arc::clone(&store), Arc::new(GalleryCache::new()), SameFace)
            .with_clock(clock);
        let handle = spawn_engine(session, source, Duration::from_millis(1), None).unwrap();
        (handle, store, released)
    }

    #[tokio::test]
    async fn test_capture_requires_camera() {
        let (engine, _) = engine();
        let err = engine.capture().await.unwrap_err();
        assert!(matches!(err, EngineError::Session(SessionError::CameraOff)));
    }

    #[tokio::test]
    async fn test_register_then_tick_marks_attendance() {
        let (engine, store) = engine();
        engine.start_camera().await.unwrap();
        engine.capture().await.unwrap();
        let student = engine
            .register("S1".into(), "Alice".into(), "20".into())
            .await
            .unwrap();
        assert_eq!(student.student_id, "S1");

        // Let the timer run a few ticks.
        let day = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let mut marked = false;
        for _ in 0..200 {
            if !store.attendance_on(day).unwrap().is_empty() {
                marked = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(marked, "tick loop never marked attendance");

        engine.stop_camera().await.unwrap();
        let status = engine.status().await.unwrap();
        assert!(!status.camera_on);
        assert_eq!(status.gallery_size, 1);
        assert!(status.frames_processed > 0);
        assert_eq!(status.last_marked.map(|(id, _)| id), Some("S1".to_string()));

        let report = engine.report(Some(day)).await.unwrap();
        assert_eq!(report.len(), 1);
        assert_eq!(store.attendance_on(day).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_register_validation_passes_through() {
        let (engine, _) = engine();
        let err = engine
            .register("S1".into(), "Alice".into(), "abc".into())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Session(SessionError::Validation(_))));
        assert!(engine.list_students().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_camera_releases_stream() {
        let (engine, _, released) = engine_with_source(BlankFrames::default());
        engine.start_camera().await.unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 0);
        engine.stop_camera().await.unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dark_frames_are_skipped() {
        let dark = Frame {
            image: RgbImage::new(8, 8),
            sequence: 1,
            is_dark: true,
        };
        assert!(usable_image(dark).is_none());

        let lit = Frame {
            image: RgbImage::from_pixel(8, 8, Rgb([120, 120, 120])),
            sequence: 2,
            is_dark: false,
        };
        assert_eq!(usable_image(lit).map(|i| i.dimensions()), Some((8, 8)));
    }
}
