//! Operator session: camera state, pending capture, and the frame tick.
//!
//! All mutable session state lives in [`Session`] so independent sessions
//! can be built side by side. Scheduling is the caller's job: whatever
//! timer drives the camera calls [`Session::tick`] once per period.

use crate::annotate::{self, LabelFont, DOWNSCALE};
use crate::encoder::{EncoderError, FaceEncoder, FrameSource};
use crate::gallery::GalleryCache;
use crate::matcher::{
    EuclideanComparator, FirstMatchMatcher, Identification, Matcher, DEFAULT_TOLERANCE,
};
use crate::recorder::{AttendanceRecorder, Clock, MarkOutcome, SystemClock};
use crate::store::{Store, StoreError};
use crate::types::{BoundingBox, ReportRow, Student, Template};
use chrono::{NaiveDate, NaiveTime};
use image::RgbImage;
use std::sync::Arc;
use thiserror::Error;

/// Operator input rejected before any mutation.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("age must be a number, got {0:?}")]
    AgeNotANumber(String),
    #[error("age must be positive")]
    AgeNotPositive,
    #[error("capture a face before registering")]
    NoCapturedFace,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("invalid input: {0}")]
    Validation(#[from] ValidationError),
    #[error("student id already exists: {0}")]
    DuplicateStudent(String),
    #[error("camera is not running")]
    CameraOff,
    #[error("no face detected in the frame")]
    NoFaceDetected,
    #[error("encoder: {0}")]
    Encoder(#[from] EncoderError),
    #[error("store: {0}")]
    Store(StoreError),
}

impl From<StoreError> for SessionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateStudent(id) => SessionError::DuplicateStudent(id),
            other => SessionError::Store(other),
        }
    }
}

/// Result of processing one camera frame.
pub struct FrameOutcome {
    /// The frame with face boxes drawn on it.
    pub annotated: RgbImage,
    /// One label per face in detection order: student id or "Unknown".
    pub labels: Vec<String>,
    /// Students whose attendance was recorded by this frame.
    pub marked: Vec<(String, NaiveTime)>,
}

/// Session context for one operator console.
pub struct Session<E> {
    store: Arc<Store>,
    gallery: Arc<GalleryCache>,
    encoder: E,
    matcher: Box<dyn Matcher + Send>,
    clock: Box<dyn Clock + Send>,
    tolerance: f32,
    label_font: Option<LabelFont>,

    camera_on: bool,
    pending: Option<Template>,
    /// Only every other frame is encoded; alternate frames reuse `last_faces`.
    process_this_frame: bool,
    last_faces: Vec<(BoundingBox, Identification)>,
}

impl<E: FaceEncoder> Session<E> {
    pub fn new(store: Arc<Store>, gallery: Arc<GalleryCache>, encoder: E) -> Self {
        Self {
            store,
            gallery,
            encoder,
            matcher: Box::new(FirstMatchMatcher::new(EuclideanComparator)),
            clock: Box::new(SystemClock),
            tolerance: DEFAULT_TOLERANCE,
            label_font: None,
            camera_on: false,
            pending: None,
            process_this_frame: true,
            last_faces: Vec::new(),
        }
    }

    /// Render student ids into the label bars of annotated frames.
    pub fn with_label_font(mut self, font: LabelFont) -> Self {
        self.label_font = Some(font);
        self
    }

    pub fn with_clock(mut self, clock: impl Clock + Send + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn with_matcher(mut self, matcher: impl Matcher + Send + 'static) -> Self {
        self.matcher = Box::new(matcher);
        self
    }

    pub fn with_tolerance(mut self, tolerance: f32) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn start_camera(&mut self) {
        if !self.camera_on {
            tracing::info!("camera started");
        }
        self.camera_on = true;
    }

    pub fn stop_camera(&mut self) {
        if self.camera_on {
            tracing::info!("camera stopped");
        }
        self.camera_on = false;
        self.process_this_frame = true;
        self.last_faces.clear();
    }

    pub fn is_camera_on(&self) -> bool {
        self.camera_on
    }

    pub fn has_pending_template(&self) -> bool {
        self.pending.is_some()
    }

    pub fn gallery(&self) -> &GalleryCache {
        &self.gallery
    }

    /// Encode the full-resolution frame and keep the first face's template
    /// for the next registration.
    pub fn capture_template(&mut self, frame: &RgbImage) -> Result<(), SessionError> {
        if !self.camera_on {
            return Err(SessionError::CameraOff);
        }
        let face = self
            .encoder
            .detect_and_encode(frame)?
            .into_iter()
            .next()
            .ok_or(SessionError::NoFaceDetected)?;

        tracing::info!(dims = face.template.values.len(), "face captured");
        self.pending = Some(face.template);
        Ok(())
    }

    /// Register a student with the pending template.
    ///
    /// Nothing is written unless every field validates and a template has
    /// been captured. On success the pending template is cleared and the
    /// gallery rebuilt.
    pub fn register_student(
        &mut self,
        student_id: &str,
        name: &str,
        age: &str,
    ) -> Result<Student, SessionError> {
        let student_id = student_id.trim();
        let name = name.trim();
        let age = age.trim();
        if student_id.is_empty() {
            return Err(ValidationError::MissingField("student id").into());
        }
        if name.is_empty() {
            return Err(ValidationError::MissingField("name").into());
        }
        if age.is_empty() {
            return Err(ValidationError::MissingField("age").into());
        }
        let age: u32 = age
            .parse()
            .map_err(|_| ValidationError::AgeNotANumber(age.to_string()))?;
        if age == 0 {
            return Err(ValidationError::AgeNotPositive.into());
        }
        let template = self.pending.as_ref().ok_or(ValidationError::NoCapturedFace)?;
        let face_encoding = template.to_bytes();

        self.store.add_student(student_id, name, age, &face_encoding)?;

        self.pending = None;
        if let Err(err) = self.gallery.reload(&self.store) {
            tracing::error!(error = %err, "gallery reload after registration failed");
        }

        Ok(Student {
            student_id: student_id.to_string(),
            name: name.to_string(),
            age,
            face_encoding,
        })
    }

    /// Match every face in the frame, annotate it, and mark attendance for
    /// each recognized student in detection order.
    pub fn process_frame(&mut self, frame: RgbImage) -> Result<FrameOutcome, SessionError> {
        if self.process_this_frame {
            let small = annotate::downscale(&frame);
            let faces = self.encoder.detect_and_encode(&small)?;
            let gallery = self.gallery.snapshot();
            let identified: Vec<_> = faces
                .into_iter()
                .map(|face| {
                    let id = self.matcher.identify(&face.template, &gallery, self.tolerance);
                    (face.location, id)
                })
                .collect();
            self.last_faces = identified;
        }
        self.process_this_frame = !self.process_this_frame;

        let mut annotated = frame;
        for (location, id) in &self.last_faces {
            annotate::draw_face(
                &mut annotated,
                &location.scale(DOWNSCALE),
                id.label(),
                self.label_font.as_ref(),
            );
        }

        let recorder = AttendanceRecorder::new(&self.store, &*self.clock);
        let mut marked = Vec::new();
        for student_id in self.last_faces.iter().filter_map(|(_, id)| id.student_id()) {
            if let MarkOutcome::Marked(time) = recorder.mark_if_new(student_id)? {
                tracing::info!(student_id, %time, "attendance marked");
                marked.push((student_id.to_string(), time));
            }
        }

        Ok(FrameOutcome {
            annotated,
            labels: self.last_faces.iter().map(|(_, id)| id.label().to_string()).collect(),
            marked,
        })
    }

    /// One timer period: pull a frame and process it while the camera runs.
    pub fn tick(&mut self, source: &mut dyn FrameSource) -> Result<Option<FrameOutcome>, SessionError> {
        if !self.camera_on {
            return Ok(None);
        }
        match source.next_frame() {
            Some(frame) => self.process_frame(frame).map(Some),
            None => Ok(None),
        }
    }

    pub fn today(&self) -> NaiveDate {
        self.clock.now().date()
    }

    /// Attendance report for `date`, today when `None`.
    pub fn report(&self, date: Option<NaiveDate>) -> Result<Vec<ReportRow>, SessionError> {
        let date = date.unwrap_or_else(|| self.today());
        Ok(self.store.attendance_report(date)?)
    }

    pub fn list_students(&self) -> Result<Vec<Student>, SessionError> {
        Ok(self.store.list_students()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::FixedClock;
    use crate::types::DetectedFace;
    use std::collections::VecDeque;

    /// Encoder returning queued answers; an empty queue means no faces.
    #[derive(Default)]
    struct QueuedEncoder {
        answers: VecDeque<Vec<DetectedFace>>,
        calls: usize,
    }

    impl FaceEncoder for QueuedEncoder {
        fn detect_and_encode(&mut self, _: &RgbImage) -> Result<Vec<DetectedFace>, EncoderError> {
            self.calls += 1;
            Ok(self.answers.pop_front().unwrap_or_default())
        }
    }

    struct OneFrame(Option<RgbImage>);

    impl FrameSource for OneFrame {
        fn next_frame(&mut self) -> Option<RgbImage> {
            self.0.take()
        }
    }

    fn face(values: Vec<f32>) -> DetectedFace {
        DetectedFace {
            location: BoundingBox { top: 2, right: 10, bottom: 10, left: 2 },
            template: Template::new(values),
        }
    }

    fn clock() -> FixedClock {
        FixedClock(
            NaiveDate::from_ymd_opt(2024, 1, 1)
                .unwrap()
                .and_hms_opt(9, 0, 0)
                .unwrap(),
        )
    }

    fn session(answers: Vec<Vec<DetectedFace>>) -> Session<QueuedEncoder> {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let gallery = Arc::new(GalleryCache::new());
        let encoder = QueuedEncoder { answers: answers.into(), calls: 0 };
        Session::new(store, gallery, encoder).with_clock(clock())
    }

    fn frame() -> RgbImage {
        RgbImage::new(64, 48)
    }

    #[test]
    fn test_capture_requires_camera() {
        let mut s = session(vec![vec![face(vec![0.0])]]);
        assert!(matches!(s.capture_template(&frame()), Err(SessionError::CameraOff)));
        assert!(!s.has_pending_template());
    }

    #[test]
    fn test_capture_no_face() {
        let mut s = session(vec![]);
        s.start_camera();
        assert!(matches!(s.capture_template(&frame()), Err(SessionError::NoFaceDetected)));
        assert!(!s.has_pending_template());
    }

    #[test]
    fn test_capture_keeps_first_face() {
        let mut s = session(vec![vec![face(vec![1.0]), face(vec![2.0])]]);
        s.start_camera();
        s.capture_template(&frame()).unwrap();
        let student = s.register_student("S1", "Alice", "20").unwrap();
        assert_eq!(Template::from_bytes(&student.face_encoding).unwrap().values, vec![1.0]);
    }

    #[test]
    fn test_register_validation_errors() {
        let mut s = session(vec![vec![face(vec![1.0])]]);
        assert_eq!(
            s.register_student("", "Alice", "20").unwrap_err().to_string(),
            "invalid input: student id is required"
        );
        assert!(matches!(
            s.register_student("S1", "Alice", "twenty"),
            Err(SessionError::Validation(ValidationError::AgeNotANumber(_)))
        ));
        assert!(matches!(
            s.register_student("S1", "Alice", "0"),
            Err(SessionError::Validation(ValidationError::AgeNotPositive))
        ));
        assert!(matches!(
            s.register_student("S1", "Alice", "20"),
            Err(SessionError::Validation(ValidationError::NoCapturedFace))
        ));
        assert!(s.list_students().unwrap().is_empty());
    }

    #[test]
    fn test_register_reloads_gallery_and_clears_pending() {
        let mut s = session(vec![vec![face(vec![1.0])]]);
        s.start_camera();
        s.capture_template(&frame()).unwrap();
        s.register_student("S1", "Alice", "20").unwrap();

        assert!(!s.has_pending_template());
        assert_eq!(s.gallery().len(), 1);
        assert!(matches!(
            s.register_student("S2", "Bob", "21"),
            Err(SessionError::Validation(ValidationError::NoCapturedFace))
        ));
    }

    #[test]
    fn test_duplicate_registration_keeps_pending() {
        let mut s = session(vec![vec![face(vec![1.0])], vec![face(vec![2.0])]]);
        s.start_camera();
        s.capture_template(&frame()).unwrap();
        s.register_student("S1", "Alice", "20").unwrap();
        s.capture_template(&frame()).unwrap();

        let err = s.register_student("S1", "Bob", "21").unwrap_err();
        assert!(matches!(err, SessionError::DuplicateStudent(ref id) if id == "S1"));
        assert!(s.has_pending_template());
        assert_eq!(s.list_students().unwrap()[0].name, "Alice");
    }

    #[test]
    fn test_process_frame_marks_once_and_alternates() {
        let mut s = session(vec![
            vec![face(vec![1.0])],
            vec![face(vec![1.0]), face(vec![9.0])],
        ]);
        s.start_camera();
        s.capture_template(&frame()).unwrap();
        s.register_student("S1", "Alice", "20").unwrap();

        let first = s.process_frame(frame()).unwrap();
        assert_eq!(first.labels, vec!["S1", "Unknown"]);
        assert_eq!(first.marked.len(), 1);
        assert_eq!(first.marked[0].0, "S1");
        // Face box scaled by 4: left edge at x=8.
        assert_eq!(first.annotated.get_pixel(8, 20).0, [255, 0, 0]);

        // Skipped frame reuses labels without calling the encoder again.
        let calls = s.encoder.calls;
        let second = s.process_frame(frame()).unwrap();
        assert_eq!(s.encoder.calls, calls);
        assert_eq!(second.labels, vec!["S1", "Unknown"]);
        assert!(second.marked.is_empty());

        let report = s.report(None).unwrap();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].time, NaiveTime::from_hms_opt(9, 0, 0));
    }

    #[test]
    fn test_tick_idle_when_camera_off() {
        let mut s = session(vec![]);
        let mut source = OneFrame(Some(frame()));
        assert!(s.tick(&mut source).unwrap().is_none());
        assert!(source.0.is_some());

        s.start_camera();
        assert!(s.tick(&mut source).unwrap().is_some());
        assert!(s.tick(&mut source).unwrap().is_none());
    }

    #[test]
    fn test_sessions_are_independent() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let gallery = Arc::new(GalleryCache::new());
        let mut a = Session::new(
            Arc::clone(&store),
            Arc::clone(&gallery),
            QueuedEncoder { answers: vec![vec![face(vec![1.0])]].into(), calls: 0 },
        );
        let b = Session::new(store, gallery, QueuedEncoder::default());

        a.start_camera();
        a.capture_template(&frame()).unwrap();
        assert!(a.has_pending_template());
        assert!(!b.has_pending_template());
        assert!(!b.is_camera_on());
    }

    #[test]
    fn test_labels_reach_annotated_frame() {
        let font = [
            "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
            "/usr/share/fonts/dejavu/DejaVuSans.ttf",
            "/usr/share/fonts/TTF/DejaVuSans.ttf",
        ]
        .iter()
        .find_map(|p| LabelFont::from_file(p).ok());
        let Some(font) = font else {
            return;
        };

        let wide = DetectedFace {
            location: BoundingBox { top: 10, right: 150, bottom: 100, left: 10 },
            template: Template::new(vec![9.0]),
        };
        let mut s = session(vec![vec![wide]]).with_label_font(font);
        s.start_camera();
        let outcome = s.process_frame(RgbImage::new(640, 480)).unwrap();
        assert_eq!(outcome.labels, vec!["Unknown"]);

        // Label bar spans rows 365..400 of the scaled box; text is white.
        let white = (366..399)
            .flat_map(|y| (42..598).map(move |x| (x, y)))
            .filter(|&(x, y)| outcome.annotated.get_pixel(x, y)[1] > 128)
            .count();
        assert!(white > 0, "label text not drawn");
    }
}
