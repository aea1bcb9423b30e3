//! rollcall-core: Student gallery matching and once-per-day attendance.
//!
//! Face detection and encoding are delegated to an external capability
//! behind [`FaceEncoder`]; this crate owns the SQLite store, the in-memory
//! gallery, the first-match identification rule and the session tick.

pub mod annotate;
pub mod audit;
pub mod encoder;
pub mod gallery;
pub mod matcher;
pub mod recorder;
pub mod session;
pub mod store;
pub mod types;

pub use annotate::{FontError, LabelFont};
pub use audit::AuditLog;
pub use encoder::{EncoderError, FaceEncoder, FrameSource};
pub use gallery::{GalleryCache, GalleryEntry};
pub use matcher::{Comparator, EuclideanComparator, FirstMatchMatcher, Identification, Matcher};
pub use recorder::{AttendanceRecorder, Clock, FixedClock, MarkOutcome, SystemClock};
pub use session::{FrameOutcome, Session, SessionError, ValidationError};
pub use store::{RecordOutcome, Store, StoreError};
pub use types::{
    AttendanceEvent, BoundingBox, DetectedFace, ReportRow, Student, Template, DATE_FORMAT,
    TIME_FORMAT,
};
