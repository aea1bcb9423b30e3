use crate::gallery::GalleryEntry;
use crate::types::Template;

/// Distance tolerance under which two templates are the same person.
pub const DEFAULT_TOLERANCE: f32 = 0.6;

/// Label drawn on faces that match nobody in the gallery.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Pairwise "same person" decision under a tolerance.
pub trait Comparator {
    fn same_identity(&self, a: &Template, b: &Template, tolerance: f32) -> bool;
}

/// Euclidean-distance comparator: same person when distance <= tolerance.
#[derive(Debug, Default, Clone, Copy)]
pub struct EuclideanComparator;

impl Comparator for EuclideanComparator {
    fn same_identity(&self, a: &Template, b: &Template, tolerance: f32) -> bool {
        a.euclidean_distance(b) <= tolerance
    }
}

/// Result of identifying a probe template against the gallery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identification {
    Known(String),
    Unknown,
}

impl Identification {
    pub fn student_id(&self) -> Option<&str> {
        match self {
            Identification::Known(id) => Some(id),
            Identification::Unknown => None,
        }
    }

    /// Display label: the student id, or [`UNKNOWN_LABEL`].
    pub fn label(&self) -> &str {
        self.student_id().unwrap_or(UNKNOWN_LABEL)
    }
}

/// Strategy for deciding which enrolled identity a probe belongs to.
pub trait Matcher {
    fn identify(&self, probe: &Template, gallery: &[GalleryEntry], tolerance: f32) -> Identification;
}

/// First-match-wins gallery scan.
///
/// Returns the first entry in gallery order the comparator accepts, even if
/// a later entry would be closer.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstMatchMatcher<C> {
    comparator: C,
}

impl<C: Comparator> FirstMatchMatcher<C> {
    pub fn new(comparator: C) -> Self {
        Self { comparator }
    }
}

impl<C: Comparator> Matcher for FirstMatchMatcher<C> {
    fn identify(&self, probe: &Template, gallery: &[GalleryEntry], tolerance: f32) -> Identification {
        gallery
            .iter()
            .find(|entry| self.comparator.same_identity(probe, &entry.template, tolerance))
            .map(|entry| Identification::Known(entry.student_id.clone()))
            .unwrap_or(Identification::Unknown)
    }
}
