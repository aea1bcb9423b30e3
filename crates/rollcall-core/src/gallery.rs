//! In-memory gallery of enrolled templates used for live matching.

use crate::store::{Store, StoreError};
use crate::types::Template;
use std::sync::{Arc, RwLock};

/// One enrolled identity and its template.
#[derive(Debug, Clone, PartialEq)]
pub struct GalleryEntry {
    pub student_id: String,
    pub template: Template,
}

/// Gallery cache, rebuilt wholesale from the store.
///
/// Readers take an `Arc` snapshot; a reload swaps in a fresh list and never
/// mutates one a reader may be holding.
pub struct GalleryCache {
    entries: RwLock<Arc<[GalleryEntry]>>,
}

impl Default for GalleryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl GalleryCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Arc::from(Vec::new())),
        }
    }

    /// Replace the whole gallery with every student that has a usable
    /// template, in store order. Returns the new gallery size.
    pub fn reload(&self, store: &Store) -> Result<usize, StoreError> {
        let students = store.list_students()?;
        let mut entries = Vec::with_capacity(students.len());

        for student in students {
            if student.face_encoding.is_empty() {
                continue;
            }
            match Template::from_bytes(&student.face_encoding) {
                Some(template) if !template.is_empty() => entries.push(GalleryEntry {
                    student_id: student.student_id,
                    template,
                }),
                _ => tracing::warn!(
                    student_id = %student.student_id,
                    bytes = student.face_encoding.len(),
                    "skipping undecodable face encoding"
                ),
            }
        }

        let count = entries.len();
        let fresh: Arc<[GalleryEntry]> = entries.into();
        match self.entries.write() {
            Ok(mut guard) => *guard = fresh,
            Err(poisoned) => *poisoned.into_inner() = fresh,
        }
        tracing::info!(entries = count, "gallery reloaded");
        Ok(count)
    }

    /// Consistent read-only view of the current gallery.
    pub fn snapshot(&self) -> Arc<[GalleryEntry]> {
        match self.entries.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
