//! Pipeline progress reporting.
//!
//! The pipelines report what they're doing as events through a callback
//! interface; they do not own a UI. The default sink drops everything.

/// One observable step of a load or publish pipeline.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    /// A repository holding the requested version was picked.
    Resolved { repository: String, version: String },
    /// The plan is known: this many archives cover this many files.
    PlanReady { archives: usize, files: usize },
    /// A file was hard-linked or copied from a sibling version.
    FileReused { path: String },
    /// An archive finished downloading and unpacking.
    ArchiveFetched { fingerprint: String, files: usize },
    /// A media file was handed to the audio converter.
    FileTransformed { path: String },
    /// A file failed permanently (retries exhausted); the pipeline goes on.
    FileFailed { path: String, cause: String },
    /// Publish: a file's checksum was computed during discovery.
    FileDiscovered { path: String },
    /// Publish: an archive was packed and uploaded.
    ArchiveUploaded { key: String },
    /// Publish: the dependency table was uploaded.
    TableUploaded { key: String },
    /// Publish: the header went up, the version is now visible.
    HeaderPublished { key: String },
    /// The pipeline finished (successfully or not).
    Complete,
}

/// Progress callback. Implementations must be cheap and non-blocking; events
/// fire from worker tasks.
pub trait Progress: Send + Sync {
    fn event(&self, event: ProgressEvent) {
        _ = event;
    }
}

/// The default sink: drops every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullProgress;
impl Progress for NullProgress {}
