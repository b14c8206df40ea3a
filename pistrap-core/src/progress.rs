//! Progress reporting for the long-running stages.
//!
//! The core never draws anything itself. Front-ends implement [`Progress`]
//! and get told when a stage starts, how far it has got and when it ends.

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Download,
    Decompress,
    Write,
}

impl Stage {
    pub fn label(self) -> &'static str {
        match self {
            Stage::Download => "Download",
            Stage::Decompress => "Decompress",
            Stage::Write => "Writing",
        }
    }
}

pub trait Progress {
    /// `total` is in bytes when known. For decompression it is the size of
    /// the compressed input, and `update` reports compressed bytes consumed.
    fn begin(&self, stage: Stage, total: Option<u64>);
    fn update(&self, stage: Stage, done: u64);
    fn finish(&self, stage: Stage);
}

/// Discards everything.
pub struct NoProgress;

impl Progress for NoProgress {
    fn begin(&self, _stage: Stage, _total: Option<u64>) {}
    fn update(&self, _stage: Stage, _done: u64) {}
    fn finish(&self, _stage: Stage) {}
}
