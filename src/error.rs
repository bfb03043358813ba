use thiserror::Error;

/// Raised by the arena when the active block cannot satisfy a request.
///
/// This is the page-full signal: streaming operators catch it at the
/// boundary of one `fill_next_output_page` call and resume on a fresh page.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaError {
    #[error("out of arena space: need {needed} bytes, {available} left in active block")]
    OutOfArenaSpace { needed: usize, available: usize },
}

#[derive(Error, Debug)]
pub enum PageboundError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Arena(#[from] ArenaError),

    #[error("corrupt record: {0}")]
    CorruptRecord(String),

    #[error("output page of {capacity} bytes cannot hold an empty result container")]
    OutputPageTooSmall { capacity: usize },

    #[error("entry does not fit in an empty output page of {capacity} bytes")]
    EntryExceedsPage { capacity: usize },

    #[error("no output page loaded")]
    NoOutputPage,

    #[error("{operator}: output page is not the arena's active block")]
    OutputPageNotActive { operator: &'static str },

    #[error("invalid input on line {line}: {reason}")]
    InvalidInput { line: usize, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl PageboundError {
    /// True for the recoverable page-full condition.
    pub fn is_out_of_space(&self) -> bool {
        matches!(self, PageboundError::Arena(ArenaError::OutOfArenaSpace { .. }))
    }

    pub(crate) fn corrupt(what: impl Into<String>) -> Self {
        PageboundError::CorruptRecord(what.into())
    }
}

pub type Result<T> = std::result::Result<T, PageboundError>;
