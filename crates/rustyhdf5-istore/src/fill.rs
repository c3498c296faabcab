//! Fill-value policy for chunks that were never written.

/// When fill values are written into newly allocated chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FillTime {
    /// Always fill on allocation.
    Alloc,
    /// Never fill; unwritten data is undefined.
    Never,
    /// Fill only when a user fill value is set.
    #[default]
    IfSet,
}

/// When chunk storage is allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocTime {
    /// Every chunk is allocated when the dataset is created.
    Early,
    /// Allocate on first write.
    Late,
    /// Allocate chunk by chunk as they are written.
    #[default]
    Incremental,
}

/// The element value used for unwritten data.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FillValue {
    /// The library default, all zero bytes.
    #[default]
    Default,
    /// One element's worth of bytes.
    User(Vec<u8>),
}

impl FillValue {
    pub fn is_user_defined(&self) -> bool {
        matches!(self, FillValue::User(_))
    }

    /// Replicate the fill element across `buf`. A trailing partial element
    /// gets the leading bytes of the value.
    pub fn fill(&self, buf: &mut [u8]) {
        match self {
            FillValue::User(value) if !value.is_empty() => {
                for piece in buf.chunks_mut(value.len()) {
                    piece.copy_from_slice(&value[..piece.len()]);
                }
            }
            _ => buf.fill(0),
        }
    }
}

/// Fill time and value viewed together.
#[derive(Debug, Clone, Copy)]
pub struct FillPolicy<'a> {
    pub time: FillTime,
    pub value: &'a FillValue,
}

impl<'a> FillPolicy<'a> {
    pub fn new(time: FillTime, value: &'a FillValue) -> Self {
        Self { time, value }
    }

    /// Whether newly allocated chunk buffers get the fill value.
    pub fn fills_on_alloc(&self) -> bool {
        match self.time {
            FillTime::Alloc => true,
            FillTime::IfSet => self.value.is_user_defined(),
            FillTime::Never => false,
        }
    }

    /// Whether reading never-written data may skip I/O entirely.
    pub fn is_undefined_read(&self) -> bool {
        match self.time {
            FillTime::Never => true,
            FillTime::IfSet => !self.value.is_user_defined(),
            FillTime::Alloc => false,
        }
    }
}
