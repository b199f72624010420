use std::{fmt, io};

use shared_memory;

#[derive(Debug)]
pub enum PipeError {
    SharedMemory(shared_memory::ShmemError),
    Sync(Box<dyn std::error::Error + 'static>),
    Io(io::Error),
    Logic(String),
}

impl fmt::Display for PipeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipeError::SharedMemory(e) => write!(f, "Shared memory error: {}", e),
            PipeError::Sync(e) => write!(f, "Sync primitive error: {}", e),
            PipeError::Io(e) => write!(f, "IO error: {}", e),
            PipeError::Logic(s) => write!(f, "Logic error: {}", s),
        }
    }
}

impl std::error::Error for PipeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipeError::SharedMemory(e) => Some(e),
            PipeError::Sync(e) => Some(e.as_ref()),
            PipeError::Io(e) => Some(e),
            PipeError::Logic(_) => None,
        }
    }
}

impl From<shared_memory::ShmemError> for PipeError {
    fn from(err: shared_memory::ShmemError) -> Self {
        PipeError::SharedMemory(err)
    }
}

impl From<io::Error> for PipeError {
    fn from(err: io::Error) -> Self {
        PipeError::Io(err)
    }
}
