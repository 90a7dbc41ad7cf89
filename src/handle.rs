//! Lifecycle handle for host bindings.
//!
//! ```text
//!            open             close
//! Created ─────────▶ Open ─────────▶ Closed
//!    │                ▲                │
//!    │                └──── open ──────┘
//!    └──── destroy ───────────────────────▶ (dropped)
//! ```
//!
//! Calls that do not match the current state fail with
//! `InvalidHandleState` and leave the state unchanged. All transitions
//! happen under one mutex, so a handle may be shared between threads.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use crate::config::{AccessFlags, OpenOptions};
use crate::container::Container;
use crate::error::{PffError, Result};

enum State {
    Created,
    Open(Box<Container>),
    Closed,
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::Created => "created",
            State::Open(_) => "open",
            State::Closed  => "closed",
        }
    }
}

pub struct FileHandle {
    state: Mutex<State>,
}

impl FileHandle {
    pub fn create() -> Self {
        Self { state: Mutex::new(State::Created) }
    }

    fn lock(&self, operation: &'static str) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| PffError::InvalidHandleState { operation, state: "poisoned" })
    }

    pub fn open(&self, path: impl AsRef<Path>, access: AccessFlags) -> Result<()> {
        self.open_with(path, OpenOptions::default().access(access))
    }

    pub fn open_with(&self, path: impl AsRef<Path>, options: OpenOptions) -> Result<()> {
        let mut state = self.lock("open")?;
        if let State::Open(_) = *state {
            return Err(PffError::InvalidHandleState { operation: "open", state: state.name() });
        }
        let container = Container::open(path.as_ref(), options)?;
        debug!(path = %path.as_ref().display(), "handle opened");
        *state = State::Open(Box::new(container));
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        let mut state = self.lock("close")?;
        match std::mem::replace(&mut *state, State::Closed) {
            State::Open(container) => container.close(),
            other => {
                let name = other.name();
                *state = other;
                Err(PffError::InvalidHandleState { operation: "close", state: name })
            }
        }
    }

    /// Release the handle. Only valid when no container is open; the
    /// handle is consumed either way.
    pub fn destroy(self) -> Result<()> {
        let state = self
            .state
            .into_inner()
            .map_err(|_| PffError::InvalidHandleState { operation: "destroy", state: "poisoned" })?;
        match state {
            State::Open(_) => Err(PffError::InvalidHandleState { operation: "destroy", state: "open" }),
            State::Created | State::Closed => Ok(()),
        }
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().is_ok_and(|s| matches!(*s, State::Open(_)))
    }

    /// Run `f` against the open container.
    pub fn with_container<T>(&self, f: impl FnOnce(&Container) -> Result<T>) -> Result<T> {
        let state = self.lock("use")?;
        match &*state {
            State::Open(container) => f(container),
            other => Err(PffError::InvalidHandleState { operation: "use", state: other.name() }),
        }
    }
}

impl Default for FileHandle {
    fn default() -> Self {
        Self::create()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::header::FormatVariant;
    use crate::writer::{BuildOptions, ContainerBuilder};

    fn fixture() -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        let built = ContainerBuilder::new(BuildOptions::new(FormatVariant::Ansi)).build().unwrap();
        built.write_to(file.path()).unwrap();
        file
    }

    #[test]
    fn full_lifecycle() {
        let file = fixture();
        let handle = FileHandle::create();
        handle.open(file.path(), AccessFlags::READ).unwrap();
        assert!(handle.is_open());
        let children = handle.with_container(|c| Ok(c.open_root()?.children().count())).unwrap();
        assert_eq!(children, 0);
        handle.close().unwrap();
        handle.open(file.path(), AccessFlags::READ).unwrap();
        handle.close().unwrap();
        handle.destroy().unwrap();
    }

    #[test]
    fn misuse_is_rejected() {
        let file = fixture();
        let handle = FileHandle::create();
        assert_eq!(handle.close().unwrap_err().kind(), ErrorKind::InvalidHandleState);
        assert_eq!(handle.with_container(|_| Ok(())).unwrap_err().kind(), ErrorKind::InvalidHandleState);

        handle.open(file.path(), AccessFlags::READ).unwrap();
        assert_eq!(handle.open(file.path(), AccessFlags::READ).unwrap_err().kind(), ErrorKind::InvalidHandleState);
        assert!(handle.is_open());
        assert_eq!(handle.destroy().unwrap_err().kind(), ErrorKind::InvalidHandleState);
    }

    #[test]
    fn write_access_is_unsupported() {
        let file = fixture();
        let handle = FileHandle::create();
        let err = handle.open(file.path(), AccessFlags(0x03)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(!handle.is_open());
        handle.destroy().unwrap();
    }
}
