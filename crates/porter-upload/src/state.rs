use porter_types::SessionCursor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPhase {
    NotStarted,
    SessionStarted,
    Appending,
    /// The closing chunk is in flight.
    Finishing,
    Complete,
    Failed,
}

/// Where one file's upload session stands.
///
/// The offset only moves forward, by the length of each chunk the server
/// accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSessionState {
    phase: UploadPhase,
    session_id: Option<String>,
    offset: u64,
    retries: u32,
}

impl Default for UploadSessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl UploadSessionState {
    pub fn new() -> Self {
        Self {
            phase: UploadPhase::NotStarted,
            session_id: None,
            offset: 0,
            retries: 0,
        }
    }

    pub fn phase(&self) -> UploadPhase {
        self.phase
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn cursor(&self) -> Option<SessionCursor> {
        self.session_id.as_ref().map(|session_id| SessionCursor {
            session_id: session_id.clone(),
            offset: self.offset,
        })
    }

    /// The start call was accepted with `len` bytes.
    pub fn started(&mut self, session_id: String, len: u64, closed: bool) {
        debug_assert_eq!(self.phase, UploadPhase::NotStarted);
        self.session_id = Some(session_id);
        self.offset = len;
        self.phase = if closed {
            UploadPhase::Complete
        } else {
            UploadPhase::SessionStarted
        };
    }

    pub fn appending(&mut self, closing: bool) {
        debug_assert!(matches!(
            self.phase,
            UploadPhase::SessionStarted | UploadPhase::Appending
        ));
        self.phase = if closing {
            UploadPhase::Finishing
        } else {
            UploadPhase::Appending
        };
    }

    pub fn retrying(&mut self) {
        self.retries += 1;
    }

    /// An append at `offset` was accepted with `len` bytes.
    pub fn appended(&mut self, offset: u64, len: u64) {
        debug_assert_eq!(offset, self.offset);
        self.offset = offset + len;
        if self.phase == UploadPhase::Finishing {
            self.phase = UploadPhase::Complete;
        }
    }

    pub fn failed(&mut self) {
        self.phase = UploadPhase::Failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunked_session_walks_every_phase() {
        let mut state = UploadSessionState::new();
        state.started("sess".into(), 100, false);
        assert_eq!(state.phase(), UploadPhase::SessionStarted);

        state.appending(false);
        state.appended(100, 100);
        assert_eq!(state.phase(), UploadPhase::Appending);

        state.appending(true);
        assert_eq!(state.phase(), UploadPhase::Finishing);
        state.retrying();
        state.appended(200, 50);
        assert_eq!(state.phase(), UploadPhase::Complete);
        assert_eq!(
            state.cursor(),
            Some(SessionCursor {
                session_id: "sess".into(),
                offset: 250
            })
        );
        assert_eq!(state.retries(), 1);
    }

    #[test]
    fn closing_start_completes_immediately() {
        let mut state = UploadSessionState::new();
        assert_eq!(state.cursor(), None);
        state.started("sess".into(), 0, true);
        assert_eq!(state.phase(), UploadPhase::Complete);
        assert_eq!(state.offset(), 0);
    }
}
