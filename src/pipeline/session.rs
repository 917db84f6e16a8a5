use tracing::{debug, warn};

use super::interfaces::QuerySession;

/// Owns a worker's query session and closes it exactly once
///
/// Call [`SessionGuard::close`] on the normal path. If the guard is dropped
/// first (error, timeout, cancellation) the close runs on a spawned task.
pub struct SessionGuard {
    unit: String,
    session: Option<Box<dyn QuerySession>>,
}

impl SessionGuard {
    pub fn new(unit: impl Into<String>, session: Box<dyn QuerySession>) -> Self {
        Self {
            unit: unit.into(),
            session: Some(session),
        }
    }

    /// The open session; `None` once closed
    pub fn session(&mut self) -> Option<&mut (dyn QuerySession + 'static)> {
        self.session.as_deref_mut()
    }

    pub async fn close(mut self) {
        if let Some(mut session) = self.session.take() {
            match session.close().await {
                Ok(()) => debug!(unit = %self.unit, "Closed query session"),
                Err(e) => warn!(unit = %self.unit, error = %e, "Failed to close query session"),
            }
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        let unit = std::mem::take(&mut self.unit);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match session.close().await {
                        Ok(()) => debug!(unit = %unit, "Closed abandoned query session"),
                        Err(e) => warn!(unit = %unit, error = %e, "Failed to close abandoned query session"),
                    }
                });
            }
            Err(_) => warn!(unit = %unit, "No runtime to close query session on drop"),
        }
    }
}
