use stomp_client::{Connection, Session, SessionMode};
use tracing::{debug, warn};

use crate::{HarnessContext, HarnessError};

/// Open a connection, anonymous unless the context carries credentials.
pub async fn open_connection(
    ctx: &HarnessContext,
    client_id: Option<&str>,
) -> Result<Box<dyn Connection>, HarnessError> {
    let connection = ctx
        .factory
        .create_connection(ctx.credentials.as_ref(), client_id)
        .await?;
    Ok(connection)
}

/// The connection and session a single worker owns.
pub struct WorkerResources {
    pub connection: Box<dyn Connection>,
    pub session: Box<dyn Session>,
}

impl WorkerResources {
    /// Open a connection and one session on it, then start delivery.
    pub async fn open(
        ctx: &HarnessContext,
        client_id: Option<&str>,
        mode: SessionMode,
    ) -> Result<Self, HarnessError> {
        let connection = open_connection(ctx, client_id).await?;
        let session = match connection.create_session(mode).await {
            Ok(session) => session,
            Err(e) => {
                if let Err(close_err) = connection.close().await {
                    debug!("Failed to close connection after session error: {close_err}");
                }
                return Err(e.into());
            }
        };
        connection.start();
        Ok(WorkerResources {
            connection,
            session,
        })
    }

    /// Close the session, then the connection. Failures are only logged.
    pub async fn release(self) {
        if let Err(e) = self.session.close().await {
            debug!("Failed to close session: {e}");
        }
        if let Err(e) = self.connection.close().await {
            warn!("Failed to close connection: {e}");
        }
    }

    /// Give up ownership without closing anything; the broker keeps seeing an
    /// open connection until the process exits.
    pub fn leak(self) {
        std::mem::forget(self);
    }
}
