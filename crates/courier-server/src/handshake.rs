//! Authentication handshake.
//!
//! One request, one response:
//! 1. Client sends a [`HandshakeRequest`] (login, credential hash, intent)
//! 2. Login characters are checked before the store is touched
//! 3. The identity is looked up, then created (register) or verified
//!    (authenticate / register of an existing login)
//! 4. The session is claimed in the [`SessionTable`]
//! 5. Server answers with a [`HandshakeResponse`], whatever the outcome
//!
//! Nothing is retried here; store failures reject the handshake.

use crate::session::{OutboundTx, SessionHandle, SessionTable};
use crate::store::{Identity, Store};
use courier_core::{
    validate_login, CourierError, CourierResult, HandshakeRequest, HandshakeResponse,
    HandshakeStatus, Intent,
};
use tracing::{info, warn};

/// Whether the accepted identity has history to replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// Identity created by this handshake; no backlog.
    Fresh,
    /// Identity existed before; backlog replay follows.
    Returning,
}

/// A successful handshake.
#[derive(Debug)]
pub struct Accepted {
    pub identity: Identity,
    pub session: SessionHandle,
    pub kind: SessionKind,
}

/// Result of [`perform`]: the response to send, plus the session when
/// accepted.
#[derive(Debug)]
pub struct HandshakeOutcome {
    pub response: HandshakeResponse,
    pub accepted: Option<Accepted>,
}

/// Response for a first line that could not be decoded as a handshake.
pub fn malformed_response() -> HandshakeResponse {
    HandshakeResponse {
        login: String::new(),
        credential_hash: String::new(),
        status: HandshakeStatus::Rejected,
    }
}

/// Run the handshake for one request. `tx` becomes the session's outbound
/// channel if the handshake is accepted.
pub async fn perform(
    request: &HandshakeRequest,
    store: &dyn Store,
    sessions: &SessionTable,
    tx: OutboundTx,
    now: i64,
) -> HandshakeOutcome {
    match accept(request, store, sessions, tx, now).await {
        Ok(accepted) => {
            info!(
                login = %accepted.identity.login,
                session_id = %accepted.session.session_id,
                kind = ?accepted.kind,
                "handshake accepted"
            );
            HandshakeOutcome {
                response: HandshakeResponse::for_request(request, HandshakeStatus::Accepted),
                accepted: Some(accepted),
            }
        }
        Err(e) => {
            warn!(login = %request.login.escape_debug(), intent = ?request.intent, error = %e, "handshake rejected");
            let status = match e {
                CourierError::AlreadyOnline(_) => HandshakeStatus::AlreadyOnline,
                _ => HandshakeStatus::Rejected,
            };
            HandshakeOutcome {
                response: HandshakeResponse::for_request(request, status),
                accepted: None,
            }
        }
    }
}

async fn accept(
    request: &HandshakeRequest,
    store: &dyn Store,
    sessions: &SessionTable,
    tx: OutboundTx,
    now: i64,
) -> CourierResult<Accepted> {
    validate_login(&request.login)?;
    // Normalised hex, so comparisons with the stored hash are exact.
    let credential_hash = request.credential()?.to_hex();

    let existing = store.get_identity_by_login(&request.login).await?;
    let (identity, kind) = match (existing, request.intent) {
        (None, Intent::Authenticate) => {
            return Err(CourierError::AuthFailed("no such user".into()));
        }
        (None, Intent::Register) => {
            let created_at = if request.timestamp > 0 {
                request.timestamp
            } else {
                now
            };
            let identity = store
                .create_identity(&request.login, &credential_hash, created_at)
                .await?;
            info!(login = %identity.login, id = identity.id, "identity registered");
            (identity, SessionKind::Fresh)
        }
        (Some(identity), _) => {
            if identity.credential_hash != credential_hash {
                return Err(CourierError::AuthFailed("invalid credential".into()));
            }
            if identity.online || sessions.is_online(&identity.login).await {
                return Err(CourierError::AlreadyOnline(identity.login));
            }
            (identity, SessionKind::Returning)
        }
    };

    store.set_online(identity.id, true).await?;

    let session = SessionHandle::new(&identity.login, identity.id, tx);
    if let Err(e) = sessions.register(session.clone()).await {
        // Lost a race with a concurrent handshake. The flag belongs to the
        // winner while its session lives; only clear it if nobody holds one.
        if !sessions.is_online(&identity.login).await {
            if let Err(rollback) = store.set_online(identity.id, false).await {
                warn!(login = %identity.login, error = %rollback, "online flag rollback failed");
            }
        }
        return Err(e);
    }

    let identity = Identity {
        online: true,
        ..identity
    };
    Ok(Accepted {
        identity,
        session,
        kind,
    })
}
