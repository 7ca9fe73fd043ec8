//! Hello handshake: identity claim, validation, and commit.
//!
//! The identity is reserved *before* any await so a second socket racing the
//! same (userId, role, eaId) is turned away instead of interleaving. The
//! connection handle is only bound to the session once every check passes;
//! a rejected connection gets exactly one error frame and a delayed close.

use tracing::{info, warn};

use crate::broker::Broker;
use crate::collaborators::AuditEntry;
use crate::protocol::{error_frame, HelloMsg};
use crate::registry::{ConnHandle, DuplicateCheck, ReserveOutcome, SessionKey};

pub enum HelloOutcome {
    Accepted(SessionKey),
    Rejected { code: &'static str },
}

pub async fn process_hello(broker: &Broker, conn: &ConnHandle, hello: HelloMsg) -> HelloOutcome {
    let key = SessionKey {
        user_id: hello.user_id.clone(),
        role: hello.role,
        ea_id: hello.ea_id.clone(),
    };

    if matches!(broker.registry.reserve(&key, conn.id).await, ReserveOutcome::Busy) {
        return reject(broker, conn, &key, "duplicate_ea", "handshake already in progress").await;
    }

    // Identity is held; validation below may await freely.
    let account = match broker.accounts.lookup(&hello.user_id).await {
        Ok(found) => found,
        Err(e) => {
            warn!(user_id = %hello.user_id, error = %e, "account lookup failed");
            None
        }
    };
    let valid = account.as_ref().is_some_and(|a| !a.blocked);
    if !valid {
        return reject(broker, conn, &key, "invalid_userid", "unknown or blocked user").await;
    }

    if matches!(
        broker.registry.duplicate_check(&key, conn.id).await,
        DuplicateCheck::AliveElsewhere
    ) {
        return reject(broker, conn, &key, "duplicate_ea", "identity already connected").await;
    }

    if let Some(account_number) = hello.account_number.as_deref() {
        if broker
            .registry
            .account_conflict(&hello.user_id, hello.role, account_number)
            .await
        {
            return reject(
                broker,
                conn,
                &key,
                "account_conflict",
                "account already serves the opposite role",
            )
            .await;
        }
    }

    broker
        .registry
        .commit(
            &key,
            conn.id,
            conn.clone(),
            hello.account_number.clone(),
            hello.broker.clone(),
            hello.symbol.clone(),
        )
        .await;

    // Stored settings win; a hello carrying settings seeds the store on
    // first contact.
    let stored = match broker.settings.load(&key.user_id, &key.ea_id).await {
        Ok(s) => s,
        Err(e) => {
            warn!(ea_id = %key.ea_id, error = %e, "settings load failed");
            None
        }
    };
    let effective = match (stored, hello.settings) {
        (Some(s), _) => Some(s),
        (None, Some(from_hello)) => {
            if let Err(e) = broker
                .settings
                .save(&key.user_id, &key.ea_id, &from_hello)
                .await
            {
                warn!(ea_id = %key.ea_id, error = %e, "settings save failed");
            } else {
                broker
                    .record_audit(AuditEntry::settings_updated(&key.user_id, &key.ea_id))
                    .await;
            }
            Some(from_hello)
        }
        (None, None) => None,
    };
    if let Some(settings) = effective {
        broker
            .registry
            .with_session_by_conn(conn.id, |s| s.settings = settings)
            .await;
    }

    broker
        .record_audit(AuditEntry::ea_connected(&key, hello.account_number.as_deref()))
        .await;
    broker.broadcast("hello", serde_json::to_value(&key).unwrap_or_default());
    info!(
        user_id = %key.user_id,
        role = key.role.as_str(),
        ea_id = %key.ea_id,
        "hello accepted"
    );
    HelloOutcome::Accepted(key)
}

async fn reject(
    broker: &Broker,
    conn: &ConnHandle,
    key: &SessionKey,
    code: &'static str,
    message: &str,
) -> HelloOutcome {
    warn!(
        user_id = %key.user_id,
        role = key.role.as_str(),
        ea_id = %key.ea_id,
        code,
        "hello rejected"
    );
    conn.send_json(&error_frame(code, message));
    conn.close_after(broker.config.reject_flush_delay());
    broker.registry.abort_reservation(key, conn.id).await;
    broker
        .record_audit(AuditEntry::warning(&key.user_id, format!("hello rejected: {code}")))
        .await;
    HelloOutcome::Rejected { code }
}
