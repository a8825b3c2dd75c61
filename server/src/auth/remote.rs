//! Remote MFA: a pending login parks here until another logged-in device
//! of the same user approves or denies it, or two minutes pass.

use crate::error::{ServerError, ServerResult};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(120);

struct Pending {
    user_id: u64,
    created: i64,
    tx: oneshot::Sender<bool>,
}

#[derive(Default)]
pub struct RemoteMfa {
    pending: Mutex<HashMap<String, Pending>>,
}

impl RemoteMfa {
    pub fn new() -> RemoteMfa {
        RemoteMfa::default()
    }

    /// Parks the caller until approval, denial or timeout. The entry
    /// removes itself on every exit path.
    pub async fn wait(&self, user_id: u64, now: i64) -> ServerResult<()> {
        let session_id: String = {
            let raw: [u8; 16] = rand::thread_rng().gen();
            base64::encode_config(raw, base64::URL_SAFE_NO_PAD)
        };
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(
            session_id.clone(),
            Pending {
                user_id,
                created: now,
                tx,
            },
        );

        let outcome = tokio::time::timeout(WAIT_TIMEOUT, rx).await;
        self.pending.lock().unwrap().remove(&session_id);

        match outcome {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) | Ok(Err(_)) => Err(ServerError::InvalidCredentials),
            Err(_) => Err(ServerError::Timeout),
        }
    }

    /// Pending requests another device of the same user can see.
    pub fn pending_for(&self, user_id: u64) -> Vec<(String, i64)> {
        self.pending
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, p)| p.user_id == user_id)
            .map(|(id, p)| (id.clone(), p.created))
            .collect()
    }

    /// Resolves one pending request. Only the owning user may answer it.
    pub fn resolve(&self, session_id: &str, user_id: u64, approve: bool) -> ServerResult<()> {
        let mut pending = self.pending.lock().unwrap();
        match pending.get(session_id) {
            None => Err(ServerError::NotFound),
            Some(p) if p.user_id != user_id => Err(ServerError::NotAuthorized),
            Some(_) => {
                let p = pending.remove(session_id).unwrap();
                let _ = p.tx.send(approve);
                Ok(())
            }
        }
    }
}
