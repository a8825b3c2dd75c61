use super::Db;
use crate::error::{ServerError, ServerResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Contact {
    pub user_id: u64,
    pub email: String,
    pub public_key: String,
    pub date_modified: i64,
}

#[derive(Serialize, Deserialize, Clone, Default, Debug)]
pub struct ContactList {
    pub contacts: HashMap<u64, Contact>,
}

fn to_wire(c: &Contact) -> wire::ContactRecord {
    wire::ContactRecord {
        user_id: c.user_id.to_string(),
        email: c.email.clone(),
        public_key: c.public_key.clone(),
        date_modified: c.date_modified,
    }
}

impl Db {
    /// Resolves an email into a contact entry so the client can seal album
    /// keys to that user.
    pub fn add_contact(&self, user: u64, email: &str) -> ServerResult<wire::ContactRecord> {
        let target = self
            .user_by_email(email)?
            .ok_or(ServerError::NotFound)?;
        if target.user_id == user || target.login_disabled {
            return Err(ServerError::NotFound);
        }
        let now = self.now_ms();
        let contact = Contact {
            user_id: target.user_id,
            email: target.email.clone(),
            public_key: base64::encode(&target.public_key),
            date_modified: now,
        };

        let key = Db::contacts_key(user);
        self.store().update::<ContactList, _>(&key, |cur| {
            let mut list = cur.unwrap_or_default();
            list.contacts.insert(target.user_id, contact.clone());
            Ok(list)
        })?;
        Ok(to_wire(&contact))
    }

    pub fn contact_updates(&self, user: u64, since: i64) -> ServerResult<Vec<wire::ContactRecord>> {
        let list: ContactList = self
            .store()
            .snapshot(&Db::contacts_key(user))?
            .unwrap_or_default();
        let mut out: Vec<wire::ContactRecord> = list
            .contacts
            .values()
            .filter(|c| c.date_modified > since)
            .map(to_wire)
            .collect();
        out.sort_by_key(|c| c.date_modified);
        Ok(out)
    }

    /// Makes two users contacts of each other. The caller holds both
    /// contact-list locks.
    pub(crate) fn link_contacts(&self, a: u64, b: u64, now: i64) -> ServerResult<()> {
        for (from, to) in [(a, b), (b, a)] {
            let target = match self.user_by_id(to)? {
                Some(u) => u,
                None => continue,
            };
            let key = Db::contacts_key(from);
            let mut list: ContactList = self.store().snapshot(&key)?.unwrap_or_default();
            list.contacts.insert(
                to,
                Contact {
                    user_id: to,
                    email: target.email,
                    public_key: base64::encode(&target.public_key),
                    date_modified: now,
                },
            );
            self.store().put(&key, &list)?;
        }
        Ok(())
    }
}
